use std::fmt;
use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::{debug, warn};

use crate::client::parse_api_version;
use crate::Error;

/// What happened to an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// The object was created
    ObjectCreated,
    /// Create found the object already there
    ObjectExists,
    /// Delete found the object already gone
    ObjectNotExist,
    /// The object was deleted
    ObjectDeleted,
    /// Create failed
    CreateError,
    /// Delete failed
    DeleteError,
    /// The status from the template was written
    StatusUpdated,
    /// Writing the status failed
    StatusError,
    /// Waiting for the CRD to be established
    WaitingCrd,
    /// Waiting for the deleted object to go away
    WaitingDisappear,
}

impl EventKind {
    /// True for the failure kinds
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EventKind::CreateError | EventKind::DeleteError | EventKind::StatusError
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ObjectCreated => "ObjectCreated",
            EventKind::ObjectExists => "ObjectExists",
            EventKind::ObjectNotExist => "ObjectNotExist",
            EventKind::ObjectDeleted => "ObjectDeleted",
            EventKind::CreateError => "CreateError",
            EventKind::DeleteError => "DeleteError",
            EventKind::StatusUpdated => "StatusUpdated",
            EventKind::StatusError => "StatusError",
            EventKind::WaitingCrd => "WaitingCRD",
            EventKind::WaitingDisappear => "WaitingDisappear",
        };
        f.write_str(name)
    }
}

/// One step of an apply or delete, as seen by listeners
#[derive(Clone, Debug)]
pub struct ApplierEvent {
    /// What happened
    pub kind: EventKind,
    /// The rendered object, before labels were added
    pub object: DynamicObject,
    /// Cause, for the error kinds
    pub error: Option<Error>,
}

/// Callback receiving every event
pub type Listener = Arc<dyn Fn(&ApplierEvent) + Send + Sync>;

impl ApplierEvent {
    pub(crate) fn new(kind: EventKind, object: DynamicObject, error: Option<Error>) -> Self {
        Self {
            kind,
            object,
            error,
        }
    }

    /// Kind of the object, e.g. `BareMetalHost`
    pub fn object_kind(&self) -> &str {
        self.object
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or_default()
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects
    pub fn object_name(&self) -> String {
        let name = self.object.metadata.name.as_deref().unwrap_or_default();
        match self.object.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
            _ => name.to_string(),
        }
    }

    pub(crate) fn log(&self) {
        let (group, version) = self
            .object
            .types
            .as_ref()
            .map(|t| parse_api_version(&t.api_version))
            .unwrap_or_default();
        let namespace = self.object.metadata.namespace.as_deref().unwrap_or_default();
        let name = self.object.metadata.name.as_deref().unwrap_or_default();
        match &self.error {
            Some(error) => warn!(
                event = %self.kind,
                group = %group,
                version = %version,
                kind = %self.object_kind(),
                namespace = %namespace,
                name = %name,
                error = %error,
                "Applier event"
            ),
            None => debug!(
                event = %self.kind,
                group = %group,
                version = %version,
                kind = %self.object_kind(),
                namespace = %namespace,
                name = %name,
                "Applier event"
            ),
        }
    }
}
