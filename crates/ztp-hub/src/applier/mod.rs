//! Renders templates into objects and installs or removes them in order
//!
//! Objects fall into three classes: namespaces, CRDs and everything else.
//! Apply creates namespaces first, then CRDs (waiting until each one is
//! established), then the rest. Delete runs the classes in reverse and waits
//! for the regular objects to disappear before removing CRDs and namespaces.
//! Kinds listed as cascade owners are never deleted explicitly; removing
//! their namespace takes them away, and deleting them first would make the
//! hub drop the namespace while finalizers of its other objects still run.
//!
//! Every step is reported to the registered listeners as an [`ApplierEvent`],
//! synchronously and in order.

mod events;
mod listener;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ztp_common::query::Query;
use ztp_common::retry::{retry_if, RetryConfig};
use ztp_common::template::{TemplateEngine, TemplateFs};
use ztp_common::yaml::parse_yaml_multi;

use crate::client::{gvk_of, HubClient, ListOptions, ObjectKey, WatchEvent};
use crate::gvks::{self, Gvk};
use crate::{Error, Result};

pub use events::{ApplierEvent, EventKind, Listener};
pub use listener::ApplierListener;

const ESTABLISHED: &str = r#"try .status.conditions[] | select(.type == "Established") | .status"#;
const DEFAULT_DISAPPEAR_INTERVAL: Duration = Duration::from_secs(10);

/// Builds an [`Applier`]
#[derive(Default)]
pub struct ApplierBuilder {
    client: Option<Arc<dyn HubClient>>,
    fs: Option<Arc<dyn TemplateFs>>,
    root: Option<String>,
    dirs: Vec<String>,
    labels: BTreeMap<String, String>,
    listeners: Vec<Listener>,
    cascade_owners: Option<Vec<Gvk>>,
    crd_timeout: Option<Duration>,
    delete_timeout: Option<Duration>,
    disappear_interval: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl ApplierBuilder {
    /// Client used to create and delete objects; required
    pub fn client(mut self, client: Arc<dyn HubClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Template tree; required
    pub fn fs(mut self, fs: Arc<dyn TemplateFs>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Directory of the tree holding all templates, including ones that are
    /// only reached through `execute`; required
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Directory below the root whose templates produce objects; may be
    /// repeated, the whole root is used when none is given
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dirs.push(dir.into());
        self
    }

    /// Label merged into every created object
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Labels merged into every created object
    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Register a listener; listeners run in registration order
    pub fn listener(mut self, listener: impl Fn(&ApplierEvent) + Send + Sync + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Kinds left for the namespace cascade on delete, ClusterDeployment by
    /// default
    pub fn cascade_owners(mut self, owners: Vec<Gvk>) -> Self {
        self.cascade_owners = Some(owners);
        self
    }

    /// Limit on waiting for CRDs to be established
    pub fn crd_timeout(mut self, timeout: Duration) -> Self {
        self.crd_timeout = Some(timeout);
        self
    }

    /// Limit on waiting for deleted objects to disappear
    pub fn delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = Some(timeout);
        self
    }

    /// How often `WaitingDisappear` is repeated while an object lingers
    pub fn disappear_interval(mut self, interval: Duration) -> Self {
        self.disappear_interval = Some(interval);
        self
    }

    /// Token that aborts running operations
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Load the templates and create the applier
    pub fn build(self) -> Result<Applier> {
        let client = self
            .client
            .ok_or_else(|| Error::internal_with_context("applier", "client is mandatory"))?;
        let fs = self
            .fs
            .ok_or_else(|| Error::internal_with_context("applier", "template tree is mandatory"))?;
        let root = self
            .root
            .ok_or_else(|| Error::internal_with_context("applier", "template root is mandatory"))?;

        let engine = TemplateEngine::new(fs.as_ref(), &root)?;
        let dirs = if self.dirs.is_empty() {
            vec![".".to_string()]
        } else {
            self.dirs
        };
        let templates: Vec<String> = engine
            .names()
            .into_iter()
            .filter(|name| dirs.iter().any(|dir| in_dir(name, dir)))
            .collect();
        if templates.is_empty() {
            return Err(Error::TemplateNotFound {
                name: format!("{}/{}", root, dirs.join(",")),
            });
        }
        debug!(root = %root, dirs = ?dirs, templates = ?templates, "Loaded applier templates");

        Ok(Applier {
            client,
            engine,
            templates,
            labels: self.labels,
            listeners: self.listeners,
            cascade_owners: self
                .cascade_owners
                .unwrap_or_else(|| vec![gvks::CLUSTER_DEPLOYMENT]),
            crd_timeout: self.crd_timeout,
            delete_timeout: self.delete_timeout,
            disappear_interval: self.disappear_interval.unwrap_or(DEFAULT_DISAPPEAR_INTERVAL),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

fn in_dir(name: &str, dir: &str) -> bool {
    let dir = dir.trim_matches('/');
    dir.is_empty() || dir == "." || name.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Creates and deletes the objects produced by a template directory
pub struct Applier {
    client: Arc<dyn HubClient>,
    engine: TemplateEngine,
    templates: Vec<String>,
    labels: BTreeMap<String, String>,
    listeners: Vec<Listener>,
    cascade_owners: Vec<Gvk>,
    crd_timeout: Option<Duration>,
    delete_timeout: Option<Duration>,
    disappear_interval: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("templates", &self.templates)
            .field("labels", &self.labels)
            .field("listeners", &self.listeners.len())
            .field("cascade_owners", &self.cascade_owners)
            .finish_non_exhaustive()
    }
}

/// Rendered objects split by installation phase
#[derive(Default)]
struct Classified {
    namespaces: Vec<DynamicObject>,
    crds: Vec<DynamicObject>,
    regular: Vec<DynamicObject>,
}

fn classify(objects: Vec<DynamicObject>) -> Result<Classified> {
    let mut classes = Classified::default();
    for object in objects {
        let gvk = gvk_of(&object)?;
        if gvks::NAMESPACE.matches(&gvk) {
            classes.namespaces.push(object);
        } else if gvks::CRD.matches(&gvk) {
            classes.crds.push(object);
        } else {
            classes.regular.push(object);
        }
    }
    Ok(classes)
}

/// Remove and return a non-empty status subtree
fn take_status(object: &mut DynamicObject) -> Option<Value> {
    let status = object.data.as_object_mut()?.remove("status")?;
    match &status {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        _ => Some(status),
    }
}

fn describe(object: &DynamicObject) -> String {
    match ObjectKey::of(object) {
        Ok(key) => key.to_string(),
        Err(_) => object.metadata.name.clone().unwrap_or_default(),
    }
}

impl Applier {
    /// Start building an applier
    pub fn builder() -> ApplierBuilder {
        ApplierBuilder::default()
    }

    /// Names of the templates that produce objects, in render order
    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    /// Render every template with `data` into objects, without touching the
    /// hub
    pub fn render<T: Serialize + ?Sized>(&self, data: &T) -> Result<Vec<DynamicObject>> {
        let mut objects = Vec::new();
        for template in &self.templates {
            let output = self.engine.render(template, data)?;
            let documents = parse_yaml_multi(&output).map_err(|e| {
                Error::template_render(template, format!("failed to decode generated YAML: {}", e))
            })?;
            for document in documents {
                objects.push(decode_object(template, document)?);
            }
        }
        debug!(objects = objects.len(), "Rendered objects");
        Ok(objects)
    }

    /// Create everything the templates produce
    ///
    /// Objects that already exist are left alone. Nothing created before a
    /// failure is rolled back; running again converges.
    pub async fn apply<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let classes = classify(self.render(data)?)?;
        info!(
            namespaces = classes.namespaces.len(),
            crds = classes.crds.len(),
            objects = classes.regular.len(),
            "Applying objects"
        );
        for object in &classes.namespaces {
            self.apply_object(object).await?;
        }
        self.apply_crds(&classes.crds).await?;
        for object in &classes.regular {
            self.apply_object(object).await?;
        }
        Ok(())
    }

    /// Delete everything the templates produce, in reverse order
    pub async fn delete<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let objects: Vec<DynamicObject> = self
            .render(data)?
            .into_iter()
            .filter(|object| {
                let owner = self.is_cascade_owner(object);
                if owner {
                    debug!(object = %describe(object), "Leaving object to namespace cascade");
                }
                !owner
            })
            .collect();
        let classes = classify(objects)?;
        info!(
            namespaces = classes.namespaces.len(),
            crds = classes.crds.len(),
            objects = classes.regular.len(),
            "Deleting objects"
        );

        let mut deleted = Vec::new();
        for object in classes.regular.iter().rev() {
            if self.delete_object(object).await? {
                deleted.push(object.clone());
            }
        }
        self.wait_disappear(&deleted).await?;

        for object in classes.crds.iter().rev() {
            self.delete_object(object).await?;
        }
        for object in classes.namespaces.iter().rev() {
            self.delete_object(object).await?;
        }
        Ok(())
    }

    fn is_cascade_owner(&self, object: &DynamicObject) -> bool {
        gvk_of(object).is_ok_and(|gvk| self.cascade_owners.iter().any(|owner| owner.matches(&gvk)))
    }

    fn fire(&self, kind: EventKind, object: &DynamicObject, error: Option<Error>) {
        let event = ApplierEvent::new(kind, object.clone(), error);
        event.log();
        for listener in &self.listeners {
            listener(&event);
        }
    }

    /// Run `operation` unless the applier is cancelled first
    async fn guard<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled("operation cancelled")),
            result = operation => result,
        }
    }

    /// Like [`Applier::guard`], failing with `on_timeout` after `limit`
    async fn bounded<T>(
        &self,
        limit: Option<Duration>,
        on_timeout: impl FnOnce() -> Error,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.guard(async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, operation)
                    .await
                    .map_err(|_| on_timeout())?,
                None => operation.await,
            }
        })
        .await
    }

    async fn apply_object(&self, object: &DynamicObject) -> Result<()> {
        let mut copy = object.clone();
        copy.metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(self.labels.clone());
        let status = take_status(&mut copy);

        match self.guard(self.client.create(&copy)).await {
            Ok(_) => self.fire(EventKind::ObjectCreated, object, None),
            Err(e) if e.is_already_exists() => self.fire(EventKind::ObjectExists, object, None),
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => {
                let failure = Error::CreateError {
                    object: describe(object),
                    message: e.to_string(),
                };
                self.fire(EventKind::CreateError, object, Some(e));
                return Err(failure);
            }
        }

        if let Some(status) = status {
            self.update_status(object, &copy, status).await?;
        }
        Ok(())
    }

    /// Re-attach a status removed before create, retrying on conflicts
    async fn update_status(&self, object: &DynamicObject, copy: &DynamicObject, status: Value) -> Result<()> {
        let key = ObjectKey::of(copy)?;
        let result = self
            .guard(retry_if(
                &RetryConfig::status_conflict(),
                "update_status",
                |e: &Error| e.is_conflict(),
                || {
                    let client = self.client.clone();
                    let key = key.clone();
                    let status = status.clone();
                    async move {
                        let mut current = client.get(&key).await?;
                        if let Some(map) = current.data.as_object_mut() {
                            map.insert("status".to_string(), status);
                        }
                        client.status().update(&current).await
                    }
                },
            ))
            .await;

        match result {
            Ok(_) => {
                self.fire(EventKind::StatusUpdated, object, None);
                Ok(())
            }
            Err(e @ Error::Cancelled { .. }) => Err(e),
            Err(e) => {
                let failure = Error::StatusError {
                    object: describe(object),
                    message: e.to_string(),
                };
                self.fire(EventKind::StatusError, object, Some(e));
                Err(failure)
            }
        }
    }

    /// Create CRDs without their status, then wait until all are established
    async fn apply_crds(&self, crds: &[DynamicObject]) -> Result<()> {
        if crds.is_empty() {
            return Ok(());
        }
        for crd in crds {
            let mut crd = crd.clone();
            take_status(&mut crd);
            self.apply_object(&crd).await?;
        }
        self.wait_established(crds).await
    }

    async fn wait_established(&self, crds: &[DynamicObject]) -> Result<()> {
        let established = Query::compile(ESTABLISHED)?;
        let mut pending: BTreeSet<String> = crds
            .iter()
            .filter_map(|crd| crd.metadata.name.clone())
            .collect();
        for crd in crds {
            self.fire(EventKind::WaitingCrd, crd, None);
        }

        let what = format!("CRDs {}", pending.iter().cloned().collect::<Vec<_>>().join(", "));
        let mut watch = self
            .guard(self.client.watch(&gvks::CRD.gvk(), &ListOptions::default()))
            .await?;

        self.bounded(self.crd_timeout, || Error::ApplyTimeout { what }, async {
            while let Some(event) = watch.next().await {
                let (WatchEvent::Added(crd) | WatchEvent::Modified(crd)) = event else {
                    continue;
                };
                let Some(name) = crd.metadata.name.as_deref() else {
                    continue;
                };
                if !pending.contains(name) {
                    continue;
                }
                let statuses: Vec<String> = established.extract(&crd)?;
                if !statuses.iter().any(|s| s == "True") {
                    continue;
                }
                debug!(crd = %name, "CRD established");
                pending.remove(name);
                if pending.is_empty() {
                    return Ok(());
                }
            }
            Err(Error::internal_with_context("watch", "CRD watch ended before all CRDs were established"))
        })
        .await
    }

    /// Delete one object; `true` if the server accepted the deletion
    async fn delete_object(&self, object: &DynamicObject) -> Result<bool> {
        match self.guard(self.client.delete(object)).await {
            Ok(()) => {
                self.fire(EventKind::ObjectDeleted, object, None);
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                self.fire(EventKind::ObjectNotExist, object, None);
                Ok(false)
            }
            Err(e @ Error::Cancelled { .. }) => Err(e),
            Err(e) => {
                let failure = Error::DeleteError {
                    object: describe(object),
                    message: e.to_string(),
                };
                self.fire(EventKind::DeleteError, object, Some(e));
                Err(failure)
            }
        }
    }

    /// Block until every object in `objects` is gone from the server
    async fn wait_disappear(&self, objects: &[DynamicObject]) -> Result<()> {
        let mut lingering = Vec::new();
        for object in objects {
            let key = ObjectKey::of(object)?;
            if self.is_present(&key).await? {
                self.fire(EventKind::WaitingDisappear, object, None);
                lingering.push((key, object));
            }
        }
        if lingering.is_empty() {
            return Ok(());
        }

        let what = lingering
            .iter()
            .map(|(key, _)| key.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.bounded(self.delete_timeout, || Error::DeleteTimeout { what }, async {
            for (key, object) in &lingering {
                self.wait_gone(key, object).await?;
            }
            Ok(())
        })
        .await
    }

    async fn is_present(&self, key: &ObjectKey) -> Result<bool> {
        match self.guard(self.client.get(key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn wait_gone(&self, key: &ObjectKey, object: &DynamicObject) -> Result<()> {
        let options = ListOptions {
            namespace: key.namespace.clone(),
            field_selector: Some(format!("metadata.name={}", key.name)),
            ..Default::default()
        };
        let mut watch = self.client.watch(&key.gvk, &options).await?;
        let start = tokio::time::Instant::now() + self.disappear_interval;
        let mut ticker = tokio::time::interval_at(start, self.disappear_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_present(key).await? {
                        return Ok(());
                    }
                    self.fire(EventKind::WaitingDisappear, object, None);
                }
                event = watch.next() => match event {
                    Some(WatchEvent::Deleted(gone)) if gone.metadata.name.as_deref() == Some(key.name.as_str()) => {
                        debug!(object = %key, "Object disappeared");
                        return Ok(());
                    }
                    Some(_) => {}
                    None => {
                        // The watch ended; fall back to the periodic check
                        if !self.is_present(key).await? {
                            return Ok(());
                        }
                        ticker.tick().await;
                    }
                },
            }
        }
    }
}

/// Turn one rendered YAML document into an object, checking the fields every
/// object must have
fn decode_object(template: &str, document: Value) -> Result<DynamicObject> {
    let kind = document.get("kind").and_then(Value::as_str).unwrap_or_default();
    if kind.is_empty() {
        return Err(Error::template_render(template, "generated object has no kind"));
    }
    let name = document
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if name.is_empty() {
        return Err(Error::template_render(
            template,
            format!("generated {} has no metadata.name", kind),
        ));
    }
    serde_json::from_value(document).map_err(|e| {
        Error::template_render(template, format!("generated object is not valid: {}", e))
    })
}
