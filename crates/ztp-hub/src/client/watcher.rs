//! Restartable watch
//!
//! The API server ends every watch on its own timeout and answers `410 Gone`
//! when asked to resume from a resource version it has already compacted.
//! [`pump`] hides both: it reopens the subscription from the last version it
//! saw, and after a `410` it lists the current state and reconciles it with
//! what was already delivered. Consumers get one continuous stream in which
//! every object is `Added` at most once until it is `Deleted`.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{DynamicObject, WatchEvent as KubeWatchEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ztp_common::retry::{retry_with_backoff, RetryConfig};

use super::WatchEvent;
use crate::{Error, Result};

/// Resource version that makes the server start with the current state
const FROM_CURRENT_STATE: &str = "0";
const GONE: u16 = 410;

/// Stream of raw server events for one subscription
pub type EventStream = BoxStream<'static, Result<KubeWatchEvent<DynamicObject>>>;

/// Where a restartable watch gets its subscriptions from
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Open a subscription starting after `version`
    async fn open(&self, version: &str) -> Result<EventStream>;

    /// Current objects and the resource version of that snapshot
    async fn relist(&self) -> Result<(String, Vec<DynamicObject>)>;
}

/// Feed events from `source` into `tx` until `stop` is cancelled or the
/// receiver goes away
pub async fn pump<S: WatchSource>(
    source: S,
    kind: String,
    tx: mpsc::Sender<WatchEvent>,
    stop: CancellationToken,
) {
    let restart = RetryConfig::watch_restart();
    let mut delivered = Delivered::default();
    let mut version = FROM_CURRENT_STATE.to_string();
    let mut relist = false;

    loop {
        if relist {
            let listed = tokio::select! {
                _ = stop.cancelled() => return,
                listed = retry_with_backoff(&restart, "watch_relist", || source.relist()) => listed,
            };
            match listed {
                Ok((listed_version, objects)) => {
                    debug!(kind = %kind, resource_version = %listed_version, objects = objects.len(), "Relisted after expired watch");
                    for event in delivered.reconcile(objects) {
                        if !send(&tx, &stop, event).await {
                            return;
                        }
                    }
                    version = listed_version;
                    relist = false;
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Relist failed, retrying");
                    if !send(&tx, &stop, error_event(&e)).await {
                        return;
                    }
                    continue;
                }
            }
        }

        let opened = tokio::select! {
            _ = stop.cancelled() => return,
            opened = retry_with_backoff(&restart, "watch", || source.open(&version)) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Watch could not be reopened, retrying");
                if !send(&tx, &stop, error_event(&e)).await {
                    return;
                }
                continue;
            }
        };
        debug!(kind = %kind, resource_version = %version, "Watch started");

        loop {
            let item = tokio::select! {
                _ = stop.cancelled() => return,
                item = stream.next() => item,
            };
            let event = match item {
                None => break,
                Some(Ok(KubeWatchEvent::Error(e))) if e.code == GONE => {
                    debug!(kind = %kind, resource_version = %version, "Resource version expired");
                    relist = true;
                    break;
                }
                Some(Ok(KubeWatchEvent::Error(e))) => WatchEvent::Error {
                    code: e.code,
                    message: e.message,
                },
                Some(Ok(event)) => {
                    if let Some(v) = resource_version(&event) {
                        version = v;
                    }
                    match delivered.filter(event) {
                        Some(event) => event,
                        None => continue,
                    }
                }
                Some(Err(e)) if status_code(&e) == Some(GONE) => {
                    relist = true;
                    break;
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Watch stream failed, restarting");
                    break;
                }
            };
            if !send(&tx, &stop, event).await {
                return;
            }
        }
        debug!(kind = %kind, resource_version = %version, relist, "Watch ended, restarting");
    }
}

/// Send one event; false once the watch should end
async fn send(tx: &mpsc::Sender<WatchEvent>, stop: &CancellationToken, event: WatchEvent) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

fn status_code(err: &Error) -> Option<u16> {
    match err.root() {
        Error::Transport { code, .. } => *code,
        _ => None,
    }
}

fn error_event(err: &Error) -> WatchEvent {
    WatchEvent::Error {
        code: status_code(err).unwrap_or(500),
        message: err.to_string(),
    }
}

fn resource_version(event: &KubeWatchEvent<DynamicObject>) -> Option<String> {
    match event {
        KubeWatchEvent::Added(o) | KubeWatchEvent::Modified(o) | KubeWatchEvent::Deleted(o) => {
            o.metadata.resource_version.clone()
        }
        KubeWatchEvent::Bookmark(b) => Some(b.metadata.resource_version.clone()),
        KubeWatchEvent::Error(_) => None,
    }
}

/// Identity of an object across subscriptions
fn identity(object: &DynamicObject) -> String {
    match &object.metadata.uid {
        Some(uid) => uid.clone(),
        None => format!(
            "{}/{}",
            object.metadata.namespace.as_deref().unwrap_or_default(),
            object.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

/// Last delivered state of every live object
#[derive(Default)]
struct Delivered {
    objects: HashMap<String, DynamicObject>,
}

impl Delivered {
    /// The event the consumer should see for a server event, if any
    fn filter(&mut self, event: KubeWatchEvent<DynamicObject>) -> Option<WatchEvent> {
        match event {
            KubeWatchEvent::Added(o) => self.observe(o),
            KubeWatchEvent::Modified(o) => {
                self.objects.insert(identity(&o), o.clone());
                Some(WatchEvent::Modified(o))
            }
            KubeWatchEvent::Deleted(o) => {
                self.objects.remove(&identity(&o));
                Some(WatchEvent::Deleted(o))
            }
            KubeWatchEvent::Bookmark(b) => Some(WatchEvent::Bookmark {
                resource_version: b.metadata.resource_version,
            }),
            KubeWatchEvent::Error(e) => Some(WatchEvent::Error {
                code: e.code,
                message: e.message,
            }),
        }
    }

    /// An object seen to exist: new ones are added, known ones that changed
    /// are modified, unchanged ones produce nothing
    fn observe(&mut self, object: DynamicObject) -> Option<WatchEvent> {
        let key = identity(&object);
        let event = match self.objects.get(&key) {
            None => WatchEvent::Added(object.clone()),
            Some(previous) if previous.metadata.resource_version == object.metadata.resource_version => {
                return None;
            }
            Some(_) => WatchEvent::Modified(object.clone()),
        };
        self.objects.insert(key, object);
        Some(event)
    }

    /// Events that bring the consumer from the delivered state to `listed`
    fn reconcile(&mut self, listed: Vec<DynamicObject>) -> Vec<WatchEvent> {
        let present: Vec<String> = listed.iter().map(identity).collect();
        let mut gone: Vec<String> = self
            .objects
            .keys()
            .filter(|key| !present.contains(key))
            .cloned()
            .collect();
        gone.sort();

        let mut events: Vec<WatchEvent> = gone
            .into_iter()
            .filter_map(|key| self.objects.remove(&key))
            .map(WatchEvent::Deleted)
            .collect();
        events.extend(listed.into_iter().filter_map(|object| self.observe(object)));
        events
    }
}
