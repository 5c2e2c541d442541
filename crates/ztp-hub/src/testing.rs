//! In-memory hub for tests
//!
//! Stores objects by kind/namespace/name, assigns resource versions, records
//! every write, and feeds watches from the same store so tests can drive
//! readiness and disappearance waits.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{gvk_of, HubClient, ListOptions, ObjectKey, PatchStrategy, Watch, WatchEvent};
use crate::{Error, Result};

type StoreKey = (String, String, Option<String>, String);

/// A write the fake received
#[derive(Clone, Debug)]
pub struct Call {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    calls: Vec<Call>,
    watches: Vec<(GroupVersionKind, ListOptions, mpsc::Sender<WatchEvent>)>,
    version: u64,
    /// Kinds whose deletion never completes
    stuck: Vec<String>,
    /// Number of status writes that fail with a conflict before succeeding
    status_conflicts: u32,
}

#[derive(Default)]
pub struct FakeHub {
    state: Mutex<State>,
}

fn store_key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> StoreKey {
    (
        gvk.group.clone(),
        gvk.kind.clone(),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

fn matches(gvk: &GroupVersionKind, options: &ListOptions, object: &DynamicObject) -> bool {
    let Ok(object_gvk) = gvk_of(object) else {
        return false;
    };
    if object_gvk.group != gvk.group || object_gvk.kind != gvk.kind {
        return false;
    }
    if options.namespace.is_some() && options.namespace != object.metadata.namespace {
        return false;
    }
    match options.field_selector.as_deref().and_then(|f| f.strip_prefix("metadata.name=")) {
        Some(name) => object.metadata.name.as_deref() == Some(name),
        None => true,
    }
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletions of `kind` are accepted but the object stays
    pub fn stick_deletes_of(&self, kind: &str) {
        self.lock().stuck.push(kind.to_string());
    }

    /// Deletions complete again for every kind
    pub fn unstick_deletes(&self) {
        self.lock().stuck.clear();
    }

    /// The next `count` status writes fail with a conflict
    pub fn conflict_status_writes(&self, count: u32) {
        self.lock().status_conflicts = count;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// `verb kind name` for every recorded call
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| format!("{} {} {}", c.verb, c.kind, c.name))
            .collect()
    }

    pub fn object(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .find(|((_, k, ns, n), _)| k == kind && ns.as_deref() == namespace && n == name)
            .map(|(_, o)| o.clone())
    }

    /// Mark the CRD `name` as established and notify watchers
    pub fn establish(&self, name: &str) {
        self.set_crd_conditions(
            name,
            json!([
                {"type": "NamesAccepted", "status": "True"},
                {"type": "Established", "status": "True"}
            ]),
        );
    }

    /// Replace the status conditions of the CRD `name` and notify watchers
    pub fn set_crd_conditions(&self, name: &str, conditions: Value) {
        let mut state = self.lock();
        let Some(key) = state
            .objects
            .keys()
            .find(|(_, kind, _, n)| kind == "CustomResourceDefinition" && n == name)
            .cloned()
        else {
            return;
        };
        state.version += 1;
        let version = state.version.to_string();
        let Some(object) = state.objects.get_mut(&key) else {
            return;
        };
        object.metadata.resource_version = Some(version);
        if let Some(map) = object.data.as_object_mut() {
            map.insert(
                "status".to_string(),
                json!({ "conditions": conditions }),
            );
        }
        let object = object.clone();
        Self::notify(&mut state, WatchEvent::Modified(object));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(state: &mut State, verb: &'static str, object: &DynamicObject) {
        let kind = object.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        state.calls.push(Call {
            verb,
            kind,
            name: object.metadata.name.clone().unwrap_or_default(),
            at: Instant::now(),
        });
    }

    fn notify(state: &mut State, event: WatchEvent) {
        let Some(object) = event.object().cloned() else {
            return;
        };
        state.watches.retain(|(gvk, options, tx)| {
            if !matches(gvk, options, &object) {
                return !tx.is_closed();
            }
            tx.try_send(event.clone()).is_ok()
        });
    }
}

#[async_trait]
impl HubClient for FakeHub {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        self.lock()
            .objects
            .get(&store_key(&key.gvk, key.namespace.as_deref(), &key.name))
            .cloned()
            .ok_or_else(|| Error::not_found(&key.gvk.kind, &key.name))
    }

    async fn list(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<Vec<DynamicObject>> {
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|o| matches(gvk, options, o))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(object)?;
        let mut state = self.lock();
        let store = store_key(&key.gvk, key.namespace.as_deref(), &key.name);
        if state.objects.contains_key(&store) {
            return Err(Error::already_exists(&key.gvk.kind, &key.name));
        }
        Self::record(&mut state, "create", object);
        state.version += 1;
        let mut created = object.clone();
        created.metadata.resource_version = Some(state.version.to_string());
        if let Some(map) = created.data.as_object_mut() {
            map.remove("status");
        }
        state.objects.insert(store, created.clone());
        Self::notify(&mut state, WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(object)?;
        let mut state = self.lock();
        let store = store_key(&key.gvk, key.namespace.as_deref(), &key.name);
        let current = state
            .objects
            .get(&store)
            .ok_or_else(|| Error::not_found(&key.gvk.kind, &key.name))?;
        if current.metadata.resource_version != object.metadata.resource_version {
            return Err(Error::conflict("the object has been modified"));
        }
        Self::record(&mut state, "update", object);
        state.version += 1;
        let mut updated = object.clone();
        updated.metadata.resource_version = Some(state.version.to_string());
        state.objects.insert(store, updated.clone());
        Self::notify(&mut state, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn patch(&self, object: &DynamicObject, _strategy: PatchStrategy) -> Result<DynamicObject> {
        let mut object = object.clone();
        object.metadata.resource_version = None;
        let key = ObjectKey::of(&object)?;
        let current = self.get(&key).await?;
        object.metadata.resource_version = current.metadata.resource_version;
        self.update(&object).await
    }

    async fn delete(&self, object: &DynamicObject) -> Result<()> {
        let key = ObjectKey::of(object)?;
        let mut state = self.lock();
        let store = store_key(&key.gvk, key.namespace.as_deref(), &key.name);
        if !state.objects.contains_key(&store) {
            return Err(Error::not_found(&key.gvk.kind, &key.name));
        }
        Self::record(&mut state, "delete", object);
        if state.stuck.contains(&key.gvk.kind) {
            return Ok(());
        }
        if let Some(removed) = state.objects.remove(&store) {
            Self::notify(&mut state, WatchEvent::Deleted(removed));
        }
        Ok(())
    }

    async fn delete_all_of(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<()> {
        for object in self.list(gvk, options).await? {
            self.delete(&object).await?;
        }
        Ok(())
    }

    async fn update_status(&self, object: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(object)?;
        let mut state = self.lock();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(Error::conflict("the object has been modified"));
        }
        let store = store_key(&key.gvk, key.namespace.as_deref(), &key.name);
        let status = object.data.get("status").cloned().unwrap_or(Value::Null);
        Self::record(&mut state, "status", object);
        let current = state
            .objects
            .get_mut(&store)
            .ok_or_else(|| Error::not_found(&key.gvk.kind, &key.name))?;
        if let Some(map) = current.data.as_object_mut() {
            map.insert("status".to_string(), status);
        }
        Ok(current.clone())
    }

    async fn patch_status(&self, object: &DynamicObject, _strategy: PatchStrategy) -> Result<DynamicObject> {
        self.update_status(object).await
    }

    async fn watch(&self, gvk: &GroupVersionKind, options: &ListOptions) -> Result<Watch> {
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.lock();
        for object in state.objects.values().filter(|o| matches(gvk, options, o)) {
            let _ = tx.try_send(WatchEvent::Added(object.clone()));
        }
        state.watches.push((gvk.clone(), options.clone(), tx));
        Ok(Watch::from_channel(rx, CancellationToken::new()))
    }
}
