//! Collaborator seams: authentication, document database, push transport
//! and key-value storage.
//!
//! The core never talks to a concrete backend; it consumes these traits.
//! In-memory implementations live here too; they back the test suite and
//! local development, the way an in-memory database backs the repository
//! tests elsewhere in the app.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::models::Medication;

// ═══════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════

/// The authenticated caller, as reported by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current signed-in principal, if any. Writes without one fail with
    /// a non-retryable auth error before touching the store.
    async fn current_principal(&self) -> Option<Principal>;
}

/// Read/write contract of the document database. Paths address single
/// documents ("devices/d1/commands"); collections hold auto-id documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Map<String, Value>>, CoreError>;

    /// Full overwrite: the document becomes exactly `fields`.
    async fn set(&self, path: &str, fields: Map<String, Value>) -> Result<(), CoreError>;

    /// Partial update: given fields replace existing ones, `Value::Null`
    /// deletes a field, everything else is left untouched.
    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), CoreError>;

    /// Append to a collection under a generated id. Returns the id.
    async fn add(&self, collection: &str, fields: Map<String, Value>) -> Result<String, CoreError>;

    async fn list(&self, collection: &str) -> Result<Vec<(String, Map<String, Value>)>, CoreError>;
}

/// Snapshot callback. Delivered in transport order; an `Err` is a
/// subscription failure, not a value change.
pub type SnapshotCallback = Box<dyn Fn(Result<Option<Value>, CoreError>) + Send + Sync>;

/// Long-lived push subscription transport.
pub trait PushTransport: Send + Sync {
    fn subscribe(&self, path: &str, callback: SnapshotCallback) -> Subscription;
}

/// Guard for an active subscription. Dropping it unsubscribes, so every
/// setup path pairs with a teardown and no listener outlives its owner.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// A subscription that was never attached (validation gate).
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Local key-value storage for per-patient effect toggles. Best-effort:
/// callers swallow failures.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_flag(&self, key: &str) -> Result<Option<bool>, CoreError>;
    async fn set_flag(&self, key: &str, value: bool) -> Result<(), CoreError>;
}

/// Source of a patient's structured medication list. Each call returns an
/// immutable snapshot.
#[async_trait]
pub trait MedicationSource: Send + Sync {
    async fn medications(&self, patient_id: &str) -> Result<Vec<Medication>, CoreError>;
}

// ═══════════════════════════════════════════════════════════
// In-memory implementations
// ═══════════════════════════════════════════════════════════

/// In-memory document store with failure injection for tests.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Map<String, Value>>>,
    collections: Mutex<HashMap<String, Vec<(String, Map<String, Value>)>>>,
    next_id: AtomicU64,
    /// Error returned by every `merge` call while set.
    merge_failure: Mutex<Option<CoreError>>,
    /// Error returned by every write (`set`/`merge`/`add`) while set.
    write_failure: Mutex<Option<CoreError>>,
    ops: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_merges_with(&self, err: CoreError) {
        *self.merge_failure.lock().unwrap() = Some(err);
    }

    pub fn clear_merge_failure(&self) {
        *self.merge_failure.lock().unwrap() = None;
    }

    pub fn fail_writes_with(&self, err: CoreError) {
        *self.write_failure.lock().unwrap() = Some(err);
    }

    pub fn clear_write_failure(&self) {
        *self.write_failure.lock().unwrap() = None;
    }

    /// Operations performed so far, as "op path" strings.
    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn operation_count(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    /// Direct document read for assertions.
    pub fn document(&self, path: &str) -> Option<Map<String, Value>> {
        self.docs.lock().unwrap().get(path).cloned()
    }

    /// Seed a document without counting as an operation.
    pub fn seed(&self, path: &str, fields: Map<String, Value>) {
        self.docs.lock().unwrap().insert(path.to_string(), fields);
    }

    /// Seed a collection entry without counting as an operation.
    pub fn seed_collection(&self, collection: &str, fields: Map<String, Value>) -> String {
        let id = format!("seed-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), fields));
        id
    }

    fn record(&self, op: &str, path: &str) {
        self.ops.lock().unwrap().push(format!("{op} {path}"));
    }

    fn write_gate(&self) -> Result<(), CoreError> {
        if let Some(err) = self.write_failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Map<String, Value>>, CoreError> {
        self.record("get", path);
        Ok(self.docs.lock().unwrap().get(path).cloned())
    }

    async fn set(&self, path: &str, fields: Map<String, Value>) -> Result<(), CoreError> {
        self.record("set", path);
        self.write_gate()?;
        let cleaned: Map<String, Value> = fields
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        self.docs.lock().unwrap().insert(path.to_string(), cleaned);
        Ok(())
    }

    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), CoreError> {
        self.record("merge", path);
        self.write_gate()?;
        if let Some(err) = self.merge_failure.lock().unwrap().clone() {
            return Err(err);
        }
        let mut docs = self.docs.lock().unwrap();
        let doc = docs.entry(path.to_string()).or_default();
        for (key, value) in fields {
            if value.is_null() {
                doc.remove(&key);
            } else {
                doc.insert(key, value);
            }
        }
        Ok(())
    }

    async fn add(&self, collection: &str, fields: Map<String, Value>) -> Result<String, CoreError> {
        self.record("add", collection);
        self.write_gate()?;
        let id = uuid::Uuid::new_v4().to_string();
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .push((id.clone(), fields));
        Ok(id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Map<String, Value>)>, CoreError> {
        self.record("list", collection);
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory push transport. `publish` delivers synchronously to current
/// subscribers of the path, in subscription order.
#[derive(Default)]
pub struct MemoryTransport {
    subs: Arc<Mutex<HashMap<String, Vec<(u64, Arc<SnapshotCallback>)>>>>,
    next_id: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, path: &str, value: Option<Value>) {
        for callback in self.callbacks(path) {
            callback(Ok(value.clone()));
        }
    }

    pub fn publish_error(&self, path: &str, err: CoreError) {
        for callback in self.callbacks(path) {
            callback(Err(err.clone()));
        }
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.subs
            .lock()
            .unwrap()
            .get(path)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    fn callbacks(&self, path: &str) -> Vec<Arc<SnapshotCallback>> {
        self.subs
            .lock()
            .unwrap()
            .get(path)
            .map(|v| v.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

impl PushTransport for MemoryTransport {
    fn subscribe(&self, path: &str, callback: SnapshotCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        let subs = Arc::clone(&self.subs);
        let path = path.to_string();
        Subscription::new(move || {
            if let Some(entries) = subs.lock().unwrap().get_mut(&path) {
                entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }
}

/// In-memory key-value store with a failure switch for best-effort tests.
#[derive(Default)]
pub struct MemoryKv {
    flags: Mutex<HashMap<String, bool>>,
    failing: Mutex<bool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn gate(&self) -> Result<(), CoreError> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::Unknown("key-value store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get_flag(&self, key: &str) -> Result<Option<bool>, CoreError> {
        self.gate()?;
        Ok(self.flags.lock().unwrap().get(key).copied())
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<(), CoreError> {
        self.gate()?;
        self.flags.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

/// Fixed auth provider: either signed in as `uid` or signed out.
#[derive(Default)]
pub struct StaticAuth {
    principal: Option<Principal>,
}

impl StaticAuth {
    pub fn signed_in(uid: impl Into<String>) -> Self {
        Self {
            principal: Some(Principal { uid: uid.into() }),
        }
    }

    pub fn signed_out() -> Self {
        Self { principal: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_principal(&self) -> Option<Principal> {
        self.principal.clone()
    }
}

/// Medication source backed by a fixed, replaceable list.
#[derive(Default)]
pub struct StaticMedications {
    meds: Mutex<Vec<Medication>>,
}

impl StaticMedications {
    pub fn new(meds: Vec<Medication>) -> Self {
        Self { meds: Mutex::new(meds) }
    }

    pub fn replace(&self, meds: Vec<Medication>) {
        *self.meds.lock().unwrap() = meds;
    }
}

#[async_trait]
impl MedicationSource for StaticMedications {
    async fn medications(&self, _patient_id: &str) -> Result<Vec<Medication>, CoreError> {
        Ok(self.meds.lock().unwrap().clone())
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn set_overwrites_whole_document() {
        let store = MemoryStore::new();
        store
            .set("devices/d1/commands", fields(&[("topo", json!(true)), ("led", json!(true))]))
            .await
            .unwrap();
        store
            .set("devices/d1/commands", fields(&[("buzzer", json!(false))]))
            .await
            .unwrap();

        let doc = store.document("devices/d1/commands").unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc["buzzer"], json!(false));
        assert!(!doc.contains_key("topo"));
    }

    #[tokio::test]
    async fn merge_updates_only_given_fields() {
        let store = MemoryStore::new();
        store.seed("devices/d1/commands", fields(&[("topo", json!(true)), ("led", json!(true))]));
        store
            .merge("devices/d1/commands", fields(&[("topo", json!(false))]))
            .await
            .unwrap();

        let doc = store.document("devices/d1/commands").unwrap();
        assert_eq!(doc["topo"], json!(false));
        assert_eq!(doc["led"], json!(true));
    }

    #[tokio::test]
    async fn merge_null_deletes_field() {
        let store = MemoryStore::new();
        store.seed("devices/d1/commands", fields(&[("ledColor", json!("1,2,3"))]));
        store
            .merge("devices/d1/commands", fields(&[("ledColor", Value::Null)]))
            .await
            .unwrap();
        assert!(!store.document("devices/d1/commands").unwrap().contains_key("ledColor"));
    }

    #[tokio::test]
    async fn add_and_list_collection() {
        let store = MemoryStore::new();
        let id = store
            .add("patients/p1/intakes", fields(&[("status", json!("TAKEN"))]))
            .await
            .unwrap();
        let entries = store.list("patients/p1/intakes").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, id);
        assert_eq!(entries[0].1["status"], json!("TAKEN"));
    }

    #[tokio::test]
    async fn injected_merge_failure_surfaces() {
        let store = MemoryStore::new();
        store.fail_merges_with(CoreError::Unknown("boom".into()));
        let result = store.merge("p", fields(&[("a", json!(1))])).await;
        assert!(result.is_err());

        store.clear_merge_failure();
        assert!(store.merge("p", fields(&[("a", json!(1))])).await.is_ok());
    }

    #[test]
    fn publish_reaches_subscriber() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _sub = transport.subscribe(
            "devices/d1/commands/topo",
            Box::new(move |snapshot| {
                seen_cb.lock().unwrap().push(snapshot.unwrap());
            }),
        );

        transport.publish("devices/d1/commands/topo", Some(json!(true)));
        transport.publish("devices/d1/commands/topo", Some(json!(false)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Some(json!(true)), Some(json!(false))]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let transport = MemoryTransport::new();
        let sub = transport.subscribe("p", Box::new(|_| {}));
        assert_eq!(transport.subscriber_count("p"), 1);
        drop(sub);
        assert_eq!(transport.subscriber_count("p"), 0);
    }

    #[test]
    fn publish_to_other_path_is_not_delivered() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(0u32));
        let seen_cb = Arc::clone(&seen);
        let _sub = transport.subscribe(
            "devices/d1/commands/topo",
            Box::new(move |_| {
                *seen_cb.lock().unwrap() += 1;
            }),
        );
        transport.publish("devices/d2/commands/topo", Some(json!(true)));
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn kv_store_roundtrip_and_failure() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get_flag("sound").await.unwrap(), None);
        kv.set_flag("sound", false).await.unwrap();
        assert_eq!(kv.get_flag("sound").await.unwrap(), Some(false));

        kv.set_failing(true);
        assert!(kv.get_flag("sound").await.is_err());
    }

    #[tokio::test]
    async fn static_auth_reports_principal() {
        assert_eq!(
            StaticAuth::signed_in("u1").current_principal().await,
            Some(Principal { uid: "u1".into() })
        );
        assert_eq!(StaticAuth::signed_out().current_principal().await, None);
    }
}
