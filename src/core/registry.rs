//! Reference registry: stable ids for payloads that may not exist yet.
//!
//! Ids live in one of two kinds of bucket:
//! - generated buckets, one per prefix, issuing `<prefix>_<n>` with a
//!   counter starting at 0
//! - the custom bucket, holding caller-chosen keys that never contain the
//!   reserved separator
//!
//! Because generated ids always contain the separator and custom keys never
//! do, the two kinds can never collide and an id's bucket can be recovered
//! from its shape alone.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::domain::{LifecycleEvent, LifecycleKind, OperationId, Payload, RegistryError};

use super::context::LifecycleListener;

/// Separator between prefix and counter in generated ids
pub const SEPARATOR: char = '_';

/// Prefix used for literal payloads registered without one
pub const DEFAULT_PREFIX: &str = "ref";

/// Which bucket an entry belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "prefix", rename_all = "snake_case")]
pub enum Bucket {
    Generated(String),
    Custom,
}

/// One registered id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub id: String,

    /// None until the owning operation is done
    pub payload: Option<Payload>,

    pub bucket: Bucket,

    /// Operation whose `done` payload fills this entry
    #[serde(skip)]
    pub owner: Option<OperationId>,
}

impl ReferenceEntry {
    pub fn is_resolved(&self) -> bool {
        self.payload.is_some()
    }
}

/// What an id refers to
#[derive(Debug, Clone)]
pub enum Owner {
    /// Filled when this operation emits `done`
    Operation(OperationId),

    /// Filled immediately
    Payload(Payload),
}

/// Options for `register`
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Generated-bucket prefix
    pub prefix: Option<String>,

    /// Existing key to delete before inserting the new entry
    pub replacing: Option<String>,
}

impl RegisterOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            replacing: None,
        }
    }

    pub fn replacing(mut self, key: impl Into<String>) -> Self {
        self.replacing = Some(key.into());
        self
    }
}

/// Shape of an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdShape<'a> {
    Generated { prefix: &'a str, counter: u64 },
    Custom,
}

/// Classify an id by shape: `<prefix>_<digits>` is generated, anything else is custom.
pub fn classify(id: &str) -> IdShape<'_> {
    match id.rsplit_once(SEPARATOR) {
        Some((prefix, digits))
            if !prefix.is_empty()
                && !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit()) =>
        {
            match digits.parse() {
                Ok(counter) => IdShape::Generated { prefix, counter },
                Err(_) => IdShape::Custom,
            }
        }
        _ => IdShape::Custom,
    }
}

#[derive(Debug, Clone, Default)]
struct GeneratedBucket {
    next: u64,
    entries: BTreeMap<u64, ReferenceEntry>,
}

/// The mutable store behind the registry
#[derive(Debug, Clone, Default)]
pub struct RegistryStore {
    generated: BTreeMap<String, GeneratedBucket>,
    custom: BTreeMap<String, ReferenceEntry>,
    /// Ids waiting on each operation's `done` payload
    owned: HashMap<OperationId, Vec<String>>,
}

impl RegistryStore {
    pub fn get(&self, id: &str) -> Option<&ReferenceEntry> {
        match classify(id) {
            IdShape::Generated { prefix, counter } => self
                .generated
                .get(prefix)
                .and_then(|bucket| bucket.entries.get(&counter)),
            IdShape::Custom => self.custom.get(id),
        }
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ReferenceEntry> {
        match classify(id) {
            IdShape::Generated { prefix, counter } => self
                .generated
                .get_mut(prefix)
                .and_then(|bucket| bucket.entries.get_mut(&counter)),
            IdShape::Custom => self.custom.get_mut(id),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Entries in a stable order: generated buckets by prefix then counter, then custom keys
    pub fn entries(&self) -> impl Iterator<Item = &ReferenceEntry> {
        self.generated
            .values()
            .flat_map(|bucket| bucket.entries.values())
            .chain(self.custom.values())
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next counter the prefix will issue
    pub fn next_counter(&self, prefix: &str) -> u64 {
        self.generated.get(prefix).map_or(0, |bucket| bucket.next)
    }

    /// Delete an entry from the bucket its id belongs to.
    ///
    /// Generated counters are not rewound.
    pub fn remove(&mut self, id: &str) -> Option<ReferenceEntry> {
        match classify(id) {
            IdShape::Generated { prefix, counter } => self
                .generated
                .get_mut(prefix)
                .and_then(|bucket| bucket.entries.remove(&counter)),
            IdShape::Custom => self.custom.remove(id),
        }
    }

    /// Overwrite the payload of an existing entry
    pub fn set_payload(&mut self, id: &str, payload: Payload) -> Result<(), RegistryError> {
        let entry = self
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownId(id.to_string()))?;
        entry.payload = Some(payload);
        Ok(())
    }

    fn insert_generated(&mut self, prefix: &str, owner: &Owner) -> Result<String, RegistryError> {
        let bucket = self.generated.entry(prefix.to_string()).or_default();
        let counter = bucket.next;
        bucket.next = counter
            .checked_add(1)
            .ok_or_else(|| RegistryError::CounterExhausted(prefix.to_string()))?;

        let id = format!("{}{}{}", prefix, SEPARATOR, counter);
        bucket.entries.insert(counter, entry_for(&id, Bucket::Generated(prefix.to_string()), owner));
        self.index_owner(&id, owner);
        Ok(id)
    }

    fn insert_custom(&mut self, key: &str, owner: &Owner) -> Result<(), RegistryError> {
        if self.custom.contains_key(key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }
        self.custom
            .insert(key.to_string(), entry_for(key, Bucket::Custom, owner));
        self.index_owner(key, owner);
        Ok(())
    }

    fn index_owner(&mut self, id: &str, owner: &Owner) {
        if let Owner::Operation(op) = owner {
            let ids = self.owned.entry(*op).or_default();
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
    }

    fn fill(&mut self, owner: OperationId, payload: &Payload) -> usize {
        let Some(ids) = self.owned.remove(&owner) else {
            return 0;
        };

        let mut filled = 0;
        for id in ids {
            // Entries removed or replaced since registration are skipped
            if let Some(entry) = self.get_mut(&id).filter(|e| e.owner == Some(owner)) {
                entry.payload = Some(payload.clone());
                filled += 1;
            }
        }
        filled
    }
}

fn entry_for(id: &str, bucket: Bucket, owner: &Owner) -> ReferenceEntry {
    match owner {
        Owner::Operation(op) => ReferenceEntry {
            id: id.to_string(),
            payload: None,
            bucket,
            owner: Some(*op),
        },
        Owner::Payload(payload) => ReferenceEntry {
            id: id.to_string(),
            payload: Some(payload.clone()),
            bucket,
            owner: None,
        },
    }
}

fn validate_custom_key(key: &str) -> Result<(), RegistryError> {
    if key.is_empty() {
        return Err(RegistryError::EmptyKey);
    }
    if key.contains(SEPARATOR) {
        return Err(RegistryError::ReservedSeparator {
            key: key.to_string(),
            separator: SEPARATOR,
        });
    }
    Ok(())
}

/// Serialized form of the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedTree {
    pub records: Vec<SerializedRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRecord {
    #[serde(rename = "referenceId")]
    pub reference_id: String,

    /// Absent while pending; a present `null` is a resolved null payload
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_payload"
    )]
    pub payload: Option<Payload>,
}

fn present_payload<'de, D>(deserializer: D) -> Result<Option<Payload>, D::Error>
where
    D: Deserializer<'de>,
{
    Payload::deserialize(deserializer).map(Some)
}

/// Deep, immutable copy of the store
#[derive(Debug, Clone)]
pub struct RegistrySnapshot(Arc<RegistryStore>);

impl Deref for RegistrySnapshot {
    type Target = RegistryStore;

    fn deref(&self) -> &RegistryStore {
        &self.0
    }
}

/// Result of `ReferenceRegistry::view`
#[derive(Debug)]
pub enum RegistryView<'a> {
    Snapshot(RegistrySnapshot),
    /// Holds the registry lock until dropped; never keep it across `.await`
    Live(MutexGuard<'a, RegistryStore>),
}

impl RegistryView<'_> {
    /// Mutable access, only for live views
    pub fn live_mut(&mut self) -> Option<&mut RegistryStore> {
        match self {
            Self::Snapshot(_) => None,
            Self::Live(guard) => Some(&mut **guard),
        }
    }
}

impl Deref for RegistryView<'_> {
    type Target = RegistryStore;

    fn deref(&self) -> &RegistryStore {
        match self {
            Self::Snapshot(snapshot) => &**snapshot,
            Self::Live(guard) => &**guard,
        }
    }
}

/// Keyed store of reference ids, shared by every operation in a run
#[derive(Debug)]
pub struct ReferenceRegistry {
    store: Mutex<RegistryStore>,
    default_prefix: String,
}

impl Default for ReferenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        Self::with_default_prefix(DEFAULT_PREFIX)
    }

    /// Use a different prefix for literal payloads registered without one
    pub fn with_default_prefix(prefix: impl Into<String>) -> Self {
        Self {
            store: Mutex::new(RegistryStore::default()),
            default_prefix: prefix.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an owner in a generated bucket and return `<prefix>_<n>`.
    pub fn register(&self, owner: Owner, options: RegisterOptions) -> Result<String, RegistryError> {
        let prefix = options
            .prefix
            .unwrap_or_else(|| self.default_prefix.clone());
        if prefix.is_empty() {
            return Err(RegistryError::EmptyPrefix);
        }

        let mut store = self.lock();
        if let Some(key) = options.replacing.as_deref() {
            Self::replace(&mut store, key);
        }
        let id = store.insert_generated(&prefix, &owner)?;
        debug!(%id, "Registered generated reference");
        Ok(id)
    }

    /// Register an owner under a caller-chosen key, returned verbatim.
    pub fn register_custom(
        &self,
        owner: Owner,
        key: &str,
        replacing: Option<&str>,
    ) -> Result<String, RegistryError> {
        validate_custom_key(key)?;

        let mut store = self.lock();
        if store.custom.contains_key(key) && replacing != Some(key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }
        if let Some(old) = replacing {
            Self::replace(&mut store, old);
        }
        store.insert_custom(key, &owner)?;
        debug!(id = key, "Registered custom reference");
        Ok(key.to_string())
    }

    fn replace(store: &mut RegistryStore, key: &str) {
        if store.remove(key).is_none() {
            debug!(key, "Replaced reference was not registered");
        }
    }

    /// Fill every entry owned by an operation; returns how many were filled
    pub fn fill(&self, owner: OperationId, payload: &Payload) -> usize {
        self.lock().fill(owner, payload)
    }

    pub fn resolve(&self, id: &str) -> Option<Payload> {
        self.lock().get(id).and_then(|entry| entry.payload.clone())
    }

    /// Ids whose payload has not arrived yet
    pub fn pending(&self) -> Vec<String> {
        self.lock()
            .entries()
            .filter(|entry| !entry.is_resolved())
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot(Arc::new(self.lock().clone()))
    }

    /// Read-only snapshot by default; `read_only = false` hands out the live store.
    ///
    /// A live view holds the registry lock. Drop it before the next `.await`:
    /// every operation that emits `done` needs the same lock to fill its
    /// entries, so a live view held across a suspension point stalls the run.
    /// Prefer `update` for short edits.
    pub fn view(&self, read_only: bool) -> RegistryView<'_> {
        if read_only {
            RegistryView::Snapshot(self.snapshot())
        } else {
            RegistryView::Live(self.lock())
        }
    }

    /// Edit the live store; the lock is released when `edit` returns
    pub fn update<R>(&self, edit: impl FnOnce(&mut RegistryStore) -> R) -> R {
        edit(&mut self.lock())
    }

    pub fn serialize(&self) -> SerializedTree {
        let store = self.lock();
        SerializedTree {
            records: store
                .entries()
                .map(|entry| SerializedRecord {
                    reference_id: entry.id.clone(),
                    payload: entry.payload.clone(),
                })
                .collect(),
        }
    }

    /// Replace the whole registry with the contents of a serialized tree.
    ///
    /// Ids keep their original value; generated counters resume after the
    /// highest counter seen per prefix. On error the registry is unchanged.
    pub fn parse(&self, tree: &SerializedTree) -> Result<(), RegistryError> {
        let mut fresh = RegistryStore::default();

        for record in &tree.records {
            let id = record.reference_id.as_str();
            let mut entry = ReferenceEntry {
                id: id.to_string(),
                payload: record.payload.clone(),
                bucket: Bucket::Custom,
                owner: None,
            };

            match classify(id) {
                IdShape::Generated { prefix, counter } => {
                    entry.bucket = Bucket::Generated(prefix.to_string());
                    let bucket = fresh.generated.entry(prefix.to_string()).or_default();
                    if bucket.entries.insert(counter, entry).is_some() {
                        return Err(RegistryError::DuplicateId(id.to_string()));
                    }
                    let next = counter
                        .checked_add(1)
                        .ok_or_else(|| RegistryError::CounterExhausted(prefix.to_string()))?;
                    bucket.next = bucket.next.max(next);
                }
                IdShape::Custom => {
                    validate_custom_key(id)?;
                    if fresh.custom.insert(id.to_string(), entry).is_some() {
                        return Err(RegistryError::DuplicateId(id.to_string()));
                    }
                }
            }
        }

        let mut store = self.lock();
        if !store.is_empty() {
            warn!(replaced = store.len(), "Parsing replaces existing references");
        }
        *store = fresh;
        Ok(())
    }
}

impl LifecycleListener for ReferenceRegistry {
    fn on_event(&self, event: &LifecycleEvent) {
        if let LifecycleKind::Done { payload } = &event.kind {
            let filled = self.fill(event.operation, payload);
            if filled > 0 {
                debug!(operation = %event.operation, filled, "Filled references");
            }
        }
    }
}
