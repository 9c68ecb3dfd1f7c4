//! Key/value storage, JSON collections and the unit of work.
//!
//! Every collection is written as `{"version": 1, "items": [...]}`. Bare
//! JSON arrays written by older builds are still accepted on read. A value
//! that fails to parse is logged and replaced by the default.

use std::collections::BTreeMap;

use log::warn;
use medshare_integrity::{
    derive_auth_status, validate, AccessRecord, AuthorizationRequest, EntryTypes, MedicalFile,
    SCHEMA_VERSION,
};
use medshare_shared::{
    MedshareError, MedshareResult, ACCESS_RECORDS, AUTHORIZATION_REQUESTS, MEDICAL_FILES,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Flat string store, shaped like browser local storage
pub trait KeyValueStore {
    fn get_item(&self, key: &str) -> Option<String>;

    fn set_item(&mut self, key: &str, value: String);

    fn remove_item(&mut self, key: &str);

    fn clear(&mut self);

    /// Write several keys at once. Implementations backed by real media
    /// should make this all-or-nothing.
    fn write_batch(&mut self, entries: Vec<(String, String)>) {
        for (key, value) in entries {
            self.set_item(&key, value);
        }
    }
}

/// In-memory store
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    items: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: String) {
        self.items.insert(key.to_string(), value);
    }

    fn remove_item(&mut self, key: &str) {
        self.items.remove(key);
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u32,
    items: &'a [T],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredCollection<T> {
    Envelope { version: u32, items: Vec<T> },
    Legacy(Vec<T>),
}

/// Typed JSON access over a [`KeyValueStore`]
#[derive(Debug, Default)]
pub struct Storage<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> Storage<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Parse the value under `key`, falling back to `default` when it is
    /// missing or corrupt.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let Some(raw) = self.store.get_item(key) else {
            return default;
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding unreadable value under '{}': {}", key, e);
                default
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> MedshareResult<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set_item(key, raw);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) {
        self.store.remove_item(key);
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }

    pub fn load_collection<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        match self.get::<Option<StoredCollection<T>>>(key, None) {
            None => Vec::new(),
            Some(StoredCollection::Legacy(items)) => items,
            Some(StoredCollection::Envelope { version, items }) => {
                if version > SCHEMA_VERSION {
                    warn!(
                        "Collection '{}' has schema version {} (newer than {}); reading anyway",
                        key, version, SCHEMA_VERSION
                    );
                }
                items
            }
        }
    }

    pub fn save_collection<T: Serialize>(&mut self, key: &str, items: &[T]) -> MedshareResult<()> {
        let raw = encode_collection(items)?;
        self.store.set_item(key, raw);
        Ok(())
    }

    /// Snapshot of the three record collections
    pub fn collections(&self) -> Collections {
        Collections {
            files: self.load_collection(MEDICAL_FILES),
            requests: self.load_collection(AUTHORIZATION_REQUESTS),
            access_records: self.load_collection(ACCESS_RECORDS),
        }
    }

    /// Run `work` against a working copy of files, requests and access
    /// records. On `Ok` all three are written in one batch; on `Err` the
    /// store is left untouched.
    pub fn transaction<T>(
        &mut self,
        work: impl FnOnce(&mut Collections) -> MedshareResult<T>,
    ) -> MedshareResult<T> {
        let mut collections = self.collections();
        let out = work(&mut collections)?;

        let batch = vec![
            (MEDICAL_FILES.to_string(), encode_collection(&collections.files)?),
            (
                AUTHORIZATION_REQUESTS.to_string(),
                encode_collection(&collections.requests)?,
            ),
            (
                ACCESS_RECORDS.to_string(),
                encode_collection(&collections.access_records)?,
            ),
        ];
        self.store.write_batch(batch);
        Ok(out)
    }
}

fn encode_collection<T: Serialize>(items: &[T]) -> MedshareResult<String> {
    Ok(serde_json::to_string(&EnvelopeRef {
        version: SCHEMA_VERSION,
        items,
    })?)
}

/// Working set of one unit of work
#[derive(Clone, Debug, Default)]
pub struct Collections {
    pub files: Vec<MedicalFile>,
    pub requests: Vec<AuthorizationRequest>,
    pub access_records: Vec<AccessRecord>,
}

impl Collections {
    pub fn file(&self, id: &str) -> MedshareResult<&MedicalFile> {
        self.files
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| MedshareError::not_found(format!("Medical file {}", id)))
    }

    pub fn request(&self, id: &str) -> MedshareResult<&AuthorizationRequest> {
        self.requests
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| MedshareError::not_found(format!("Authorization request {}", id)))
    }

    /// Revision to stamp on the next request transition
    pub fn next_revision(&self) -> u64 {
        self.requests.iter().map(|r| r.revision).max().unwrap_or(0) + 1
    }

    pub fn insert_file(&mut self, file: MedicalFile) -> MedshareResult<()> {
        validate(EntryTypes::MedicalFile(&file)).into_result()?;
        self.files.push(file);
        Ok(())
    }

    /// Apply `change` to a file and re-validate it
    pub fn update_file<F>(&mut self, id: &str, change: F) -> MedshareResult<&MedicalFile>
    where
        F: FnOnce(&mut MedicalFile),
    {
        let file = self
            .files
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| MedshareError::not_found(format!("Medical file {}", id)))?;
        change(file);
        validate(EntryTypes::MedicalFile(&*file)).into_result()?;
        Ok(&*file)
    }

    /// Insert or replace a request by id, then re-derive its file's status
    pub fn put_request(&mut self, request: AuthorizationRequest) -> MedshareResult<()> {
        validate(EntryTypes::AuthorizationRequest(&request)).into_result()?;
        let file_id = request.data_id.clone();
        match self.requests.iter_mut().find(|r| r.id == request.id) {
            Some(slot) => *slot = request,
            None => self.requests.push(request),
        }
        self.sync_file_status(&file_id)
    }

    pub fn append_access_record(&mut self, record: AccessRecord) -> MedshareResult<()> {
        validate(EntryTypes::AccessRecord(&record)).into_result()?;
        self.access_records.push(record);
        Ok(())
    }

    /// Set the file's `auth_status` to that of its latest request
    pub fn sync_file_status(&mut self, file_id: &str) -> MedshareResult<()> {
        let status = derive_auth_status(file_id, &self.requests);
        self.update_file(file_id, |f| f.auth_status = status)?;
        Ok(())
    }

    /// Remove a file with every request and access record pointing at it
    pub fn remove_file_cascade(&mut self, id: &str) -> MedshareResult<CascadeSummary> {
        let position = self
            .files
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| MedshareError::not_found(format!("Medical file {}", id)))?;
        let file = self.files.remove(position);

        let requests_before = self.requests.len();
        self.requests.retain(|r| r.data_id != id);
        let records_before = self.access_records.len();
        self.access_records.retain(|a| a.file_id != id);

        Ok(CascadeSummary {
            removed_requests: requests_before - self.requests.len(),
            removed_access_records: records_before - self.access_records.len(),
            file,
        })
    }
}

/// What a cascading delete removed
#[derive(Clone, Debug)]
pub struct CascadeSummary {
    pub file: MedicalFile,
    pub removed_requests: usize,
    pub removed_access_records: usize,
}
