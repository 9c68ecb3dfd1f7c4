//! medshare Coordinator
//!
//! Storage-backed operations of the medical data sharing backend:
//! user directory, file registry, authorization workflow and access log,
//! plus an HTTP-shaped facade over them.
//!
//! Every operation takes an explicit [`Session`]. Writes that touch more
//! than one collection go through [`Storage::transaction`], so files,
//! requests and access records are committed together or not at all.

use chrono::{DateTime, Utc};

pub mod access;
pub mod api;
pub mod authorization;
pub mod clock;
pub mod config;
pub mod files;
pub mod ids;
pub mod store;
pub mod users;

pub use access::{AccessRecordFilters, AccessRecordView};
pub use api::{ApiRequest, ApiResponse, HttpMethod, MockApi};
pub use authorization::{
    ApproveAuthorizationInput, DataInfo, DoctorIdentity, PatientIdentity,
    RejectAuthorizationInput, RequestFilters,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MockConfig;
pub use files::{
    CategoryStatistics, DeletedFile, DoctorFileFilters, DoctorFileView, FileStatistics,
    PatientFileFilters, UpdateMedicalFileInput, UploadMedicalFileInput,
};
pub use medshare_integrity as integrity;
pub use medshare_shared::{MedshareError, MedshareResult, Role, Session};
pub use store::{Collections, KeyValueStore, MemoryStore, Storage};
pub use users::{seed_user_database, UserListing};

/// The backend: a store, a clock and configuration
pub struct MedshareBackend<S: KeyValueStore = MemoryStore> {
    storage: Storage<S>,
    clock: Box<dyn Clock>,
    config: MockConfig,
}

impl MedshareBackend<MemoryStore> {
    /// In-memory backend on the wall clock
    pub fn new(config: MockConfig) -> Self {
        Self::with_parts(MemoryStore::new(), SystemClock, config)
    }
}

impl Default for MedshareBackend<MemoryStore> {
    fn default() -> Self {
        Self::new(MockConfig::default())
    }
}

impl<S: KeyValueStore> MedshareBackend<S> {
    pub fn with_parts(store: S, clock: impl Clock + 'static, config: MockConfig) -> Self {
        Self {
            storage: Storage::new(store),
            clock: Box::new(clock),
            config,
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage<S> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage<S> {
        &mut self.storage
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
