//! Medical file registry.
//!
//! Patients upload, edit, list and delete their own files. Doctors browse
//! files of their department with the authorization state of their own
//! latest request overlaid, and patient PII held back until the request is
//! approved and the identity explicitly revealed.

use chrono::{DateTime, Utc};
use log::info;
use medshare_integrity::{
    age_from_id_card, latest_request_for_file, latest_request_for_pair, AuthorizationStatus,
    FileCategory, FileStatus, MedicalFile, PatientSnapshot,
};
use medshare_shared::{
    require_capability, require_owner, validate_file_size, validate_required, validate_title,
    Capability, MedshareError, MedshareResult, PaginatedResult, PaginationInput, Session,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::generate_id;
use crate::store::KeyValueStore;
use crate::MedshareBackend;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const TOP_VIEWED_LIMIT: usize = 5;

// ============================================================
// INPUTS AND VIEWS
// ============================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMedicalFileInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: FileCategory,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Raw bytes; when present the stored record carries their sha256
    #[serde(default)]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub blob_url: Option<String>,
}

/// Editable metadata; `None` leaves a field unchanged
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMedicalFileInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<FileCategory>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientFileFilters {
    #[serde(default)]
    pub category: Option<FileCategory>,
    #[serde(default)]
    pub auth_status: Option<AuthorizationStatus>,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(flatten)]
    pub pagination: PaginationInput,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorFileFilters {
    #[serde(default)]
    pub data_type: Option<FileCategory>,
    /// Matched against the doctor's own status for each file
    #[serde(default)]
    pub auth_status: Option<AuthorizationStatus>,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(flatten)]
    pub pagination: PaginationInput,
}

/// A file as one doctor sees it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorFileView {
    pub id: String,
    pub patient_id: String,
    pub title: String,
    pub description: String,
    pub category: FileCategory,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub mime_type: String,
    pub upload_time: DateTime<Utc>,
    pub department_name: Option<String>,
    /// This doctor's latest request status, lazy expiry applied
    pub auth_status: AuthorizationStatus,
    pub request_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_patient_identity_revealed: bool,
    /// Only set once approved and revealed
    pub patient: Option<PatientSnapshot>,
}

/// Result of a cascading delete
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedFile {
    pub file_id: String,
    /// Object URL the caller should now release
    pub blob_url: Option<String>,
    pub removed_requests: usize,
    pub removed_access_records: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStatistics {
    pub category: FileCategory,
    pub count: usize,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileStatistics {
    pub total_files: usize,
    pub total_size: u64,
    pub by_category: Vec<CategoryStatistics>,
    pub most_viewed: Vec<MedicalFile>,
}

// ============================================================
// HELPERS
// ============================================================

/// Lowercase hex sha256
pub fn content_checksum(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Extension after the last dot, or empty
fn file_extension(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

fn matches_keyword(file: &MedicalFile, keyword: &Option<String>) -> bool {
    match keyword.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(k) => {
            let k = k.to_lowercase();
            file.title.to_lowercase().contains(&k) || file.description.to_lowercase().contains(&k)
        }
    }
}

fn newest_first(files: &mut [MedicalFile]) {
    files.sort_by(|a, b| b.upload_time.cmp(&a.upload_time));
}

impl<S: KeyValueStore> MedshareBackend<S> {
    /// Store a new file for the session's patient
    pub fn upload_medical_file(
        &mut self,
        session: &Session,
        input: UploadMedicalFileInput,
    ) -> MedshareResult<MedicalFile> {
        require_capability(session, Capability::UploadFile)?;

        let mut checks = validate_title(&input.title, "title");
        checks.merge(validate_required(&input.file_name, "fileName"));
        checks.merge(validate_file_size(
            input.file_size,
            self.config.max_file_size,
        ));
        checks.into_result()?;

        let patient = self.patient_for(session)?;
        let now = self.now();

        let mut snapshot = PatientSnapshot::from(&patient);
        snapshot.age = age_from_id_card(&patient.id_card, now.date_naive());

        let file = MedicalFile {
            id: generate_id("file", now),
            patient_id: patient.id.clone(),
            title: input.title.trim().to_string(),
            description: input.description,
            category: input.category,
            file_type: file_extension(&input.file_name),
            original_name: input.file_name.clone(),
            file_name: input.file_name,
            file_size: input.file_size,
            mime_type: input
                .mime_type
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            status: FileStatus::Completed,
            upload_time: now,
            updated_at: now,
            auth_status: AuthorizationStatus::NotRequested,
            authorization_count: 0,
            view_count: 0,
            download_count: 0,
            department_name: Some(patient.current_department.clone()),
            checksum: input.content.as_deref().map(content_checksum),
            is_verified: true,
            verified_at: Some(now),
            patient: snapshot,
            blob_url: input.blob_url,
        };

        let stored = file.clone();
        self.storage.transaction(|c| {
            let duplicate = c.files.iter().any(|f| {
                f.patient_id == file.patient_id
                    && f.file_name == file.file_name
                    && f.file_size == file.file_size
            });
            if duplicate {
                return Err(MedshareError::Conflict(format!(
                    "file \"{}\" has already been uploaded",
                    file.file_name
                )));
            }
            c.insert_file(file)
        })?;

        info!(
            "Patient {} uploaded {} ({} bytes) to {}",
            stored.patient_id,
            stored.id,
            stored.file_size,
            patient.current_department
        );
        Ok(stored)
    }

    /// Edit title, description or category of an owned file
    pub fn update_medical_file(
        &mut self,
        session: &Session,
        file_id: &str,
        changes: UpdateMedicalFileInput,
    ) -> MedshareResult<MedicalFile> {
        require_capability(session, Capability::ManageOwnFiles)?;
        let now = self.now();

        let updated = self.storage.transaction(|c| {
            require_owner(session, &c.file(file_id)?.patient_id, "Medical file")?;
            let file = c.update_file(file_id, |f| {
                if let Some(title) = changes.title {
                    f.title = title.trim().to_string();
                }
                if let Some(description) = changes.description {
                    f.description = description;
                }
                if let Some(category) = changes.category {
                    f.category = category;
                }
                f.updated_at = now;
            })?;
            Ok(file.clone())
        })?;

        info!("Patient {} updated file {}", session.user_id, file_id);
        Ok(updated)
    }

    /// Delete an owned file along with its requests and access records
    pub fn delete_medical_file(
        &mut self,
        session: &Session,
        file_id: &str,
    ) -> MedshareResult<DeletedFile> {
        require_capability(session, Capability::ManageOwnFiles)?;

        let summary = self.storage.transaction(|c| {
            require_owner(session, &c.file(file_id)?.patient_id, "Medical file")?;
            c.remove_file_cascade(file_id)
        })?;

        info!(
            "Patient {} deleted file {} ({} requests, {} access records removed)",
            session.user_id, file_id, summary.removed_requests, summary.removed_access_records
        );
        Ok(DeletedFile {
            file_id: summary.file.id,
            blob_url: summary.file.blob_url,
            removed_requests: summary.removed_requests,
            removed_access_records: summary.removed_access_records,
        })
    }

    /// The session patient's own files, newest first
    pub fn get_patient_medical_files(
        &mut self,
        session: &Session,
        filters: &PatientFileFilters,
    ) -> MedshareResult<PaginatedResult<MedicalFile>> {
        require_capability(session, Capability::ListOwnFiles)?;
        let now = self.now();
        let collections = self.storage.collections();

        let mut files: Vec<MedicalFile> = collections
            .files
            .into_iter()
            .filter(|f| f.patient_id == session.user_id)
            .map(|mut file| {
                file.auth_status = latest_request_for_file(&file.id, &collections.requests)
                    .map(|r| r.effective_status(now).into())
                    .unwrap_or(AuthorizationStatus::NotRequested);
                file
            })
            .filter(|f| filters.category.map_or(true, |c| f.category == c))
            .filter(|f| filters.auth_status.map_or(true, |s| f.auth_status == s))
            .filter(|f| matches_keyword(f, &filters.keyword))
            .collect();
        newest_first(&mut files);

        let (page, page_size) = self.config.page_of(&filters.pagination);
        Ok(PaginatedResult::paginate(files, page, page_size))
    }

    /// Files of the doctor's department (plus untagged ones), newest first
    pub fn get_doctor_medical_data_list(
        &mut self,
        session: &Session,
        filters: &DoctorFileFilters,
    ) -> MedshareResult<PaginatedResult<DoctorFileView>> {
        require_capability(session, Capability::BrowseDepartmentFiles)?;
        let doctor = self.doctor_for(session)?;
        let now = self.now();
        let collections = self.storage.collections();

        let mut files: Vec<MedicalFile> = collections
            .files
            .iter()
            .filter(|f| f.status.is_shareable())
            .filter(|f| visible_to_department(f, &doctor.department))
            .filter(|f| filters.data_type.map_or(true, |c| f.category == c))
            .filter(|f| matches_keyword(f, &filters.keyword))
            .cloned()
            .collect();
        newest_first(&mut files);

        let views: Vec<DoctorFileView> = files
            .into_iter()
            .map(|file| {
                let request = latest_request_for_pair(&file.id, &doctor.id, &collections.requests);
                let status: AuthorizationStatus = request
                    .map(|r| r.effective_status(now).into())
                    .unwrap_or(AuthorizationStatus::NotRequested);
                let revealed = status == AuthorizationStatus::Approved
                    && request.is_some_and(|r| r.is_patient_identity_revealed);

                DoctorFileView {
                    patient: revealed.then(|| file.patient.clone()),
                    request_id: request.map(|r| r.id.clone()),
                    expires_at: request.and_then(|r| r.expires_at),
                    is_patient_identity_revealed: revealed,
                    auth_status: status,
                    id: file.id,
                    patient_id: file.patient_id,
                    title: file.title,
                    description: file.description,
                    category: file.category,
                    file_name: file.file_name,
                    file_type: file.file_type,
                    file_size: file.file_size,
                    mime_type: file.mime_type,
                    upload_time: file.upload_time,
                    department_name: file.department_name,
                }
            })
            .filter(|view| filters.auth_status.map_or(true, |s| view.auth_status == s))
            .collect();

        let (page, page_size) = self.config.page_of(&filters.pagination);
        Ok(PaginatedResult::paginate(views, page, page_size))
    }

    /// Totals, per-category breakdown and most viewed files of the patient
    pub fn get_file_statistics(&mut self, session: &Session) -> MedshareResult<FileStatistics> {
        require_capability(session, Capability::ViewFileStatistics)?;

        let files: Vec<MedicalFile> = self
            .storage
            .collections()
            .files
            .into_iter()
            .filter(|f| f.patient_id == session.user_id)
            .collect();

        let by_category = FileCategory::ALL
            .iter()
            .map(|&category| {
                let in_category = files.iter().filter(|f| f.category == category);
                CategoryStatistics {
                    category,
                    count: in_category.clone().count(),
                    size: in_category.map(|f| f.file_size).sum(),
                }
            })
            .collect();

        let mut most_viewed = files.clone();
        most_viewed.sort_by(|a, b| b.view_count.cmp(&a.view_count));
        most_viewed.truncate(TOP_VIEWED_LIMIT);

        Ok(FileStatistics {
            total_files: files.len(),
            total_size: files.iter().map(|f| f.file_size).sum(),
            by_category,
            most_viewed,
        })
    }
}

/// Untagged files are visible to every doctor
pub(crate) fn visible_to_department(file: &MedicalFile, department: &str) -> bool {
    match file.department_name.as_deref() {
        Some(name) if !name.is_empty() => name == department,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::ApproveAuthorizationInput;
    use crate::clock::ManualClock;
    use crate::config::MockConfig;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn create_test_backend() -> (MedshareBackend, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let backend =
            MedshareBackend::with_parts(MemoryStore::new(), clock.clone(), MockConfig::default());
        (backend, clock)
    }

    fn create_test_upload(title: &str, file_name: &str) -> UploadMedicalFileInput {
        UploadMedicalFileInput {
            title: title.to_string(),
            description: format!("{} description", title),
            category: FileCategory::Report,
            file_name: file_name.to_string(),
            file_size: 1024,
            mime_type: Some("application/pdf".to_string()),
            content: None,
            blob_url: None,
        }
    }

    fn patient() -> Session {
        Session::patient("patient_cardio_001")
    }

    // ========== UPLOAD TESTS ==========

    #[test]
    fn test_upload_stamps_department_and_snapshot() {
        let (mut backend, _) = create_test_backend();
        let file = backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.PDF"))
            .unwrap();

        assert_eq!(file.patient_id, "patient_cardio_001");
        assert_eq!(file.department_name.as_deref(), Some("心血管科"));
        assert_eq!(file.auth_status, AuthorizationStatus::NotRequested);
        assert_eq!(file.status, FileStatus::Completed);
        assert_eq!(file.file_type, "pdf");
        assert_eq!(file.patient.name, "张三");
        assert_eq!(file.patient.age, Some(34));
        assert!(file.id.starts_with("file_"));
    }

    #[test]
    fn test_upload_checksum() {
        let (mut backend, _) = create_test_backend();
        let mut input = create_test_upload("ECG", "ecg.pdf");
        input.content = Some(b"abc".to_vec());
        let file = backend.upload_medical_file(&patient(), input).unwrap();
        let abc_sha256 = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(file.checksum.as_deref(), Some(abc_sha256));
    }

    #[test]
    fn test_duplicate_upload_conflicts() {
        let (mut backend, _) = create_test_backend();
        backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.pdf"))
            .unwrap();

        let err = backend
            .upload_medical_file(&patient(), create_test_upload("Other title", "ecg.pdf"))
            .unwrap_err();
        assert_eq!(err.code(), 409);

        // Same name and size from another patient is fine
        let other = Session::patient("patient_cardio_002");
        assert!(backend
            .upload_medical_file(&other, create_test_upload("ECG", "ecg.pdf"))
            .is_ok());
    }

    #[test]
    fn test_upload_validation() {
        let (mut backend, _) = create_test_backend();
        let mut input = create_test_upload("", "ecg.pdf");
        input.file_size = 0;
        let err = backend.upload_medical_file(&patient(), input).unwrap_err();
        assert_eq!(err.code(), 422);
        assert!(err.to_string().contains("title"));
        assert!(err.to_string().contains("fileSize"));

        let mut too_big = create_test_upload("Scan", "scan.dcm");
        too_big.file_size = MockConfig::default().max_file_size + 1;
        assert_eq!(
            backend
                .upload_medical_file(&patient(), too_big)
                .unwrap_err()
                .code(),
            422
        );
    }

    #[test]
    fn test_doctor_cannot_upload() {
        let (mut backend, _) = create_test_backend();
        let doctor = Session::doctor("doctor_cardio_001");
        let err = backend
            .upload_medical_file(&doctor, create_test_upload("ECG", "ecg.pdf"))
            .unwrap_err();
        assert_eq!(err.code(), 403);
    }

    // ========== UPDATE / DELETE TESTS ==========

    #[test]
    fn test_update_by_owner_only() {
        let (mut backend, clock) = create_test_backend();
        let file = backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.pdf"))
            .unwrap();
        clock.advance(Duration::minutes(5));

        let changes = UpdateMedicalFileInput {
            title: Some("ECG 2024".to_string()),
            category: Some(FileCategory::Image),
            ..Default::default()
        };
        let updated = backend
            .update_medical_file(&patient(), &file.id, changes.clone())
            .unwrap();
        assert_eq!(updated.title, "ECG 2024");
        assert_eq!(updated.category, FileCategory::Image);
        assert_eq!(updated.description, file.description);
        assert!(updated.updated_at > file.updated_at);

        let other = Session::patient("patient_cardio_002");
        assert_eq!(
            backend
                .update_medical_file(&other, &file.id, changes)
                .unwrap_err()
                .code(),
            403
        );

        let blank = UpdateMedicalFileInput {
            title: Some(" ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            backend
                .update_medical_file(&patient(), &file.id, blank)
                .unwrap_err()
                .code(),
            422
        );
    }

    #[test]
    fn test_delete_returns_blob_url() {
        let (mut backend, _) = create_test_backend();
        let mut input = create_test_upload("ECG", "ecg.pdf");
        input.blob_url = Some("blob:http://localhost/1234".to_string());
        let file = backend.upload_medical_file(&patient(), input).unwrap();

        let other = Session::patient("patient_cardio_002");
        assert_eq!(
            backend
                .delete_medical_file(&other, &file.id)
                .unwrap_err()
                .code(),
            403
        );

        let deleted = backend.delete_medical_file(&patient(), &file.id).unwrap();
        assert_eq!(
            deleted.blob_url.as_deref(),
            Some("blob:http://localhost/1234")
        );
        assert_eq!(
            backend
                .delete_medical_file(&patient(), &file.id)
                .unwrap_err()
                .code(),
            404
        );
    }

    // ========== LISTING TESTS ==========

    #[test]
    fn test_patient_listing_filters_and_order() {
        let (mut backend, clock) = create_test_backend();
        backend
            .upload_medical_file(&patient(), create_test_upload("Blood panel", "blood.pdf"))
            .unwrap();
        clock.advance(Duration::hours(1));
        let mut scan = create_test_upload("Chest X-ray", "chest.png");
        scan.category = FileCategory::Image;
        backend.upload_medical_file(&patient(), scan).unwrap();
        backend
            .upload_medical_file(
                &Session::patient("patient_cardio_002"),
                create_test_upload("Not mine", "x.pdf"),
            )
            .unwrap();

        let all = backend
            .get_patient_medical_files(&patient(), &PatientFileFilters::default())
            .unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.items[0].title, "Chest X-ray");

        let images = backend
            .get_patient_medical_files(
                &patient(),
                &PatientFileFilters {
                    category: Some(FileCategory::Image),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(images.total, 1);

        let keyword = backend
            .get_patient_medical_files(
                &patient(),
                &PatientFileFilters {
                    keyword: Some("BLOOD".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(keyword.items[0].file_name, "blood.pdf");

        let paged = backend
            .get_patient_medical_files(
                &patient(),
                &PatientFileFilters {
                    pagination: PaginationInput::new(2, 1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(paged.items.len(), 1);
        assert_eq!(paged.total_pages, 2);
        assert_eq!(paged.items[0].title, "Blood panel");
    }

    #[test]
    fn test_doctor_listing_is_department_scoped() {
        let (mut backend, _) = create_test_backend();
        backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.pdf"))
            .unwrap();
        backend
            .upload_medical_file(
                &Session::patient("patient_respiratory_001"),
                create_test_upload("Spirometry", "lung.pdf"),
            )
            .unwrap();

        let cardio = Session::doctor("doctor_cardio_001");
        let page = backend
            .get_doctor_medical_data_list(&cardio, &DoctorFileFilters::default())
            .unwrap();
        assert_eq!(page.total, 1);
        let view = &page.items[0];
        assert_eq!(view.title, "ECG");
        assert_eq!(view.auth_status, AuthorizationStatus::NotRequested);
        assert!(view.patient.is_none());
        assert!(!view.is_patient_identity_revealed);

        let err = backend
            .get_doctor_medical_data_list(&patient(), &DoctorFileFilters::default())
            .unwrap_err();
        assert_eq!(err.code(), 403);
    }

    #[test]
    fn test_untagged_files_visible_to_all_doctors() {
        let (mut backend, _) = create_test_backend();
        let file = backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.pdf"))
            .unwrap();
        backend
            .storage_mut()
            .transaction(|c| {
                c.update_file(&file.id, |f| f.department_name = None)?;
                Ok(())
            })
            .unwrap();

        let page = backend
            .get_doctor_medical_data_list(
                &Session::doctor("doctor_respiratory_001"),
                &DoctorFileFilters::default(),
            )
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_patient_listing_shows_lapsed_approval_as_expired() {
        let (mut backend, clock) = create_test_backend();
        let doctor = Session::doctor("doctor_cardio_001");
        let file = backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.pdf"))
            .unwrap();
        let request = backend
            .request_authorization(&doctor, &file.id, "x")
            .unwrap();
        backend
            .approve_authorization_request(
                &patient(),
                ApproveAuthorizationInput {
                    request_id: request.id,
                    expires_in: 1,
                    notes: None,
                },
            )
            .unwrap();

        clock.advance(Duration::days(3));
        let expired = PatientFileFilters {
            auth_status: Some(AuthorizationStatus::Expired),
            ..Default::default()
        };
        let page = backend
            .get_patient_medical_files(&patient(), &expired)
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].auth_status, AuthorizationStatus::Expired);

        let approved = PatientFileFilters {
            auth_status: Some(AuthorizationStatus::Approved),
            ..Default::default()
        };
        assert_eq!(
            backend
                .get_patient_medical_files(&patient(), &approved)
                .unwrap()
                .total,
            0
        );

        // Listing does not write the lapse
        assert_eq!(
            backend.storage().collections().files[0].auth_status,
            AuthorizationStatus::Approved
        );
    }

    #[test]
    fn test_unfinished_files_are_not_offered_to_doctors() {
        let (mut backend, _) = create_test_backend();
        let doctor = Session::doctor("doctor_cardio_001");
        let file = backend
            .upload_medical_file(&patient(), create_test_upload("ECG", "ecg.pdf"))
            .unwrap();

        for status in [FileStatus::Uploading, FileStatus::Processing, FileStatus::Failed] {
            backend
                .storage_mut()
                .transaction(|c| {
                    c.update_file(&file.id, |f| f.status = status)?;
                    Ok(())
                })
                .unwrap();

            let page = backend
                .get_doctor_medical_data_list(&doctor, &DoctorFileFilters::default())
                .unwrap();
            assert_eq!(page.total, 0, "{}", status);
            let err = backend
                .request_authorization(&doctor, &file.id, "x")
                .unwrap_err();
            assert_eq!(err.code(), 409, "{}", status);
        }

        // Still listed to its owner
        let own = backend
            .get_patient_medical_files(&patient(), &PatientFileFilters::default())
            .unwrap();
        assert_eq!(own.items[0].status, FileStatus::Failed);
    }

    #[test]
    fn test_file_statistics() {
        let (mut backend, _) = create_test_backend();
        backend
            .upload_medical_file(&patient(), create_test_upload("A", "a.pdf"))
            .unwrap();
        let mut image = create_test_upload("B", "b.png");
        image.category = FileCategory::Image;
        image.file_size = 4096;
        backend.upload_medical_file(&patient(), image).unwrap();

        let stats = backend.get_file_statistics(&patient()).unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 5120);
        let images = stats
            .by_category
            .iter()
            .find(|c| c.category == FileCategory::Image)
            .unwrap();
        assert_eq!((images.count, images.size), (1, 4096));
        assert_eq!(stats.by_category.len(), 4);
        assert_eq!(stats.most_viewed.len(), 2);
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("report.final.PDF"), "pdf");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension(".hidden"), "");
    }
}
