//! Append-only access log.

use chrono::{DateTime, Utc};
use medshare_integrity::{
    latest_request_for_pair, AccessRecord, AccessType, AuthorizationRequest, DoctorProfile,
    DoctorSummary, FileSummary, MedicalFile,
};
use medshare_shared::{
    mask_name, mask_text, require_capability, Capability, MedshareResult, PaginatedResult,
    PaginationInput, Role, Session,
};
use serde::{Deserialize, Serialize};

use crate::store::KeyValueStore;
use crate::MedshareBackend;

/// Simulated client address
const LOOPBACK: &str = "127.0.0.1";

pub(crate) fn new_access_record(
    id: String,
    access_type: AccessType,
    doctor: &DoctorProfile,
    file: &MedicalFile,
    request_id: Option<String>,
    now: DateTime<Utc>,
    duration: u32,
) -> AccessRecord {
    AccessRecord {
        id,
        file_id: file.id.clone(),
        doctor_id: doctor.id.clone(),
        patient_id: file.patient_id.clone(),
        request_id,
        access_type,
        access_time: now,
        duration,
        ip_address: Some(LOOPBACK.to_string()),
        doctor: DoctorSummary::from(doctor),
        file: FileSummary::from(file),
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecordFilters {
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub access_type: Option<AccessType>,
    #[serde(flatten)]
    pub pagination: PaginationInput,
}

/// An access record as shown to one participant
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecordView {
    #[serde(flatten)]
    pub record: AccessRecord,
    /// Whether the doctor fields are shown unmasked
    pub is_identity_revealed: bool,
}

/// Whether the patient has revealed the doctor behind `record`
fn doctor_revealed(record: &AccessRecord, requests: &[AuthorizationRequest]) -> bool {
    let request = match &record.request_id {
        Some(id) => requests.iter().find(|r| &r.id == id),
        None => latest_request_for_pair(&record.file_id, &record.doctor_id, requests),
    };
    request.is_some_and(|r| r.is_identity_revealed)
}

fn mask_doctor(doctor: &mut DoctorSummary) {
    doctor.name = mask_name(&doctor.name);
    doctor.hospital = mask_text(&doctor.hospital, 2, 2);
}

impl<S: KeyValueStore> MedshareBackend<S> {
    /// Records the session participates in, newest first.
    ///
    /// Patients see doctor fields masked until they reveal that doctor.
    pub fn get_access_records_list(
        &mut self,
        session: &Session,
        filters: &AccessRecordFilters,
    ) -> MedshareResult<PaginatedResult<AccessRecordView>> {
        require_capability(session, Capability::ListAccessRecords)?;
        let collections = self.storage.collections();

        let mut records: Vec<AccessRecordView> = collections
            .access_records
            .iter()
            .filter(|a| match session.role {
                Role::Patient => a.patient_id == session.user_id,
                Role::Doctor => a.doctor_id == session.user_id,
            })
            .filter(|a| filters.file_id.as_ref().map_or(true, |id| &a.file_id == id))
            .filter(|a| filters.access_type.map_or(true, |t| a.access_type == t))
            .map(|a| {
                let revealed =
                    session.is_doctor() || doctor_revealed(a, &collections.requests);
                let mut record = a.clone();
                if !revealed {
                    mask_doctor(&mut record.doctor);
                }
                AccessRecordView {
                    record,
                    is_identity_revealed: revealed,
                }
            })
            .collect();
        records.sort_by(|a, b| b.record.access_time.cmp(&a.record.access_time));

        let (page, page_size) = self.config.page_of(&filters.pagination);
        Ok(PaginatedResult::paginate(records, page, page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::ApproveAuthorizationInput;
    use crate::clock::ManualClock;
    use crate::config::MockConfig;
    use crate::files::UploadMedicalFileInput;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use medshare_integrity::FileCategory;

    fn create_test_backend() -> (MedshareBackend, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let backend =
            MedshareBackend::with_parts(MemoryStore::new(), clock.clone(), MockConfig::default());
        (backend, clock)
    }

    fn upload(backend: &mut MedshareBackend, patient: &Session, name: &str) -> String {
        backend
            .upload_medical_file(
                patient,
                UploadMedicalFileInput {
                    title: name.to_string(),
                    description: String::new(),
                    category: FileCategory::Report,
                    file_name: format!("{}.pdf", name),
                    file_size: 100,
                    mime_type: None,
                    content: None,
                    blob_url: None,
                },
            )
            .unwrap()
            .id
    }

    /// Request, approve and view `file_id` as `doctor`; returns the request id
    fn grant_and_view(
        backend: &mut MedshareBackend,
        patient: &Session,
        doctor: &Session,
        file_id: &str,
    ) -> String {
        let request = backend
            .request_authorization(doctor, file_id, "care")
            .unwrap();
        backend
            .approve_authorization_request(
                patient,
                ApproveAuthorizationInput {
                    request_id: request.id.clone(),
                    expires_in: 30,
                    notes: None,
                },
            )
            .unwrap();
        backend.view_medical_data(doctor, file_id).unwrap();
        request.id
    }

    #[test]
    fn test_records_are_scoped_by_role() {
        let (mut backend, clock) = create_test_backend();
        let p1 = Session::patient("patient_cardio_001");
        let p2 = Session::patient("patient_cardio_002");
        let d1 = Session::doctor("doctor_cardio_001");
        let d2 = Session::doctor("doctor_cardio_002");

        let f1 = upload(&mut backend, &p1, "ecg");
        let f2 = upload(&mut backend, &p2, "holter");
        grant_and_view(&mut backend, &p1, &d1, &f1);
        clock.advance(Duration::minutes(1));
        grant_and_view(&mut backend, &p2, &d1, &f2);
        grant_and_view(&mut backend, &p1, &d2, &f1);

        let filters = AccessRecordFilters::default();
        assert_eq!(
            backend
                .get_access_records_list(&p1, &filters)
                .unwrap()
                .total,
            2
        );
        assert_eq!(
            backend
                .get_access_records_list(&p2, &filters)
                .unwrap()
                .total,
            1
        );

        let doctor_page = backend.get_access_records_list(&d1, &filters).unwrap();
        assert_eq!(doctor_page.total, 2);
        assert_eq!(doctor_page.items[0].record.file_id, f2);
        assert!(doctor_page.items.iter().all(|v| v.is_identity_revealed));

        let by_file = backend
            .get_access_records_list(
                &d1,
                &AccessRecordFilters {
                    file_id: Some(f1.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_file.total, 1);
    }

    #[test]
    fn test_patient_sees_masked_doctor_until_revealed() {
        let (mut backend, _) = create_test_backend();
        let patient = Session::patient("patient_cardio_001");
        let doctor = Session::doctor("doctor_cardio_001");
        let file_id = upload(&mut backend, &patient, "ecg");
        let request_id = grant_and_view(&mut backend, &patient, &doctor, &file_id);

        let page = backend
            .get_access_records_list(&patient, &AccessRecordFilters::default())
            .unwrap();
        let view = &page.items[0];
        assert!(!view.is_identity_revealed);
        assert_eq!(view.record.doctor.name, "***");
        assert_ne!(view.record.doctor.hospital, "浙江大学医学院附属第一医院");

        backend
            .reveal_doctor_identity(&patient, &request_id)
            .unwrap();
        let page = backend
            .get_access_records_list(
                &patient,
                &AccessRecordFilters {
                    access_type: Some(AccessType::View),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items[0].is_identity_revealed);
        assert_eq!(page.items[0].record.doctor.name, "刘医生");
    }

    #[test]
    fn test_record_serializes_flat() {
        let (mut backend, _) = create_test_backend();
        let patient = Session::patient("patient_cardio_001");
        let doctor = Session::doctor("doctor_cardio_001");
        let file_id = upload(&mut backend, &patient, "ecg");
        grant_and_view(&mut backend, &patient, &doctor, &file_id);

        let page = backend
            .get_access_records_list(&doctor, &AccessRecordFilters::default())
            .unwrap();
        let json = serde_json::to_value(&page.items[0]).unwrap();
        assert_eq!(json["accessType"], "view");
        assert_eq!(json["ipAddress"], LOOPBACK);
        assert_eq!(json["isIdentityRevealed"], true);
    }
}
