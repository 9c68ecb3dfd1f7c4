//! Authorization workflow.
//!
//! A doctor asks to view a file, the owning patient approves or rejects,
//! and an approval may lapse. Lapses are detected lazily: listings show
//! them without writing, while operations that need a live approval commit
//! the move to `expired` before failing.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use medshare_integrity::{
    latest_request_for_pair, AccessRecord, AccessType, AuthorizationRequest, DoctorProfile,
    FileCategory, MedicalFile, PatientSnapshot, RequestStatus,
};
use medshare_shared::{
    require_capability, require_owner, Capability, MedshareError, MedshareResult,
    PaginatedResult, PaginationInput, Session,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::access::new_access_record;
use crate::files::visible_to_department;
use crate::ids::generate_id;
use crate::store::{Collections, KeyValueStore};
use crate::MedshareBackend;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveAuthorizationInput {
    pub request_id: String,
    /// Days until the approval lapses; 0 never lapses
    #[serde(default)]
    pub expires_in: u32,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectAuthorizationInput {
    pub request_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilters {
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(flatten)]
    pub pagination: PaginationInput,
}

/// What the patient learns when revealing a doctor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorIdentity {
    pub request_id: String,
    pub doctor: DoctorProfile,
    /// The doctor's records on this file, newest first
    pub access_records: Vec<AccessRecord>,
    pub total_access: usize,
    pub last_access_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub category: FileCategory,
    pub upload_date: DateTime<Utc>,
}

/// What the doctor learns when revealing a patient
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientIdentity {
    pub patient_id: String,
    pub patient: PatientSnapshot,
    pub data_info: DataInfo,
    pub trace_time: DateTime<Utc>,
}

/// View duration range for simulated reads, in seconds
const VIEW_DURATION_SECS: std::ops::RangeInclusive<u32> = 30..=330;

/// Move every lapsed approval matching `select` to `expired`.
///
/// Only the latest request of a (file, doctor) pair is moved; an approval
/// already superseded by a re-request keeps its revision.
pub(crate) fn expire_lapsed_requests<F>(
    c: &mut Collections,
    now: DateTime<Utc>,
    select: F,
) -> MedshareResult<usize>
where
    F: Fn(&AuthorizationRequest) -> bool,
{
    let lapsed: Vec<AuthorizationRequest> = c
        .requests
        .iter()
        .filter(|r| select(r) && r.is_lapsed(now))
        .filter(|r| {
            latest_request_for_pair(&r.data_id, &r.doctor_id, &c.requests)
                .is_some_and(|latest| latest.id == r.id)
        })
        .cloned()
        .collect();

    let count = lapsed.len();
    for mut request in lapsed {
        request.transition(RequestStatus::Expired, c.next_revision())?;
        c.put_request(request)?;
    }
    Ok(count)
}

/// Latest-first ordering by request time, with revision as tie breaker
fn newest_first(a: &AuthorizationRequest, b: &AuthorizationRequest) -> std::cmp::Ordering {
    b.requested_at
        .cmp(&a.requested_at)
        .then(b.revision.cmp(&a.revision))
}

impl<S: KeyValueStore> MedshareBackend<S> {
    /// Ask the owner of `data_id` for access
    pub fn request_authorization(
        &mut self,
        session: &Session,
        data_id: &str,
        reason: &str,
    ) -> MedshareResult<AuthorizationRequest> {
        require_capability(session, Capability::RequestAuthorization)?;
        let doctor = self.doctor_for(session)?;
        let now = self.now();

        let request = self.storage.transaction(|c| {
            let file = c.file(data_id)?.clone();
            if !file.status.is_shareable() {
                return Err(MedshareError::InvalidState(format!(
                    "medical file {} is {} and cannot be shared yet",
                    data_id, file.status
                )));
            }
            if !visible_to_department(&file, &doctor.department) {
                return Err(MedshareError::forbidden(format!(
                    "medical file {} is outside department {}",
                    data_id, doctor.department
                )));
            }

            expire_lapsed_requests(c, now, |r| r.data_id == data_id && r.doctor_id == doctor.id)?;
            let pending = c.requests.iter().any(|r| {
                r.data_id == data_id
                    && r.doctor_id == doctor.id
                    && r.status == RequestStatus::Pending
            });
            if pending {
                return Err(MedshareError::Conflict(
                    "a pending authorization request already exists for this file".to_string(),
                ));
            }

            let request = AuthorizationRequest {
                id: generate_id("auth_req", now),
                data_id: file.id.clone(),
                data_name: file.title.clone(),
                data_type: file.category,
                patient_id: file.patient_id.clone(),
                doctor_id: doctor.id.clone(),
                doctor_name: doctor.name.clone(),
                doctor_department: doctor.department.clone(),
                doctor_hospital: doctor.hospital.clone(),
                reason: reason.trim().to_string(),
                status: RequestStatus::Pending,
                requested_at: now,
                processed_at: None,
                expires_at: None,
                reject_reason: None,
                notes: None,
                is_identity_revealed: false,
                is_patient_identity_revealed: false,
                revision: c.next_revision(),
            };

            c.update_file(data_id, |f| f.authorization_count += 1)?;
            c.put_request(request.clone())?;
            Ok(request)
        })?;

        info!(
            "Doctor {} requested authorization for file {} ({})",
            doctor.id, data_id, request.id
        );
        Ok(request)
    }

    pub fn approve_authorization_request(
        &mut self,
        session: &Session,
        input: ApproveAuthorizationInput,
    ) -> MedshareResult<AuthorizationRequest> {
        require_capability(session, Capability::ReviewAuthorization)?;
        let now = self.now();

        let approved = self.storage.transaction(|c| {
            let mut request = c.request(&input.request_id)?.clone();
            require_owner(
                session,
                &c.file(&request.data_id)?.patient_id,
                "Authorization request",
            )?;

            request.transition(RequestStatus::Approved, c.next_revision())?;
            request.processed_at = Some(now);
            request.expires_at = (input.expires_in > 0)
                .then(|| now + Duration::days(i64::from(input.expires_in)));
            request.notes = input.notes;

            c.put_request(request.clone())?;
            Ok(request)
        })?;

        info!(
            "Patient {} approved request {} for doctor {} (expires {:?})",
            session.user_id, approved.id, approved.doctor_id, approved.expires_at
        );
        Ok(approved)
    }

    pub fn reject_authorization_request(
        &mut self,
        session: &Session,
        input: RejectAuthorizationInput,
    ) -> MedshareResult<AuthorizationRequest> {
        require_capability(session, Capability::ReviewAuthorization)?;
        let now = self.now();

        let rejected = self.storage.transaction(|c| {
            let mut request = c.request(&input.request_id)?.clone();
            require_owner(
                session,
                &c.file(&request.data_id)?.patient_id,
                "Authorization request",
            )?;

            request.transition(RequestStatus::Rejected, c.next_revision())?;
            request.processed_at = Some(now);
            request.reject_reason = Some(input.reason.unwrap_or_default());

            c.put_request(request.clone())?;
            Ok(request)
        })?;

        info!(
            "Patient {} rejected request {} for doctor {}",
            session.user_id, rejected.id, rejected.doctor_id
        );
        Ok(rejected)
    }

    /// Live approval of `doctor` on `data_id`.
    ///
    /// A lapsed approval is committed as expired before `Expired` is
    /// returned.
    fn granting_request(
        &mut self,
        doctor: &DoctorProfile,
        data_id: &str,
        now: DateTime<Utc>,
    ) -> MedshareResult<AuthorizationRequest> {
        let collections = self.storage.collections();
        collections.file(data_id)?;

        match latest_request_for_pair(data_id, &doctor.id, &collections.requests) {
            Some(request) if request.grants_access(now) => Ok(request.clone()),
            Some(request) if request.is_lapsed(now) => Err(self.commit_lapse(request, now)),
            _ => Err(MedshareError::forbidden(format!(
                "no approved authorization for medical file {}",
                data_id
            ))),
        }
    }

    fn commit_lapse(
        &mut self,
        request: &AuthorizationRequest,
        now: DateTime<Utc>,
    ) -> MedshareError {
        let id = request.id.clone();
        if let Err(e) = self
            .storage
            .transaction(|c| expire_lapsed_requests(c, now, |r| r.id == id))
        {
            return e;
        }
        warn!(
            "Authorization request {} lapsed at {:?}",
            request.id, request.expires_at
        );
        MedshareError::Expired(format!(
            "authorization for medical file {} has expired; request it again",
            request.data_id
        ))
    }

    /// Read an approved file, leaving a `view` access record
    pub fn view_medical_data(
        &mut self,
        session: &Session,
        data_id: &str,
    ) -> MedshareResult<MedicalFile> {
        require_capability(session, Capability::ViewMedicalData)?;
        let doctor = self.doctor_for(session)?;
        let now = self.now();
        let grant = self.granting_request(&doctor, data_id, now)?;
        let duration = rand::thread_rng().gen_range(VIEW_DURATION_SECS);

        let file = self.storage.transaction(|c| {
            let file = c.update_file(data_id, |f| f.view_count += 1)?.clone();
            c.append_access_record(new_access_record(
                generate_id("access", now),
                AccessType::View,
                &doctor,
                &file,
                Some(grant.id.clone()),
                now,
                duration,
            ))?;
            Ok(file)
        })?;

        info!(
            "Doctor {} viewed file {} for {}s",
            doctor.id, data_id, duration
        );
        Ok(file)
    }

    /// Doctor side: unmask the patient behind an approved file
    pub fn reveal_patient_identity(
        &mut self,
        session: &Session,
        data_id: &str,
    ) -> MedshareResult<PatientIdentity> {
        require_capability(session, Capability::RevealPatientIdentity)?;
        let doctor = self.doctor_for(session)?;
        let now = self.now();
        let grant = self.granting_request(&doctor, data_id, now)?;

        let identity = self.storage.transaction(|c| {
            let mut request = c.request(&grant.id)?.clone();
            request.is_patient_identity_revealed = true;
            c.put_request(request)?;

            let file = c.file(data_id)?.clone();
            c.append_access_record(new_access_record(
                generate_id("trace", now),
                AccessType::Preview,
                &doctor,
                &file,
                Some(grant.id.clone()),
                now,
                0,
            ))?;

            Ok(PatientIdentity {
                patient_id: file.patient_id,
                patient: file.patient,
                data_info: DataInfo {
                    id: file.id,
                    name: file.title,
                    category: file.category,
                    upload_date: file.upload_time,
                },
                trace_time: now,
            })
        })?;

        info!(
            "Doctor {} revealed the patient behind file {}",
            doctor.id, data_id
        );
        Ok(identity)
    }

    /// Patient side: unmask the doctor behind an approved request
    pub fn reveal_doctor_identity(
        &mut self,
        session: &Session,
        request_id: &str,
    ) -> MedshareResult<DoctorIdentity> {
        require_capability(session, Capability::RevealDoctorIdentity)?;
        let now = self.now();

        let request = {
            let collections = self.storage.collections();
            let request = collections.request(request_id)?.clone();
            require_owner(
                session,
                &collections.file(&request.data_id)?.patient_id,
                "Authorization request",
            )?;
            request
        };
        if request.is_lapsed(now) {
            return Err(self.commit_lapse(&request, now));
        }
        if !request.grants_access(now) {
            return Err(MedshareError::forbidden(format!(
                "authorization request {} has not been approved",
                request_id
            )));
        }

        let doctor = self
            .get_user_database()?
            .find_doctor(&request.doctor_id)
            .cloned()
            .ok_or_else(|| MedshareError::not_found(format!("Doctor {}", request.doctor_id)))?;

        let identity = self.storage.transaction(|c| {
            let mut stored = c.request(request_id)?.clone();
            stored.is_identity_revealed = true;
            c.put_request(stored)?;

            let file = c.file(&request.data_id)?.clone();
            c.append_access_record(new_access_record(
                generate_id("trace", now),
                AccessType::Preview,
                &doctor,
                &file,
                Some(request.id.clone()),
                now,
                0,
            ))?;

            let mut records: Vec<AccessRecord> = c
                .access_records
                .iter()
                .filter(|a| a.doctor_id == doctor.id && a.file_id == file.id)
                .cloned()
                .collect();
            records.sort_by(|a, b| b.access_time.cmp(&a.access_time));

            Ok(DoctorIdentity {
                request_id: request.id.clone(),
                total_access: records.len(),
                last_access_time: records.first().map(|a| a.access_time),
                access_records: records,
                doctor: doctor.clone(),
            })
        })?;

        info!(
            "Patient {} revealed doctor {} on request {}",
            session.user_id, identity.doctor.id, request_id
        );
        Ok(identity)
    }

    /// Requests on the patient's files: pending first, then newest first
    pub fn get_patient_authorization_requests(
        &mut self,
        session: &Session,
        filters: &RequestFilters,
    ) -> MedshareResult<PaginatedResult<AuthorizationRequest>> {
        require_capability(session, Capability::ReviewAuthorization)?;
        let now = self.now();
        let collections = self.storage.collections();

        let owned: Vec<&str> = collections
            .files
            .iter()
            .filter(|f| f.patient_id == session.user_id)
            .map(|f| f.id.as_str())
            .collect();

        let mut requests: Vec<AuthorizationRequest> = collections
            .requests
            .iter()
            .filter(|r| owned.contains(&r.data_id.as_str()))
            .map(|r| with_effective_status(r, now))
            .filter(|r| filters.status.map_or(true, |s| r.status == s))
            .collect();
        requests.sort_by(|a, b| {
            let a_pending = a.status == RequestStatus::Pending;
            let b_pending = b.status == RequestStatus::Pending;
            b_pending.cmp(&a_pending).then_with(|| newest_first(a, b))
        });

        let (page, page_size) = self.config.page_of(&filters.pagination);
        Ok(PaginatedResult::paginate(requests, page, page_size))
    }

    /// The doctor's own requests, newest first
    pub fn get_doctor_authorization_requests(
        &mut self,
        session: &Session,
        filters: &RequestFilters,
    ) -> MedshareResult<PaginatedResult<AuthorizationRequest>> {
        require_capability(session, Capability::ListOwnRequests)?;
        let now = self.now();

        let mut requests: Vec<AuthorizationRequest> = self
            .storage
            .collections()
            .requests
            .iter()
            .filter(|r| r.doctor_id == session.user_id)
            .map(|r| with_effective_status(r, now))
            .filter(|r| filters.status.map_or(true, |s| r.status == s))
            .collect();
        requests.sort_by(newest_first);

        let (page, page_size) = self.config.page_of(&filters.pagination);
        Ok(PaginatedResult::paginate(requests, page, page_size))
    }
}

/// Copy of `request` showing lazy expiry
fn with_effective_status(
    request: &AuthorizationRequest,
    now: DateTime<Utc>,
) -> AuthorizationRequest {
    let mut view = request.clone();
    view.status = request.effective_status(now);
    view
}
