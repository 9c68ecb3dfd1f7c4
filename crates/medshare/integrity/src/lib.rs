//! medshare Integrity Crate
//!
//! Defines the stored record types (users, medical files, authorization
//! requests, access records), the authorization state machine and the
//! validation every record must pass before it is written.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use derive_more::Display;
use medshare_shared::{
    validate_file_size, validate_id_card, validate_phone, validate_required, validate_title,
    MedshareError, MedshareResult, Role, ValidationErrorCode, ValidationResult,
};
use serde::{Deserialize, Serialize};

/// Version written into every stored collection envelope
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================
// USERS
// ============================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[display(fmt = "male")]
    Male,
    #[display(fmt = "female")]
    Female,
}

/// Department a patient is registered with
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentMembership {
    pub id: String,
    pub department: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientProfile {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub id_card: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    /// Department stamped onto new uploads
    pub current_department: String,
    pub departments: Vec<DepartmentMembership>,
    pub created_at: DateTime<Utc>,
}

impl PatientProfile {
    pub fn is_registered_in(&self, department: &str) -> bool {
        self.departments.iter().any(|d| d.department == department)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorProfile {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub id_card: String,
    /// Fixed department; bounds which files the doctor can see
    pub department: String,
    pub hospital: String,
    pub created_at: DateTime<Utc>,
}

/// A user of either role
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum UserProfile {
    Patient(PatientProfile),
    Doctor(DoctorProfile),
}

impl UserProfile {
    pub fn id(&self) -> &str {
        match self {
            UserProfile::Patient(p) => &p.id,
            UserProfile::Doctor(d) => &d.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            UserProfile::Patient(p) => &p.name,
            UserProfile::Doctor(d) => &d.name,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            UserProfile::Patient(_) => Role::Patient,
            UserProfile::Doctor(_) => Role::Doctor,
        }
    }

    /// Current department for patients, fixed department for doctors
    pub fn department(&self) -> &str {
        match self {
            UserProfile::Patient(p) => &p.current_department,
            UserProfile::Doctor(d) => &d.department,
        }
    }
}

/// Registry of all users plus the "current user" pointer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserDatabase {
    #[serde(default = "schema_version")]
    pub version: u32,
    pub patients: Vec<PatientProfile>,
    pub doctors: Vec<DoctorProfile>,
    pub departments: Vec<String>,
    #[serde(default)]
    pub current_user_id: Option<String>,
    #[serde(default)]
    pub current_user_role: Option<Role>,
}

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

impl UserDatabase {
    pub fn find_patient(&self, id: &str) -> Option<&PatientProfile> {
        self.patients.iter().find(|p| p.id == id)
    }

    pub fn find_doctor(&self, id: &str) -> Option<&DoctorProfile> {
        self.doctors.iter().find(|d| d.id == id)
    }

    pub fn find_user(&self, id: &str, role: Role) -> Option<UserProfile> {
        match role {
            Role::Patient => self.find_patient(id).cloned().map(UserProfile::Patient),
            Role::Doctor => self.find_doctor(id).cloned().map(UserProfile::Doctor),
        }
    }
}

/// Age in whole years from the birth date embedded in an 18 digit id card.
pub fn age_from_id_card(id_card: &str, today: NaiveDate) -> Option<u32> {
    if id_card.len() != 18 || !id_card.is_ascii() {
        return None;
    }
    let year: i32 = id_card[6..10].parse().ok()?;
    let month: u32 = id_card[10..12].parse().ok()?;
    let day: u32 = id_card[12..14].parse().ok()?;
    let birth = NaiveDate::from_ymd_opt(year, month, day)?;
    if birth > today {
        return None;
    }

    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    u32::try_from(age).ok()
}

// ============================================================
// MEDICAL FILES
// ============================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    /// Lab / examination report
    #[display(fmt = "report")]
    Report,
    /// Medical imaging
    #[display(fmt = "image")]
    Image,
    #[display(fmt = "prescription")]
    Prescription,
    #[display(fmt = "other")]
    Other,
}

impl FileCategory {
    pub const ALL: [FileCategory; 4] = [
        FileCategory::Report,
        FileCategory::Image,
        FileCategory::Prescription,
        FileCategory::Other,
    ];
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[display(fmt = "uploading")]
    Uploading,
    #[display(fmt = "processing")]
    Processing,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "failed")]
    Failed,
}

impl FileStatus {
    /// Only fully stored files are offered to doctors
    pub fn is_shareable(&self) -> bool {
        matches!(self, FileStatus::Completed)
    }
}

/// Authorization state of a file as seen through its latest request
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizationStatus {
    #[display(fmt = "not-requested")]
    NotRequested,
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "approved")]
    Approved,
    #[display(fmt = "rejected")]
    Rejected,
    #[display(fmt = "expired")]
    Expired,
}

impl AuthorizationStatus {
    /// Legal moves for a single (file, doctor) pair.
    ///
    /// `rejected` and `expired` return to `pending` only through a new request.
    pub fn can_transition_to(&self, next: AuthorizationStatus) -> bool {
        use AuthorizationStatus::*;
        matches!(
            (self, next),
            (NotRequested, Pending)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Expired)
                | (Approved, Pending)
                | (Rejected, Pending)
                | (Expired, Pending)
        )
    }
}

/// Snapshot of the uploader's identity, captured at upload time
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientSnapshot {
    pub name: String,
    pub id_card: String,
    pub phone: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age: Option<u32>,
}

impl From<&PatientProfile> for PatientSnapshot {
    fn from(patient: &PatientProfile) -> Self {
        Self {
            name: patient.name.clone(),
            id_card: patient.id_card.clone(),
            phone: patient.phone.clone(),
            gender: patient.gender,
            age: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MedicalFile {
    pub id: String,
    pub patient_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: FileCategory,
    /// Stored file name; with `file_size` it identifies duplicate uploads
    pub file_name: String,
    pub original_name: String,
    /// Extension without the dot
    #[serde(default)]
    pub file_type: String,
    pub file_size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub status: FileStatus,
    pub upload_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auth_status: AuthorizationStatus,
    #[serde(default)]
    pub authorization_count: u32,
    #[serde(default)]
    pub view_count: u32,
    #[serde(default)]
    pub download_count: u32,
    /// Uploader's department at upload time; `None` is visible to every doctor
    #[serde(default)]
    pub department_name: Option<String>,
    /// Lowercase hex sha256 of the uploaded content
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub patient: PatientSnapshot,
    /// Object URL the caller must release when the file is deleted
    #[serde(default)]
    pub blob_url: Option<String>,
}

/// Denormalized file reference carried by requests and access records
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub title: String,
    pub file_name: String,
    pub file_type: String,
    pub category: FileCategory,
}

impl From<&MedicalFile> for FileSummary {
    fn from(file: &MedicalFile) -> Self {
        Self {
            id: file.id.clone(),
            title: file.title.clone(),
            file_name: file.file_name.clone(),
            file_type: file.file_type.clone(),
            category: file.category,
        }
    }
}

// ============================================================
// AUTHORIZATION REQUESTS
// ============================================================

/// Lifecycle of one stored request record
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "approved")]
    Approved,
    #[display(fmt = "rejected")]
    Rejected,
    #[display(fmt = "expired")]
    Expired,
}

impl RequestStatus {
    /// Requests are created `pending`; only these moves exist afterwards.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Expired)
        )
    }
}

impl From<RequestStatus> for AuthorizationStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending => AuthorizationStatus::Pending,
            RequestStatus::Approved => AuthorizationStatus::Approved,
            RequestStatus::Rejected => AuthorizationStatus::Rejected,
            RequestStatus::Expired => AuthorizationStatus::Expired,
        }
    }
}

/// Doctor's ask to view one patient file
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    pub id: String,
    pub data_id: String,
    pub data_name: String,
    pub data_type: FileCategory,
    pub patient_id: String,
    pub doctor_id: String,
    pub doctor_name: String,
    pub doctor_department: String,
    pub doctor_hospital: String,
    #[serde(default)]
    pub reason: String,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// `None` on an approved request means it never lapses
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Doctor identity revealed to the patient
    #[serde(default)]
    pub is_identity_revealed: bool,
    /// Patient identity revealed to the doctor
    #[serde(default)]
    pub is_patient_identity_revealed: bool,
    /// Store-wide counter stamped on every transition; highest is latest
    #[serde(default)]
    pub revision: u64,
}

impl AuthorizationRequest {
    /// Approved with an `expires_at` strictly before `now`
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Approved && self.expires_at.is_some_and(|exp| exp < now)
    }

    /// Status with lazy expiry applied, without mutating the record
    pub fn effective_status(&self, now: DateTime<Utc>) -> RequestStatus {
        if self.is_lapsed(now) {
            RequestStatus::Expired
        } else {
            self.status
        }
    }

    /// Approved and not lapsed
    pub fn grants_access(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == RequestStatus::Approved
    }

    /// Move to `next`, stamping `revision`; illegal moves are `InvalidState`.
    pub fn transition(&mut self, next: RequestStatus, revision: u64) -> MedshareResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(MedshareError::InvalidState(format!(
                "authorization request {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.revision = revision;
        Ok(())
    }
}

/// Latest request (highest revision) for a file, across all doctors
pub fn latest_request_for_file<'a>(
    file_id: &str,
    requests: &'a [AuthorizationRequest],
) -> Option<&'a AuthorizationRequest> {
    requests
        .iter()
        .filter(|r| r.data_id == file_id)
        .max_by_key(|r| r.revision)
}

/// Latest request a given doctor made for a file
pub fn latest_request_for_pair<'a>(
    file_id: &str,
    doctor_id: &str,
    requests: &'a [AuthorizationRequest],
) -> Option<&'a AuthorizationRequest> {
    requests
        .iter()
        .filter(|r| r.data_id == file_id && r.doctor_id == doctor_id)
        .max_by_key(|r| r.revision)
}

/// The `auth_status` a file must carry given the stored requests
pub fn derive_auth_status(file_id: &str, requests: &[AuthorizationRequest]) -> AuthorizationStatus {
    latest_request_for_file(file_id, requests)
        .map(|r| r.status.into())
        .unwrap_or(AuthorizationStatus::NotRequested)
}

// ============================================================
// ACCESS RECORDS
// ============================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    #[display(fmt = "view")]
    View,
    #[display(fmt = "download")]
    Download,
    /// Identity reveal trace
    #[display(fmt = "preview")]
    Preview,
}

/// Denormalized doctor reference carried by access records
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoctorSummary {
    pub id: String,
    pub name: String,
    pub hospital: String,
    pub department: String,
}

impl From<&DoctorProfile> for DoctorSummary {
    fn from(doctor: &DoctorProfile) -> Self {
        Self {
            id: doctor.id.clone(),
            name: doctor.name.clone(),
            hospital: doctor.hospital.clone(),
            department: doctor.department.clone(),
        }
    }
}

/// Append-only audit entry of a doctor touching a patient file
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRecord {
    pub id: String,
    pub file_id: String,
    pub doctor_id: String,
    pub patient_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub access_type: AccessType,
    pub access_time: DateTime<Utc>,
    /// Seconds
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub doctor: DoctorSummary,
    pub file: FileSummary,
}

// ============================================================
// VALIDATION
// ============================================================

/// Verdict of validating one record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidateCallbackResult {
    Valid,
    Invalid(String),
}

impl ValidateCallbackResult {
    pub fn into_result(self) -> MedshareResult<()> {
        match self {
            ValidateCallbackResult::Valid => Ok(()),
            ValidateCallbackResult::Invalid(reason) => Err(MedshareError::Validation(reason)),
        }
    }

    fn from_validation(result: ValidationResult) -> Self {
        match result.into_result() {
            Ok(()) => ValidateCallbackResult::Valid,
            Err(MedshareError::Validation(reason)) => ValidateCallbackResult::Invalid(reason),
            Err(other) => ValidateCallbackResult::Invalid(other.to_string()),
        }
    }
}

/// Every record kind written to the store
#[derive(Clone, Copy, Debug)]
pub enum EntryTypes<'a> {
    User(&'a UserProfile),
    MedicalFile(&'a MedicalFile),
    AuthorizationRequest(&'a AuthorizationRequest),
    AccessRecord(&'a AccessRecord),
}

pub fn validate(entry: EntryTypes<'_>) -> ValidateCallbackResult {
    match entry {
        EntryTypes::User(u) => validate_user(u),
        EntryTypes::MedicalFile(f) => validate_medical_file(f),
        EntryTypes::AuthorizationRequest(r) => validate_authorization_request(r),
        EntryTypes::AccessRecord(a) => validate_access_record(a),
    }
}

fn validate_user(user: &UserProfile) -> ValidateCallbackResult {
    let (id, name, phone, id_card) = match user {
        UserProfile::Patient(p) => (&p.id, &p.name, &p.phone, &p.id_card),
        UserProfile::Doctor(d) => (&d.id, &d.name, &d.phone, &d.id_card),
    };

    let mut result = validate_required(id, "id");
    result.merge(validate_required(name, "name"));
    result.merge(validate_phone(phone));
    result.merge(validate_id_card(id_card));

    match user {
        UserProfile::Patient(p) => {
            if !p.is_registered_in(&p.current_department) {
                result.add_error(
                    "currentDepartment",
                    "Current department must be one the patient is registered with",
                    ValidationErrorCode::InvalidFormat,
                );
            }
        }
        UserProfile::Doctor(d) => {
            result.merge(validate_required(&d.department, "department"));
            result.merge(validate_required(&d.hospital, "hospital"));
        }
    }

    ValidateCallbackResult::from_validation(result)
}

fn validate_medical_file(file: &MedicalFile) -> ValidateCallbackResult {
    let mut result = validate_required(&file.id, "id");
    result.merge(validate_required(&file.patient_id, "patientId"));
    result.merge(validate_title(&file.title, "title"));
    result.merge(validate_required(&file.file_name, "fileName"));
    result.merge(validate_file_size(file.file_size, u64::MAX));

    if let Some(checksum) = &file.checksum {
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            result.add_error(
                "checksum",
                "Checksum must be a 64 character sha256 hex digest",
                ValidationErrorCode::InvalidFormat,
            );
        }
    }
    if file.auth_status != AuthorizationStatus::NotRequested && file.authorization_count == 0 {
        result.add_error(
            "authStatus",
            "A file with no authorization requests must be not-requested",
            ValidationErrorCode::InvalidFormat,
        );
    }

    ValidateCallbackResult::from_validation(result)
}

fn validate_authorization_request(request: &AuthorizationRequest) -> ValidateCallbackResult {
    let mut result = validate_required(&request.id, "id");
    result.merge(validate_required(&request.data_id, "dataId"));
    result.merge(validate_required(&request.doctor_id, "doctorId"));
    result.merge(validate_required(&request.patient_id, "patientId"));
    if !result.is_valid() {
        return ValidateCallbackResult::from_validation(result);
    }

    match request.status {
        RequestStatus::Pending => {
            if request.processed_at.is_some() || request.expires_at.is_some() {
                return ValidateCallbackResult::Invalid(
                    "Pending requests cannot carry processing or expiry timestamps".to_string(),
                );
            }
        }
        RequestStatus::Approved | RequestStatus::Rejected => {
            if request.processed_at.is_none() {
                return ValidateCallbackResult::Invalid(
                    "Processed requests must record when they were processed".to_string(),
                );
            }
        }
        RequestStatus::Expired => {
            if request.expires_at.is_none() {
                return ValidateCallbackResult::Invalid(
                    "Expired requests must carry an expiry timestamp".to_string(),
                );
            }
        }
    }

    if let (Some(processed), Some(expires)) = (request.processed_at, request.expires_at) {
        if expires < processed {
            return ValidateCallbackResult::Invalid("Expiry must not precede approval".to_string());
        }
    }
    if request.status == RequestStatus::Rejected && request.reject_reason.is_none() {
        return ValidateCallbackResult::Invalid(
            "Rejected requests must record a reason".to_string(),
        );
    }

    let was_approved = matches!(
        request.status,
        RequestStatus::Approved | RequestStatus::Expired
    );
    if (request.is_identity_revealed || request.is_patient_identity_revealed) && !was_approved {
        return ValidateCallbackResult::Invalid(
            "Identities can only be revealed on approved requests".to_string(),
        );
    }

    ValidateCallbackResult::Valid
}

fn validate_access_record(record: &AccessRecord) -> ValidateCallbackResult {
    let mut result = validate_required(&record.id, "id");
    result.merge(validate_required(&record.file_id, "fileId"));
    result.merge(validate_required(&record.doctor_id, "doctorId"));
    result.merge(validate_required(&record.patient_id, "patientId"));

    if record.doctor.id != record.doctor_id {
        result.add_error(
            "doctor",
            "Doctor summary must match doctorId",
            ValidationErrorCode::InvalidFormat,
        );
    }
    if record.file.id != record.file_id {
        result.add_error(
            "file",
            "File summary must match fileId",
            ValidationErrorCode::InvalidFormat,
        );
    }

    ValidateCallbackResult::from_validation(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
    }

    fn create_test_patient() -> PatientProfile {
        PatientProfile {
            id: "patient_cardio_001".to_string(),
            name: "张三".to_string(),
            phone: "13800138001".to_string(),
            id_card: "330101199001011234".to_string(),
            gender: Some(Gender::Male),
            current_department: "心血管科".to_string(),
            departments: vec![DepartmentMembership {
                id: "dept_cardio_001".to_string(),
                department: "心血管科".to_string(),
            }],
            created_at: now(),
        }
    }

    fn create_test_file() -> MedicalFile {
        MedicalFile {
            id: "file_1".to_string(),
            patient_id: "patient_cardio_001".to_string(),
            title: "Blood panel".to_string(),
            description: "Annual checkup".to_string(),
            category: FileCategory::Report,
            file_name: "blood.pdf".to_string(),
            original_name: "blood.pdf".to_string(),
            file_type: "pdf".to_string(),
            file_size: 2048,
            mime_type: "application/pdf".to_string(),
            status: FileStatus::Completed,
            upload_time: now(),
            updated_at: now(),
            auth_status: AuthorizationStatus::NotRequested,
            authorization_count: 0,
            view_count: 0,
            download_count: 0,
            department_name: Some("心血管科".to_string()),
            checksum: None,
            is_verified: true,
            verified_at: Some(now()),
            patient: PatientSnapshot::from(&create_test_patient()),
            blob_url: None,
        }
    }

    fn create_test_request(revision: u64) -> AuthorizationRequest {
        AuthorizationRequest {
            id: format!("auth_req_{}", revision),
            data_id: "file_1".to_string(),
            data_name: "Blood panel".to_string(),
            data_type: FileCategory::Report,
            patient_id: "patient_cardio_001".to_string(),
            doctor_id: "doctor_cardio_001".to_string(),
            doctor_name: "刘医生".to_string(),
            doctor_department: "心血管科".to_string(),
            doctor_hospital: "浙江大学医学院附属第一医院".to_string(),
            reason: "Follow-up".to_string(),
            status: RequestStatus::Pending,
            requested_at: now(),
            processed_at: None,
            expires_at: None,
            reject_reason: None,
            notes: None,
            is_identity_revealed: false,
            is_patient_identity_revealed: false,
            revision,
        }
    }

    fn is_valid(entry: EntryTypes<'_>) -> bool {
        validate(entry) == ValidateCallbackResult::Valid
    }

    #[test]
    fn test_file_status_wire_names() {
        let json = r#"["uploading", "processing", "completed", "failed"]"#;
        let statuses: Vec<FileStatus> = serde_json::from_str(json).unwrap();
        assert_eq!(
            statuses,
            vec![
                FileStatus::Uploading,
                FileStatus::Processing,
                FileStatus::Completed,
                FileStatus::Failed,
            ]
        );
        let shareable: Vec<bool> = statuses.iter().map(FileStatus::is_shareable).collect();
        assert_eq!(shareable, vec![false, false, true, false]);
        assert_eq!(FileStatus::Processing.to_string(), "processing");
    }

    // ========== STATE MACHINE TESTS ==========

    #[test]
    fn test_pair_transitions() {
        use AuthorizationStatus::*;
        assert!(NotRequested.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Expired));
        assert!(Rejected.can_transition_to(Pending));
        assert!(Expired.can_transition_to(Pending));
        assert!(Approved.can_transition_to(Pending));

        assert!(!NotRequested.can_transition_to(Approved));
        assert!(!NotRequested.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Expired.can_transition_to(Approved));
    }

    #[test]
    fn test_request_transition_rejects_processed() {
        let mut request = create_test_request(1);
        request.transition(RequestStatus::Approved, 2).unwrap();
        assert_eq!(request.revision, 2);

        let err = request.transition(RequestStatus::Rejected, 3).unwrap_err();
        assert_eq!(err.code(), 409);
        assert_eq!(request.status, RequestStatus::Approved);
        assert_eq!(request.revision, 2);
    }

    #[test]
    fn test_lazy_expiry() {
        let mut request = create_test_request(1);
        request.status = RequestStatus::Approved;
        request.processed_at = Some(now());
        request.expires_at = Some(now() + Duration::days(7));

        assert!(request.grants_access(now() + Duration::days(6)));
        assert!(!request.is_lapsed(now() + Duration::days(7)));
        assert!(request.is_lapsed(now() + Duration::days(8)));
        assert_eq!(
            request.effective_status(now() + Duration::days(8)),
            RequestStatus::Expired
        );

        request.expires_at = None;
        assert!(request.grants_access(now() + Duration::days(3650)));
    }

    #[test]
    fn test_derive_auth_status_uses_latest_revision() {
        assert_eq!(
            derive_auth_status("file_1", &[]),
            AuthorizationStatus::NotRequested
        );

        let mut older = create_test_request(1);
        older.status = RequestStatus::Rejected;
        let mut newer = create_test_request(5);
        newer.doctor_id = "doctor_cardio_002".to_string();
        let requests = vec![newer, older];

        assert_eq!(
            derive_auth_status("file_1", &requests),
            AuthorizationStatus::Pending
        );
        assert_eq!(
            latest_request_for_pair("file_1", "doctor_cardio_001", &requests).map(|r| r.status),
            Some(RequestStatus::Rejected)
        );
        let unknown = latest_request_for_pair("file_2", "doctor_cardio_001", &requests);
        assert!(unknown.is_none());
    }

    // ========== SERIALIZATION TESTS ==========

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&AuthorizationStatus::NotRequested).unwrap(),
            "\"not-requested\""
        );
        assert_eq!(
            AuthorizationStatus::NotRequested.to_string(),
            "not-requested"
        );
        assert_eq!(FileCategory::Prescription.to_string(), "prescription");

        let status: RequestStatus = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(status, RequestStatus::Approved);
    }

    #[test]
    fn test_file_uses_camel_case_fields() {
        let json = serde_json::to_value(create_test_file()).unwrap();
        assert_eq!(json["patientId"], "patient_cardio_001");
        assert_eq!(json["authStatus"], "not-requested");
        assert_eq!(json["departmentName"], "心血管科");
    }

    #[test]
    fn test_user_profile_is_tagged_by_role() {
        let user = UserProfile::Patient(create_test_patient());
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["role"], "patient");
        assert_eq!(json["currentDepartment"], "心血管科");

        let back: UserProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back.role(), Role::Patient);
        assert_eq!(back.department(), "心血管科");
    }

    // ========== VALIDATION TESTS ==========

    #[test]
    fn test_valid_entries() {
        assert!(is_valid(EntryTypes::MedicalFile(&create_test_file())));
        let request = create_test_request(1);
        assert!(is_valid(EntryTypes::AuthorizationRequest(&request)));
        let user = UserProfile::Patient(create_test_patient());
        assert!(is_valid(EntryTypes::User(&user)));
    }

    #[test]
    fn test_file_requires_title() {
        let mut file = create_test_file();
        file.title = "   ".to_string();
        assert!(!is_valid(EntryTypes::MedicalFile(&file)));
    }

    #[test]
    fn test_file_status_needs_a_request() {
        let mut file = create_test_file();
        file.auth_status = AuthorizationStatus::Approved;
        assert!(!is_valid(EntryTypes::MedicalFile(&file)));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut file = create_test_file();
        file.checksum = Some("abc".to_string());
        assert!(!is_valid(EntryTypes::MedicalFile(&file)));
    }

    #[test]
    fn test_request_timestamps_follow_status() {
        let mut request = create_test_request(1);
        request.processed_at = Some(now());
        assert!(!is_valid(EntryTypes::AuthorizationRequest(&request)));

        let mut rejected = create_test_request(1);
        rejected.status = RequestStatus::Rejected;
        rejected.processed_at = Some(now());
        assert!(!is_valid(EntryTypes::AuthorizationRequest(&rejected)));
        rejected.reject_reason = Some("Not needed".to_string());
        assert!(is_valid(EntryTypes::AuthorizationRequest(&rejected)));
    }

    #[test]
    fn test_reveal_requires_approval() {
        let mut request = create_test_request(1);
        request.is_patient_identity_revealed = true;
        assert!(!is_valid(EntryTypes::AuthorizationRequest(&request)));
    }

    #[test]
    fn test_patient_department_must_be_registered() {
        let mut patient = create_test_patient();
        patient.current_department = "儿科".to_string();
        assert!(!is_valid(EntryTypes::User(&UserProfile::Patient(patient))));
    }

    // ========== AGE TESTS ==========

    #[test]
    fn test_age_from_id_card() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(age_from_id_card("330101199001011234", today), Some(34));
        assert_eq!(age_from_id_card("330101199007011234", today), Some(33));
        assert_eq!(age_from_id_card("33010119900101", today), None);
        assert_eq!(age_from_id_card("330101199013011234", today), None);
    }

    // ========== PROPERTY TESTS ==========

    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = AuthorizationStatus> {
        prop_oneof![
            Just(AuthorizationStatus::NotRequested),
            Just(AuthorizationStatus::Pending),
            Just(AuthorizationStatus::Approved),
            Just(AuthorizationStatus::Rejected),
            Just(AuthorizationStatus::Expired),
        ]
    }

    proptest! {
        #[test]
        fn prop_decisions_always_follow_pending(
            steps in prop::collection::vec(any_status(), 0..40),
        ) {
            let mut current = AuthorizationStatus::NotRequested;
            for next in steps {
                if current.can_transition_to(next) {
                    let decision = matches!(
                        next,
                        AuthorizationStatus::Approved | AuthorizationStatus::Rejected
                    );
                    if decision {
                        prop_assert_eq!(current, AuthorizationStatus::Pending);
                    }
                    current = next;
                }
                prop_assert!(!current.can_transition_to(AuthorizationStatus::NotRequested));
            }
        }

        #[test]
        fn prop_request_moves_agree_with_pair_table(
            from in prop_oneof![
                Just(RequestStatus::Pending),
                Just(RequestStatus::Approved),
                Just(RequestStatus::Rejected),
                Just(RequestStatus::Expired),
            ],
            to in prop_oneof![
                Just(RequestStatus::Pending),
                Just(RequestStatus::Approved),
                Just(RequestStatus::Rejected),
                Just(RequestStatus::Expired),
            ],
        ) {
            if from.can_transition_to(to) {
                prop_assert!(AuthorizationStatus::from(from).can_transition_to(to.into()));
            }
        }
    }
}
