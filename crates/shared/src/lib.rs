//! medshare Shared Utilities
//!
//! Common functionality for the integrity and coordinator crates:
//! - Roles, sessions and the centralized capability check
//! - Pagination types
//! - Field validation
//! - PII masking
//! - Storage keys
//! - The shared error type

use serde::{Deserialize, Serialize};

pub mod error;

pub use access_control::*;
pub use error::{MedshareError, MedshareResult};
pub use privacy::*;
pub use storage_keys::*;
pub use types::*;
pub use validation::*;

/// Access control module - every operation consults this before touching data
pub mod access_control {
    use super::*;
    use std::fmt;

    /// Role types for role-based access control
    #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        Patient,
        Doctor,
    }

    impl fmt::Display for Role {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Role::Patient => write!(f, "patient"),
                Role::Doctor => write!(f, "doctor"),
            }
        }
    }

    impl Role {
        pub fn has_capability(&self, capability: Capability) -> bool {
            capability.granted_to().contains(self)
        }
    }

    /// Identity on whose behalf an operation runs.
    ///
    /// Passed explicitly to every backend operation instead of being read
    /// from ambient state.
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct Session {
        pub user_id: String,
        pub role: Role,
    }

    impl Session {
        pub fn new(user_id: impl Into<String>, role: Role) -> Self {
            Self {
                user_id: user_id.into(),
                role,
            }
        }

        pub fn patient(user_id: impl Into<String>) -> Self {
            Self::new(user_id, Role::Patient)
        }

        pub fn doctor(user_id: impl Into<String>) -> Self {
            Self::new(user_id, Role::Doctor)
        }

        pub fn is_patient(&self) -> bool {
            self.role == Role::Patient
        }

        pub fn is_doctor(&self) -> bool {
            self.role == Role::Doctor
        }
    }

    /// Actions guarded by the capability table
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum Capability {
        UploadFile,
        ManageOwnFiles,
        ListOwnFiles,
        ViewFileStatistics,
        SwitchDepartment,
        ReviewAuthorization,
        RevealDoctorIdentity,
        BrowseDepartmentFiles,
        RequestAuthorization,
        ViewMedicalData,
        RevealPatientIdentity,
        ListOwnRequests,
        ListAccessRecords,
    }

    impl Capability {
        /// Roles holding this capability
        pub fn granted_to(&self) -> &'static [Role] {
            match self {
                Capability::UploadFile
                | Capability::ManageOwnFiles
                | Capability::ListOwnFiles
                | Capability::ViewFileStatistics
                | Capability::SwitchDepartment
                | Capability::ReviewAuthorization
                | Capability::RevealDoctorIdentity => &[Role::Patient],
                Capability::BrowseDepartmentFiles
                | Capability::RequestAuthorization
                | Capability::ViewMedicalData
                | Capability::RevealPatientIdentity
                | Capability::ListOwnRequests => &[Role::Doctor],
                Capability::ListAccessRecords => &[Role::Patient, Role::Doctor],
            }
        }

        fn denial_message(&self) -> &'static str {
            match self {
                Capability::UploadFile => "only patients can upload medical data",
                Capability::ManageOwnFiles => "only patients can modify medical data",
                Capability::ListOwnFiles => "only patients can list their own medical data",
                Capability::ViewFileStatistics => "only patients can view file statistics",
                Capability::SwitchDepartment => "only patients can switch department",
                Capability::ReviewAuthorization => {
                    "only patients can review authorization requests"
                }
                Capability::RevealDoctorIdentity => "only patients can reveal a doctor's identity",
                Capability::BrowseDepartmentFiles => {
                    "only doctors can browse department medical data"
                }
                Capability::RequestAuthorization => "only doctors can request authorization",
                Capability::ViewMedicalData => "only doctors can view medical data",
                Capability::RevealPatientIdentity => "only doctors can reveal a patient's identity",
                Capability::ListOwnRequests => "only doctors can list their authorization requests",
                Capability::ListAccessRecords => "access records are not available for this role",
            }
        }
    }

    /// Fail with `Forbidden` unless the session's role holds `capability`.
    pub fn require_capability(session: &Session, capability: Capability) -> MedshareResult<()> {
        if session.role.has_capability(capability) {
            Ok(())
        } else {
            Err(MedshareError::forbidden(capability.denial_message()))
        }
    }

    /// Fail with `Forbidden` unless the session user owns the resource.
    pub fn require_owner(session: &Session, owner_id: &str, resource: &str) -> MedshareResult<()> {
        if session.user_id == owner_id {
            Ok(())
        } else {
            Err(MedshareError::forbidden(format!(
                "{} does not belong to the current user",
                resource
            )))
        }
    }
}

/// Common types used across crates
pub mod types {
    use super::*;

    /// Input for paginated queries (1-based pages)
    #[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct PaginationInput {
        pub page: Option<usize>,
        pub page_size: Option<usize>,
    }

    impl PaginationInput {
        pub const DEFAULT_PAGE_SIZE: usize = 20;
        pub const MAX_PAGE_SIZE: usize = 100;

        pub fn new(page: usize, page_size: usize) -> Self {
            Self {
                page: Some(page),
                page_size: Some(page_size),
            }
        }

        /// Resolve to a concrete `(page, page_size)`.
        ///
        /// A missing or zero page means page 1; a missing or zero size means
        /// `default_size`; sizes above `max_size` are clamped.
        pub fn resolve(&self, default_size: usize, max_size: usize) -> (usize, usize) {
            let page = self.page.filter(|p| *p > 0).unwrap_or(1);
            let size = self
                .page_size
                .filter(|s| *s > 0)
                .unwrap_or(default_size)
                .min(max_size.max(1));
            (page, size)
        }
    }

    /// Result wrapper for paginated queries
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    pub struct PaginatedResult<T> {
        pub items: Vec<T>,
        pub total: usize,
        pub page: usize,
        pub page_size: usize,
        pub total_pages: usize,
    }

    impl<T> PaginatedResult<T> {
        /// Slice one page out of an already filtered and sorted list.
        pub fn paginate(all: Vec<T>, page: usize, page_size: usize) -> Self {
            let page = page.max(1);
            let page_size = page_size.max(1);
            let total = all.len();
            let total_pages = total.div_ceil(page_size);
            let items = all
                .into_iter()
                .skip((page - 1) * page_size)
                .take(page_size)
                .collect();
            Self {
                items,
                total,
                page,
                page_size,
                total_pages,
            }
        }
    }
}

/// Input validation module
///
/// Provides validators for:
/// - Required fields
/// - Mainland China resident id card numbers
/// - Mobile phone numbers
/// - Upload sizes
pub mod validation {
    use super::*;
    use std::fmt;

    /// Validation error with detailed context
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub struct ValidationError {
        pub field: String,
        pub message: String,
        pub code: ValidationErrorCode,
    }

    /// Specific validation error codes for programmatic handling
    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    pub enum ValidationErrorCode {
        Required,
        InvalidFormat,
        OutOfRange,
        TooLong,
    }

    impl fmt::Display for ValidationError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}: {} ({:?})", self.field, self.message, self.code)
        }
    }

    /// Validation result that can accumulate multiple errors
    #[derive(Clone, Debug, Default)]
    pub struct ValidationResult {
        pub errors: Vec<ValidationError>,
    }

    impl ValidationResult {
        pub fn new() -> Self {
            Self { errors: Vec::new() }
        }

        pub fn add_error(&mut self, field: &str, message: &str, code: ValidationErrorCode) {
            self.errors.push(ValidationError {
                field: field.to_string(),
                message: message.to_string(),
                code,
            });
        }

        pub fn is_valid(&self) -> bool {
            self.errors.is_empty()
        }

        pub fn into_result(self) -> MedshareResult<()> {
            if self.is_valid() {
                Ok(())
            } else {
                let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
                Err(MedshareError::Validation(messages.join("; ")))
            }
        }

        pub fn merge(&mut self, other: ValidationResult) {
            self.errors.extend(other.errors);
        }
    }

    pub const MAX_TITLE_LEN: usize = 200;

    pub fn validate_required(value: &str, field_name: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        if value.trim().is_empty() {
            result.add_error(
                field_name,
                &format!("{} is required", field_name),
                ValidationErrorCode::Required,
            );
        }
        result
    }

    /// Validate a title-like free text field: required, at most `MAX_TITLE_LEN` chars
    pub fn validate_title(title: &str, field_name: &str) -> ValidationResult {
        let mut result = validate_required(title, field_name);
        if title.chars().count() > MAX_TITLE_LEN {
            result.add_error(
                field_name,
                &format!(
                    "{} must be at most {} characters",
                    field_name, MAX_TITLE_LEN
                ),
                ValidationErrorCode::TooLong,
            );
        }
        result
    }

    /// Validate an 18 character resident id card number
    ///
    /// Format: 17 digits followed by a digit or `X`.
    pub fn validate_id_card(id_card: &str) -> ValidationResult {
        let mut result = ValidationResult::new();

        if id_card.is_empty() {
            result.add_error(
                "idCard",
                "ID card number is required",
                ValidationErrorCode::Required,
            );
            return result;
        }

        let chars: Vec<char> = id_card.chars().collect();
        let well_formed = chars.len() == 18
            && chars[..17].iter().all(|c| c.is_ascii_digit())
            && (chars[17].is_ascii_digit() || chars[17] == 'X' || chars[17] == 'x');

        if !well_formed {
            result.add_error(
                "idCard",
                "ID card number must be 17 digits followed by a digit or X",
                ValidationErrorCode::InvalidFormat,
            );
        }

        result
    }

    /// Validate an 11 digit mobile number starting with 1
    pub fn validate_phone(phone: &str) -> ValidationResult {
        let mut result = ValidationResult::new();

        if phone.is_empty() {
            result.add_error(
                "phone",
                "Phone number is required",
                ValidationErrorCode::Required,
            );
            return result;
        }

        if phone.len() != 11
            || !phone.starts_with('1')
            || !phone.chars().all(|c| c.is_ascii_digit())
        {
            result.add_error(
                "phone",
                "Phone number must be 11 digits starting with 1",
                ValidationErrorCode::InvalidFormat,
            );
        }

        result
    }

    pub fn validate_file_size(size: u64, max_size: u64) -> ValidationResult {
        let mut result = ValidationResult::new();
        if size == 0 {
            result.add_error(
                "fileSize",
                "File must not be empty",
                ValidationErrorCode::OutOfRange,
            );
        } else if size > max_size {
            result.add_error(
                "fileSize",
                &format!("File exceeds the maximum size of {} bytes", max_size),
                ValidationErrorCode::OutOfRange,
            );
        }
        result
    }
}

/// PII masking for display
pub mod privacy {
    /// `张三` -> `***`; never reveals a single character.
    pub fn mask_name(name: &str) -> String {
        "*".repeat(name.chars().count().max(3))
    }

    /// Keep `start_len` leading and `end_len` trailing characters.
    pub fn mask_text(text: &str, start_len: usize, end_len: usize) -> String {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= start_len + end_len {
            return "*".repeat(chars.len().max(3));
        }
        let start: String = chars[..start_len].iter().collect();
        let end: String = chars[chars.len() - end_len..].iter().collect();
        format!(
            "{}{}{}",
            start,
            "*".repeat(chars.len() - start_len - end_len),
            end
        )
    }
}

/// Fixed keys of the key/value store
pub mod storage_keys {
    pub const USER_DATABASE: &str = "mock_user_database";
    pub const MEDICAL_FILES: &str = "mock_medical_files";
    pub const AUTHORIZATION_REQUESTS: &str = "mock_authorization_requests";
    pub const ACCESS_RECORDS: &str = "mock_access_records";

    pub const ALL_KEYS: [&str; 4] = [
        USER_DATABASE,
        MEDICAL_FILES,
        AUTHORIZATION_REQUESTS,
        ACCESS_RECORDS,
    ];
}
