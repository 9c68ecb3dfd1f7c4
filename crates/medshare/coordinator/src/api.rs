//! HTTP-shaped facade.
//!
//! Matches `(method, url)` against the route table and wraps each result in
//! a `{success, message, data, code}` envelope. Routes that act for a user
//! resolve the session from the stored current-user pointer.

use std::fmt;
use std::time::Duration;

use log::debug;
use medshare_shared::{MedshareError, MedshareResult, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::access::AccessRecordFilters;
use crate::authorization::{ApproveAuthorizationInput, RejectAuthorizationInput, RequestFilters};
use crate::config::MockConfig;
use crate::files::{
    DoctorFileFilters, PatientFileFilters, UpdateMedicalFileInput, UploadMedicalFileInput,
};
use crate::store::{KeyValueStore, MemoryStore};
use crate::MedshareBackend;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path with optional base prefix and query string
    pub url: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: None,
            data: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub code: u16,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: (!data.is_null()).then_some(data),
            code: 200,
        }
    }

    pub fn error(err: &MedshareError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            code: err.code(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchUserBody {
    user_id: String,
    role: Role,
}

#[derive(Deserialize)]
struct DepartmentBody {
    department: String,
}

#[derive(Default, Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveBody {
    #[serde(default)]
    expires_in: u32,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevealDoctorBody {
    request_id: String,
}

/// Deserialize a request body or query, reporting bad input as a
/// validation failure.
fn parse<T: DeserializeOwned>(value: Value) -> MedshareResult<T> {
    serde_json::from_value(value).map_err(|e| MedshareError::Validation(e.to_string()))
}

fn to_data<T: Serialize>(value: T) -> MedshareResult<Value> {
    Ok(serde_json::to_value(value)?)
}

const NUMERIC_QUERY_KEYS: [&str; 2] = ["page", "pageSize"];

/// Split a query string into params; pagination keys become numbers
fn parse_query(query: &str) -> Map<String, Value> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = match raw.parse::<u64>() {
                Ok(n) if NUMERIC_QUERY_KEYS.contains(&key) => Value::from(n),
                _ => Value::from(raw),
            };
            (key.to_string(), value)
        })
        .collect()
}

/// In-process router over a [`MedshareBackend`]
pub struct MockApi<S: KeyValueStore = MemoryStore> {
    backend: MedshareBackend<S>,
}

impl MockApi<MemoryStore> {
    pub fn new(config: MockConfig) -> Self {
        Self::with_backend(MedshareBackend::new(config))
    }
}

impl<S: KeyValueStore> MockApi<S> {
    pub fn with_backend(backend: MedshareBackend<S>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &MedshareBackend<S> {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut MedshareBackend<S> {
        &mut self.backend
    }

    pub fn into_backend(self) -> MedshareBackend<S> {
        self.backend
    }

    pub fn handle(&mut self, request: ApiRequest) -> ApiResponse {
        let config = self.backend.config().clone();
        if !config.use_mock_data {
            return ApiResponse {
                success: false,
                message: "Mock backend is disabled".to_string(),
                data: None,
                code: 503,
            };
        }
        if config.mock_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(config.mock_delay_ms));
        }

        let (path, query) = match request.url.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (request.url.as_str(), Map::new()),
        };
        let base = config.api_base_path.trim_end_matches('/');
        let path = match path.strip_prefix(base) {
            Some(rest) if !base.is_empty() && (rest.is_empty() || rest.starts_with('/')) => rest,
            _ => path,
        };

        let mut params = query;
        if let Some(Value::Object(explicit)) = request.params {
            params.extend(explicit);
        }
        let data = request.data.unwrap_or(Value::Null);

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let response = match self.route(request.method, &segments, Value::Object(params), data) {
            Ok((message, data)) => ApiResponse::ok(message, data),
            Err(e) => ApiResponse::error(&e),
        };

        if config.enable_mock_log {
            debug!(
                "[MOCK] {} {} -> {} {}",
                request.method, path, response.code, response.message
            );
        }
        response
    }

    fn route(
        &mut self,
        method: HttpMethod,
        segments: &[&str],
        params: Value,
        data: Value,
    ) -> MedshareResult<(&'static str, Value)> {
        use HttpMethod::*;

        let backend = &mut self.backend;
        match (method, segments) {
            (Get, ["auth", "users"]) => {
                Ok(("User list loaded", to_data(backend.get_all_users()?)?))
            }
            (Post, ["auth", "switch-user"]) => {
                let body: SwitchUserBody = parse(data)?;
                let session = backend.switch_user(&body.user_id, body.role)?;
                let user = backend.current_user()?;
                Ok((
                    "User switched",
                    serde_json::json!({ "session": session, "user": user }),
                ))
            }
            (Post, ["system", "reset"]) => {
                backend.reset_all_data()?;
                Ok(("All data reset", Value::Null))
            }
            _ => {
                // Unknown routes answer 404 even when logged out
                let session = backend.current_session();
                match (method, segments) {
                    (Post, ["patient", "department"]) => {
                        let session = session?;
                        let body: DepartmentBody = parse(data)?;
                        let patient = backend.switch_department(&session, &body.department)?;
                        Ok(("Department switched", to_data(patient)?))
                    }
                    (Post, ["medical-data", "files", "upload"]) => {
                        let session = session?;
                        let input: UploadMedicalFileInput = parse(data)?;
                        let file = backend.upload_medical_file(&session, input)?;
                        Ok(("Upload succeeded", to_data(file)?))
                    }
                    (Get, ["medical-data", "files"]) => {
                        let session = session?;
                        let filters: PatientFileFilters = parse(params)?;
                        let page = backend.get_patient_medical_files(&session, &filters)?;
                        Ok(("Query succeeded", to_data(page)?))
                    }
                    (Put, ["medical-data", "files", id]) => {
                        let session = session?;
                        let changes: UpdateMedicalFileInput = parse(data)?;
                        let file = backend.update_medical_file(&session, id, changes)?;
                        Ok(("Update succeeded", to_data(file)?))
                    }
                    (Delete, ["medical-data", "files", id]) => {
                        let session = session?;
                        let deleted = backend.delete_medical_file(&session, id)?;
                        Ok(("Delete succeeded", to_data(deleted)?))
                    }
                    (Get, ["medical-data", "statistics"]) => {
                        let session = session?;
                        Ok((
                            "Query succeeded",
                            to_data(backend.get_file_statistics(&session)?)?,
                        ))
                    }
                    (Get, ["doctor", "medical-data"]) => {
                        let session = session?;
                        let filters: DoctorFileFilters = parse(params)?;
                        let page = backend.get_doctor_medical_data_list(&session, &filters)?;
                        Ok(("Query succeeded", to_data(page)?))
                    }
                    (Post, ["doctor", "medical-data", id, "request-authorization"]) => {
                        let session = session?;
                        let body: ReasonBody = if data.is_null() {
                            ReasonBody::default()
                        } else {
                            parse(data)?
                        };
                        let reason = body.reason.unwrap_or_default();
                        let request = backend.request_authorization(&session, id, &reason)?;
                        Ok(("Authorization requested", to_data(request)?))
                    }
                    (Post, ["doctor", "medical-data", id, "view"]) => {
                        let session = session?;
                        let file = backend.view_medical_data(&session, id)?;
                        Ok(("View succeeded", to_data(file)?))
                    }
                    (Post, ["doctor", "medical-data", id, "reveal-patient"]) => {
                        let session = session?;
                        let identity = backend.reveal_patient_identity(&session, id)?;
                        Ok(("Patient identity revealed", to_data(identity)?))
                    }
                    (Get, ["doctor", "authorization-requests"]) => {
                        let session = session?;
                        let filters: RequestFilters = parse(params)?;
                        let page = backend.get_doctor_authorization_requests(&session, &filters)?;
                        Ok(("Query succeeded", to_data(page)?))
                    }
                    (Get, ["patient", "authorization-requests"]) => {
                        let session = session?;
                        let filters: RequestFilters = parse(params)?;
                        let page = backend.get_patient_authorization_requests(&session, &filters)?;
                        Ok(("Query succeeded", to_data(page)?))
                    }
                    (Post, ["patient", "authorization-requests", "reveal-identity"]) => {
                        let session = session?;
                        let body: RevealDoctorBody = parse(data)?;
                        let identity = backend.reveal_doctor_identity(&session, &body.request_id)?;
                        Ok(("Doctor identity revealed", to_data(identity)?))
                    }
                    (Post, ["patient", "authorization-requests", id, "approve"]) => {
                        let session = session?;
                        let body: ApproveBody = if data.is_null() {
                            ApproveBody {
                                expires_in: 0,
                                notes: None,
                            }
                        } else {
                            parse(data)?
                        };
                        let input = ApproveAuthorizationInput {
                            request_id: id.to_string(),
                            expires_in: body.expires_in,
                            notes: body.notes,
                        };
                        let request = backend.approve_authorization_request(&session, input)?;
                        Ok(("Authorization approved", to_data(request)?))
                    }
                    (Post, ["patient", "authorization-requests", id, "reject"]) => {
                        let session = session?;
                        let body: ReasonBody = if data.is_null() {
                            ReasonBody::default()
                        } else {
                            parse(data)?
                        };
                        let input = RejectAuthorizationInput {
                            request_id: id.to_string(),
                            reason: body.reason,
                        };
                        let request = backend.reject_authorization_request(&session, input)?;
                        Ok(("Authorization rejected", to_data(request)?))
                    }
                    (Get, ["access-records"]) => {
                        let session = session?;
                        let filters: AccessRecordFilters = parse(params)?;
                        let page = backend.get_access_records_list(&session, &filters)?;
                        Ok(("Query succeeded", to_data(page)?))
                    }
                    _ => Err(MedshareError::not_found(format!(
                        "route {} /{}",
                        method,
                        segments.join("/")
                    ))),
                }
            }
        }
    }
}
