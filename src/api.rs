//! Management API served under `/api`
//!
//! JSON in, JSON out, wrapped in a `{success, data, error}` envelope.
//! Uploads (app code and the dependency manifest) travel as JSON strings.

use crate::error::HostError;
use crate::proxy::ProxyState;
use crate::registry::AppRecord;
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Upper bound for an API request body
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Log lines returned when the caller does not ask for a count
const DEFAULT_LOG_TAIL: usize = 200;

/// Uniform envelope for all API responses
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppRequest {
    pub name: String,
    /// App source, uploaded inline
    pub code: String,
    /// Dependency manifest; empty means no dependencies
    #[serde(default)]
    pub manifest: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppRequest {
    pub name: Option<String>,
    pub code: Option<String>,
    pub manifest: Option<String>,
}

/// One app as presented to API callers
#[derive(Debug, Serialize)]
pub struct AppResponse {
    pub app_id: String,
    pub name: String,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub generation: u64,
    pub code_sha256: String,
    pub manifest_sha256: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Where the app is reachable once running
    pub access_url: String,
}

impl AppResponse {
    fn from_record(record: &AppRecord, public_base: &str) -> Self {
        Self {
            app_id: record.app_id.clone(),
            name: record.name.clone(),
            state: record.status.label(),
            port: record.status.port(),
            pid: record.status.pid(),
            error: record.status.error().map(|e| e.to_string()),
            generation: record.generation,
            code_sha256: record.code_sha256.clone(),
            manifest_sha256: record.manifest_sha256.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            access_url: format!("{}/apps/{}/", public_base, record.app_id),
        }
    }
}

/// Dispatch an `/api/...` request
pub async fn handle_api(
    req: Request<Incoming>,
    state: &Arc<ProxyState>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let method = req.method().clone();
    let rest = path.strip_prefix("/api").unwrap_or("");
    let segments: Vec<String> = rest
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let segs: Vec<&str> = segments.iter().map(String::as_str).collect();
    debug!(%method, path = %path, "API request");

    let result = match (method, segs.as_slice()) {
        (Method::GET, ["health"]) => handle_health(state),
        (Method::GET, ["apps"]) => handle_list(state),
        (Method::POST, ["apps"]) => handle_create(req, state).await,
        (Method::GET, ["apps", id]) => handle_get(id, state),
        (Method::PATCH, ["apps", id]) => {
            let id = id.to_string();
            handle_update(req, &id, state).await
        }
        (Method::DELETE, ["apps", id]) => {
            let id = id.to_string();
            handle_delete(&id, state).await
        }
        (Method::POST, ["apps", id, "start"]) => handle_start(id, state),
        (Method::POST, ["apps", id, "stop"]) => {
            let id = id.to_string();
            handle_stop(&id, state).await
        }
        (Method::GET, ["apps", id, "logs"]) => handle_logs(id, query.as_deref(), state),
        _ => {
            return error_response(StatusCode::NOT_FOUND, "no such API endpoint");
        }
    };

    result.unwrap_or_else(|e| error_response(e.status_code(), e.to_string()))
}

type ApiResult = Result<Response<BoxBody<Bytes, hyper::Error>>, HostError>;

fn handle_health(state: &Arc<ProxyState>) -> ApiResult {
    Ok(ok_response(serde_json::json!({
        "status": "ok",
        "apps": state.orchestrator.registry().len(),
    })))
}

fn handle_list(state: &Arc<ProxyState>) -> ApiResult {
    let apps: Vec<AppResponse> = state
        .orchestrator
        .registry()
        .list()
        .iter()
        .map(|r| AppResponse::from_record(r, &state.public_base))
        .collect();
    Ok(ok_response(apps))
}

async fn handle_create(req: Request<Incoming>, state: &Arc<ProxyState>) -> ApiResult {
    let body = read_body(req).await?;
    let create: CreateAppRequest = serde_json::from_slice(&body)
        .map_err(|e| HostError::Validation(format!("invalid request body: {}", e)))?;
    let record = state.orchestrator.create(
        &create.name,
        create.code.as_bytes(),
        create.manifest.as_bytes(),
    )?;
    Ok(status_response(
        StatusCode::CREATED,
        AppResponse::from_record(&record, &state.public_base),
    ))
}

fn handle_get(app_id: &str, state: &Arc<ProxyState>) -> ApiResult {
    let record = state.orchestrator.registry().get(app_id)?;
    Ok(ok_response(AppResponse::from_record(&record, &state.public_base)))
}

async fn handle_update(
    req: Request<Incoming>,
    app_id: &str,
    state: &Arc<ProxyState>,
) -> ApiResult {
    let body = read_body(req).await?;
    let update: UpdateAppRequest = serde_json::from_slice(&body)
        .map_err(|e| HostError::Validation(format!("invalid request body: {}", e)))?;
    let record = state
        .orchestrator
        .edit(
            app_id,
            update.name.as_deref(),
            update.code.as_deref().map(str::as_bytes),
            update.manifest.as_deref().map(str::as_bytes),
        )
        .await?;
    Ok(ok_response(AppResponse::from_record(&record, &state.public_base)))
}

async fn handle_delete(app_id: &str, state: &Arc<ProxyState>) -> ApiResult {
    state.orchestrator.delete(app_id).await?;
    Ok(ok_response(serde_json::json!({ "app_id": app_id })))
}

fn handle_start(app_id: &str, state: &Arc<ProxyState>) -> ApiResult {
    let record = state.orchestrator.start(app_id)?;
    Ok(status_response(
        StatusCode::ACCEPTED,
        AppResponse::from_record(&record, &state.public_base),
    ))
}

async fn handle_stop(app_id: &str, state: &Arc<ProxyState>) -> ApiResult {
    let record = state.orchestrator.stop(app_id).await?;
    Ok(ok_response(AppResponse::from_record(&record, &state.public_base)))
}

fn handle_logs(app_id: &str, query: Option<&str>, state: &Arc<ProxyState>) -> ApiResult {
    let tail = tail_param(query);
    let lines = state.orchestrator.logs(app_id, tail)?;
    Ok(ok_response(serde_json::json!({
        "app_id": app_id,
        "tail": tail,
        "lines": lines,
    })))
}

/// `tail` query parameter, defaulting when absent or unparsable
fn tail_param(query: Option<&str>) -> usize {
    query
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("tail=")))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LOG_TAIL)
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, HostError> {
    let limited = Limited::new(req.into_body(), MAX_BODY_BYTES);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(HostError::Validation(format!(
            "failed to read request body: {}",
            e
        ))),
    }
}

fn ok_response<T: Serialize>(data: T) -> Response<BoxBody<Bytes, hyper::Error>> {
    status_response(StatusCode::OK, data)
}

fn status_response<T: Serialize>(
    status: StatusCode,
    data: T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let envelope = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    json_response(status, &envelope)
}

fn error_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let envelope = ApiResponse::<serde_json::Value> {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    json_response(status, &envelope)
}

fn json_response<T: Serialize>(
    status: StatusCode,
    envelope: &ApiResponse<T>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_string(envelope)
        .unwrap_or_else(|_| r#"{"success":false,"error":"serialization failure"}"#.to_string());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AppStatus;

    #[test]
    fn test_tail_param() {
        assert_eq!(tail_param(None), DEFAULT_LOG_TAIL);
        assert_eq!(tail_param(Some("tail=50")), 50);
        assert_eq!(tail_param(Some("foo=1&tail=7")), 7);
        assert_eq!(tail_param(Some("tail=abc")), DEFAULT_LOG_TAIL);
    }

    #[test]
    fn test_envelope_shape() {
        let ok = ApiResponse {
            success: true,
            data: Some(serde_json::json!({"x": 1})),
            error: None,
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"data\":{\"x\":1}"));
        assert!(!json.contains("error"));

        let err = ApiResponse::<serde_json::Value> {
            success: false,
            data: None,
            error: Some("boom".to_string()),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"error\":\"boom\""));
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_app_response_from_record() {
        let now = Utc::now();
        let record = AppRecord {
            app_id: "abc123".to_string(),
            name: "demo".to_string(),
            status: AppStatus::Running { port: 8501, pid: 42 },
            generation: 3,
            code_path: "/data/apps/abc123/app.py".into(),
            manifest_path: "/data/apps/abc123/requirements.txt".into(),
            env_path: "/data/apps/abc123/venv".into(),
            log_path: "/data/apps/abc123/run.log".into(),
            code_sha256: "aa".to_string(),
            manifest_sha256: "bb".to_string(),
            created_at: now,
            updated_at: now,
        };
        let response = AppResponse::from_record(&record, "http://host:8080");

        assert_eq!(response.state, "running");
        assert_eq!(response.port, Some(8501));
        assert_eq!(response.pid, Some(42));
        assert_eq!(response.error, None);
        assert_eq!(response.access_url, "http://host:8080/apps/abc123/");

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"state\":\"running\""));
        // Absent fields stay out of the payload
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_create_request_defaults_manifest() {
        let create: CreateAppRequest =
            serde_json::from_str(r#"{"name":"demo","code":"print(1)"}"#).unwrap();
        assert_eq!(create.manifest, "");
    }
}
