use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::keys::CursorType;

// Shared contract constants
pub const PROJECT_ID: &str = "eventwatch";
/// Chain nodes fetched per walker round. One round of sequential node GETs
/// must fit comfortably inside LOOP_INTERVAL.
pub const EVENT_STEP: usize = 200;
/// Hard wall-clock deadline of one watch request, both for the long-poll
/// loop and for the start-from chain scan.
pub const TIMEOUT_WATCH_LOOP: Duration = Duration::from_secs(25);
/// Sleep between long-poll rounds.
pub const LOOP_INTERVAL: Duration = Duration::from_millis(250);
/// Sentinel cursor handed to clients when a poll produced no usable cursor.
/// Sending it back means "start from the head of the chain".
pub const NO_EVENT_CURSOR: &str = "NoEventCursor";
pub const MAX_CONCURRENT_WATCHES: usize = 100;
pub const MAX_WATCH_FIELDS: usize = 64;
pub const MAX_CURSOR_LENGTH: usize = 1024;
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Kind of change a chain node records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// Wall-clock second at which the source change was observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTime {
    pub sec: i64,
    #[serde(default)]
    pub nsec: u32,
}

/// One logical event in a cursor chain, stored as a JSON blob at
/// `Key::node_key(cursor)`. Sentinel nodes carry no event type and never
/// appear in walker windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainNode {
    pub cursor: String,
    pub next_cursor: String,
    #[serde(default)]
    pub cluster_time: ClusterTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
}

/// Client intent decoded from the watch request body. The resource is bound
/// from the URL path; a `bk_resource` field in the body is ignored.
#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
pub struct WatchEventOptions {
    /// Resume from the node after this cursor. `NoEventCursor` resumes from
    /// the head of the chain.
    #[serde(rename = "bk_cursor", default)]
    pub cursor: String,
    /// Unix seconds; watch events with `cluster_time.sec >= bk_start_from`.
    #[serde(rename = "bk_start_from", default)]
    pub start_from: i64,
    /// Event types to watch. Empty means all types.
    #[serde(rename = "bk_event_types", default)]
    pub event_types: Vec<EventType>,
    /// Top-level detail fields to project. Empty means the full detail.
    #[serde(rename = "bk_fields", default)]
    pub fields: Vec<String>,
}

impl WatchEventOptions {
    pub fn validate(&self) -> Result<(), ApiError> {
        if !self.cursor.is_empty() && self.start_from != 0 {
            return Err(ApiError::InputInvalid(
                "bk_cursor and bk_start_from cannot both be set".to_string(),
            ));
        }
        if self.cursor.len() > MAX_CURSOR_LENGTH {
            return Err(ApiError::InputInvalid(format!(
                "bk_cursor: cannot exceed {MAX_CURSOR_LENGTH} characters"
            )));
        }
        if self.fields.len() > MAX_WATCH_FIELDS {
            return Err(ApiError::InputInvalid(format!(
                "bk_fields: cannot exceed {MAX_WATCH_FIELDS} entries"
            )));
        }
        if self.fields.iter().any(|f| f.is_empty()) {
            return Err(ApiError::InputInvalid(
                "bk_fields: field names cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One watched event, or a miss sentinel when `bk_detail` is null.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WatchEventResp {
    #[serde(rename = "bk_cursor")]
    pub cursor: String,
    #[serde(rename = "bk_resource")]
    pub resource: CursorType,
    /// Embedded raw JSON of the (possibly field-projected) event detail.
    #[serde(rename = "bk_detail")]
    #[schema(value_type = Option<Object>)]
    pub detail: Option<Box<RawValue>>,
}

impl WatchEventResp {
    /// Miss response: no usable cursor, the client should restart from head.
    pub fn miss(resource: CursorType) -> Self {
        Self {
            cursor: NO_EVENT_CURSOR.to_string(),
            resource,
            detail: None,
        }
    }
}

/// Filter nodes by the requested event types, preserving input order. An
/// empty filter passes everything.
pub fn hit_nodes_with_event_type(nodes: &[ChainNode], types: &[EventType]) -> Vec<ChainNode> {
    if types.is_empty() {
        return nodes.to_vec();
    }
    let wanted: HashSet<EventType> = types.iter().copied().collect();
    nodes
        .iter()
        .filter(|node| node.event_type.is_some_and(|t| wanted.contains(&t)))
        .cloned()
        .collect()
}

/// Project the listed top-level fields out of a detail document. An empty
/// field list returns the input unchanged; fields absent from the source are
/// omitted. A detail that is not a JSON object passes through unchanged.
pub fn cut_json_fields(detail: String, fields: &[String]) -> String {
    if fields.is_empty() {
        return detail;
    }
    let parsed: serde_json::Value = match serde_json::from_str(&detail) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                target: PROJECT_ID,
                %error,
                "event detail is not valid JSON, skipping field projection"
            );
            return detail;
        }
    };
    let serde_json::Value::Object(source) = parsed else {
        tracing::warn!(
            target: PROJECT_ID,
            "event detail is not a JSON object, skipping field projection"
        );
        return detail;
    };
    let mut projected = serde_json::Map::new();
    for field in fields {
        if let Some(value) = source.get(field) {
            projected.insert(field.clone(), value.clone());
        }
    }
    match serde_json::to_string(&serde_json::Value::Object(projected)) {
        Ok(cut) => cut,
        Err(_) => detail,
    }
}

// Error handling

/// Error envelope carried in the body of every failed watch call.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    #[serde(rename = "bk_error_code")]
    pub code: i32,
    #[serde(rename = "bk_error_msg")]
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    JsonDecodeFailed(String),
    InputInvalid(String),
    StartFromOutOfRange,
    StartFromTooSmall,
    BackendError,
    CacheUnavailable,
    ServerBusy,
}

impl ApiError {
    pub fn code(&self) -> i32 {
        match self {
            ApiError::JsonDecodeFailed(_) => 1_300_001,
            ApiError::InputInvalid(_) => 1_300_002,
            ApiError::StartFromOutOfRange => 1_300_003,
            ApiError::StartFromTooSmall => 1_300_004,
            ApiError::BackendError => 1_300_005,
            ApiError::CacheUnavailable => 1_300_006,
            ApiError::ServerBusy => 1_300_007,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::JsonDecodeFailed(msg) => write!(f, "decode request body failed: {msg}"),
            ApiError::InputInvalid(msg) => write!(f, "invalid request options: {msg}"),
            ApiError::StartFromOutOfRange => write!(f, "bk_start_from value is out of range"),
            ApiError::StartFromTooSmall => write!(f, "bk_start_from value is too small"),
            ApiError::BackendError => write!(f, "event watch backend failed"),
            ApiError::CacheUnavailable => write!(f, "event cache is unavailable"),
            ApiError::ServerBusy => write!(f, "too many active watch requests"),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        // The gateway in front of this service treats non-200 transport
        // statuses as infrastructure failures. API failures always travel as
        // a 200 with the error envelope in the body.
        StatusCode::OK
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::Ok().json(ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        })
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub cache_connected: bool,
    pub timestamp: String,
}
