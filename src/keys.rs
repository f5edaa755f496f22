use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::ApiError;

/// Retention window of a cursor chain. Ingestion expires nodes and details on
/// this schedule; `bk_start_from` values older than `now - ttl` on an empty
/// chain are rejected as out of range.
pub const DEFAULT_CHAIN_TTL_SECS: i64 = 3 * 60 * 60;

const WATCH_CACHE_PREFIX: &str = "ew:watch";

/// Stable cursor value carried by the head sentinel node.
const HEAD_CURSOR: &str = "head";
/// Stable cursor value carried by the tail sentinel node.
const TAIL_CURSOR: &str = "tail";

/// The set of watchable resources. The wire form is the snake_case name,
/// bound from the URL path of the watch endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CursorType {
    Host,
    HostRelation,
    Biz,
    Set,
    Module,
    Process,
}

impl CursorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorType::Host => "host",
            CursorType::HostRelation => "host_relation",
            CursorType::Biz => "biz",
            CursorType::Set => "set",
            CursorType::Module => "module",
            CursorType::Process => "process",
        }
    }

    /// Resolve the path parameter of the watch endpoint.
    pub fn from_path(resource: &str) -> Result<Self, ApiError> {
        match resource {
            "host" => Ok(CursorType::Host),
            "host_relation" => Ok(CursorType::HostRelation),
            "biz" => Ok(CursorType::Biz),
            "set" => Ok(CursorType::Set),
            "module" => Ok(CursorType::Module),
            "process" => Ok(CursorType::Process),
            other => Err(ApiError::InputInvalid(format!(
                "unknown watch resource: {other}"
            ))),
        }
    }
}

impl fmt::Display for CursorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-resource namespace of one cursor chain. Derives every cache key the
/// walker needs; the watch service never writes through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    resource: CursorType,
    namespace: String,
    ttl_secs: i64,
}

impl Key {
    pub fn new(resource: CursorType) -> Self {
        Self {
            resource,
            namespace: format!("{WATCH_CACHE_PREFIX}:{}", resource.as_str()),
            ttl_secs: DEFAULT_CHAIN_TTL_SECS,
        }
    }

    pub fn resource(&self) -> CursorType {
        self.resource
    }

    /// Log label for this chain.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cursor value of the head sentinel. When a chain is empty the head
    /// sentinel's `next_cursor` equals `tail_key()` and vice versa.
    pub fn head_key(&self) -> &'static str {
        HEAD_CURSOR
    }

    /// Cursor value of the tail sentinel.
    pub fn tail_key(&self) -> &'static str {
        TAIL_CURSOR
    }

    /// Cache key holding the chain node blob for a cursor.
    pub fn node_key(&self, cursor: &str) -> String {
        format!("{}:node:{cursor}", self.namespace)
    }

    /// Cache key holding the event detail payload for a cursor.
    pub fn detail_key(&self, cursor: &str) -> String {
        format!("{}:detail:{cursor}", self.namespace)
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_secs
    }
}
