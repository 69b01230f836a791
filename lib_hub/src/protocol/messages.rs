use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

/// `requestId` carried by responses that were not asked for: live snapshot
/// rows, the live `snapshot-complete`, and deltas fanned out by an engine.
pub const LIVE_REQUEST_ID: &str = "live";

/// Suffix appended to a `getSnapshot` request id for the completion event, so
/// it never collides with the correlation of the data event itself.
pub const COMPLETE_SUFFIX: &str = "-complete";

/// Builds the `requestId` used by the `snapshot-complete` event.
pub fn complete_request_id(request_id: &str) -> String {
    format!("{}{}", request_id, COMPLETE_SUFFIX)
}

/// Current wall-clock time in Unix milliseconds, as stamped on every response.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The operations a client may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Unsubscribe,
    GetSnapshot,
    GetStatus,
    Heartbeat,
}

impl RequestKind {
    /// Maps the wire `type` string to a kind. Unknown strings yield `None` so
    /// the dispatcher can name the offending type in its error reply.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "getSnapshot" => Some(Self::GetSnapshot),
            "getStatus" => Some(Self::GetStatus),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::GetSnapshot => "getSnapshot",
            Self::GetStatus => "getStatus",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// # Hub Request
///
/// One inbound message from a port. `type` is kept as the raw string until
/// dispatch so that an unrecognised value still deserializes and can be
/// answered with an `error` rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubRequest {
    pub r#type: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl HubRequest {
    /// Convenience constructor, mostly for clients and tests.
    pub fn new(kind: RequestKind, provider_id: &str, request_id: &str) -> Self {
        Self {
            r#type: kind.as_str().to_string(),
            provider_id: provider_id.to_string(),
            request_id: request_id.to_string(),
            port_id: None,
            config: None,
        }
    }

    pub fn with_port(mut self, port_id: &str) -> Self {
        self.port_id = Some(port_id.to_string());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Parses one text frame into a request.
    pub fn from_json(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::InvalidJson(e.to_string()))
    }

    /// The typed kind, or `None` for an unrecognised `type`.
    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_wire(&self.r#type)
    }
}

/// Outbound message types. Serialized in kebab-case, so `SnapshotComplete`
/// travels as `"snapshot-complete"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKind {
    Subscribed,
    Unsubscribed,
    Snapshot,
    SnapshotComplete,
    Status,
    HeartbeatAck,
    /// Post-snapshot delta fanned out from an engine.
    Update,
    Error,
}

/// # Hub Response
///
/// One outbound message to a port. `requestId` is always the caller's value,
/// echoed unchanged (or derived from it for `snapshot-complete`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubResponse {
    pub r#type: ResponseKind,
    pub provider_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl HubResponse {
    pub fn new(kind: ResponseKind, provider_id: &str, request_id: &str) -> Self {
        Self {
            r#type: kind,
            provider_id: provider_id.to_string(),
            request_id: request_id.to_string(),
            data: None,
            statistics: None,
            error: None,
            timestamp: now_millis(),
        }
    }

    /// Reply to `request`, echoing its provider and request ids.
    pub fn reply(kind: ResponseKind, request: &HubRequest) -> Self {
        Self::new(kind, &request.provider_id, &request.request_id)
    }

    /// The `error` reply for a failed request.
    pub fn error(request: &HubRequest, err: &HubError) -> Self {
        let mut response = Self::reply(ResponseKind::Error, request);
        response.error = Some(err.to_string());
        response
    }

    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_statistics(mut self, statistics: Value) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
