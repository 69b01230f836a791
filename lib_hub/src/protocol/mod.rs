//! # Message Protocol
//!
//! Typed request/response envelopes exchanged between a client port and the
//! hub. Every inbound frame is a [`HubRequest`]; every outbound frame is a
//! [`HubResponse`]. Field names on the wire are camelCase and response types
//! are kebab-case (`snapshot-complete`, `heartbeat-ack`).

/// Request and response envelopes plus their correlation helpers.
pub mod messages;

pub use messages::{
    complete_request_id, now_millis, HubRequest, HubResponse, RequestKind, ResponseKind,
    COMPLETE_SUFFIX, LIVE_REQUEST_ID,
};
