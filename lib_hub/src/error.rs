//! # Hub Errors
//!
//! Every fault the hub can hit while serving a request ends up as one of these
//! variants. Nothing here is ever propagated past the dispatcher: the `Display`
//! text of a `HubError` is what a client sees in the `error` field of an
//! `error` response.

use thiserror::Error;

use crate::engines::EngineError;

/// Faults raised while validating or serving a single request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("Engine not found for provider {0}. Subscribe first.")]
    EngineNotFound(String),

    #[error("portId {requested} does not match the port {bound} bound to this connection")]
    PortMismatch { bound: String, requested: String },

    #[error("Port {0} expired before its subscription completed; send a heartbeat and subscribe again")]
    PortExpired(String),

    #[error("Malformed request: {0}")]
    InvalidJson(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Shorthand used throughout the hub.
pub type HubResult<T> = Result<T, HubError>;
