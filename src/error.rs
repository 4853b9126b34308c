//! Unified error handling for the route coordinator.
//!
//! Backend, upload, engine and persistence failures all surface as
//! [`CoordinatorError`]. Asset upload and map cleanup errors are normally
//! logged and swallowed by their callers; only save/load/list/delete failures
//! reach the application.

use std::fmt;

/// Message the backend uses to signal an expired or missing session.
pub const AUTH_REQUIRED_MESSAGE: &str = "Authentication required";

/// Unified error type for route coordinator operations.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    /// Backend rejected the call because the user is not signed in
    AuthenticationRequired,
    /// Save was requested with no route segments in the session
    NoRouteData,
    /// Segment or saved route could not be found
    RouteNotFound { route_id: String },
    /// Backend/API error
    Backend {
        message: String,
        status_code: Option<u16>,
    },
    /// Asset upload failed
    Upload { asset_id: String, message: String },
    /// Rendering engine refused an operation
    Engine { message: String },
    /// Local storage error
    Persistence { message: String },
    /// Document could not be encoded or decoded
    Serialization { message: String },
    /// Generic internal error
    Internal { message: String },
}

impl CoordinatorError {
    /// Normalize a raw backend message, recognising the auth sentinel.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if message == AUTH_REQUIRED_MESSAGE {
            CoordinatorError::AuthenticationRequired
        } else {
            CoordinatorError::Backend {
                message,
                status_code: None,
            }
        }
    }

    /// Whether the user has to sign in again before retrying.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, CoordinatorError::AuthenticationRequired)
    }
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::AuthenticationRequired => write!(f, "{}", AUTH_REQUIRED_MESSAGE),
            CoordinatorError::NoRouteData => write!(f, "No route data to save"),
            CoordinatorError::RouteNotFound { route_id } => {
                write!(f, "Route '{}' not found", route_id)
            }
            CoordinatorError::Backend {
                message,
                status_code,
            } => {
                if let Some(code) = status_code {
                    write!(f, "Backend error ({}): {}", code, message)
                } else {
                    write!(f, "Backend error: {}", message)
                }
            }
            CoordinatorError::Upload { asset_id, message } => {
                write!(f, "Upload of '{}' failed: {}", asset_id, message)
            }
            CoordinatorError::Engine { message } => {
                write!(f, "Map engine error: {}", message)
            }
            CoordinatorError::Persistence { message } => {
                write!(f, "Persistence error: {}", message)
            }
            CoordinatorError::Serialization { message } => {
                write!(f, "Serialization error: {}", message)
            }
            CoordinatorError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for CoordinatorError {
    fn from(e: rusqlite::Error) -> Self {
        CoordinatorError::Persistence {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for CoordinatorError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CoordinatorError::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for CoordinatorError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CoordinatorError::Serialization {
            message: e.to_string(),
        }
    }
}

/// Result type alias for route coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Extension trait for converting Option to CoordinatorError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a route-not-found error.
    fn ok_or_route_not_found(self, route_id: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_route_not_found(self, route_id: &str) -> Result<T> {
        self.ok_or_else(|| CoordinatorError::RouteNotFound {
            route_id: route_id.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| CoordinatorError::Internal {
            message: message.to_string(),
        })
    }
}
