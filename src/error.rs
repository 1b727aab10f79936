//! Unified error handling for the casemap library.
//!
//! Partial data is normal in this domain: samples missing an address or timestamp are
//! filtered out by the aggregation passes and never reach this type. Errors are reserved
//! for invariant violations at construction time and for collaborator failures.

use thiserror::Error;

/// Unified error type for casemap operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaseMapError {
    /// Bounds with min > max on an axis, or non-finite edges
    #[error("Invalid bounds [{min_lat}, {min_lon}]-[{max_lat}, {max_lon}]: {message}")]
    InvalidBounds {
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
        message: String,
    },
    /// Coordinate outside WGS84 ranges
    #[error("Invalid coordinate ({latitude}, {longitude})")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
    /// Configuration error
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },
    /// Persistence collaborator error
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// Marker source (network) error
    #[error("{}", fetch_message(.message, .status_code))]
    Fetch {
        message: String,
        status_code: Option<u16>,
    },
    /// JSON encoding/decoding error
    #[error("Serialization error: {message}")]
    Serialization { message: String },
    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn fetch_message(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("Fetch error ({}): {}", code, message),
        None => format!("Fetch error: {}", message),
    }
}

impl CaseMapError {
    /// Shorthand for a fetch error without an HTTP status.
    pub fn fetch(message: impl Into<String>) -> Self {
        CaseMapError::Fetch {
            message: message.into(),
            status_code: None,
        }
    }

    /// Shorthand for a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        CaseMapError::Persistence {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CaseMapError {
    fn from(err: serde_json::Error) -> Self {
        CaseMapError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for casemap operations.
pub type Result<T> = std::result::Result<T, CaseMapError>;

/// Extension trait for converting Option to CaseMapError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| CaseMapError::InvalidConfig {
            message: message.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| CaseMapError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaseMapError::Fetch {
            message: "timeout".to_string(),
            status_code: Some(504),
        };
        assert_eq!(err.to_string(), "Fetch error (504): timeout");

        let err = CaseMapError::fetch("offline");
        assert_eq!(err.to_string(), "Fetch error: offline");
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_config("top_n must be positive");
        assert!(matches!(result, Err(CaseMapError::InvalidConfig { .. })));

        assert_eq!(Some(3).ok_or_internal("unused"), Ok(3));
    }

    #[test]
    fn test_from_serde_error() {
        let err: CaseMapError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CaseMapError::Serialization { .. }));
    }
}
