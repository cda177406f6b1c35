use serde_json::Value;
use thiserror::Error;

/// Human label for a WebSocket close code, if it is one the client produces
/// or commonly sees.
pub fn close_hint(code: u16) -> Option<&'static str> {
    match code {
        1000 => Some("normal closure"),
        1006 => Some("abnormal closure (no close frame)"),
        1008 => Some("policy violation"),
        4000 => Some("tick timeout"),
        _ => None,
    }
}

fn describe_code(code: &u16) -> String {
    match close_hint(*code) {
        Some(hint) => format!("{code} {hint}"),
        None => code.to_string(),
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway not connected")]
    NotConnected,

    #[error("gateway client stopped")]
    Stopped,

    #[error("gateway closed ({}): {reason}", describe_code(.code))]
    Closed { code: u16, reason: String },

    #[error("{message}")]
    Request {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("invalid frame: {0}")]
    Validation(String),

    #[error("{0}")]
    Tls(String),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway timeout after {0}ms")]
    Timeout(u64),

    #[error("device identity error: {0}")]
    Identity(String),
}

impl GatewayError {
    /// The server's error code for request failures.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Request { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<clawlink_core::schema::SchemaError> for GatewayError {
    fn from(err: clawlink_core::schema::SchemaError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// A one-shot call failure, with the connection diagnostics appended.
#[derive(Debug, Error)]
#[error("{error}\n{details}")]
pub struct CallError {
    #[source]
    pub error: GatewayError,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_display_with_hint() {
        let err = GatewayError::Closed {
            code: 4000,
            reason: "tick timeout".into(),
        };
        assert_eq!(err.to_string(), "gateway closed (4000 tick timeout): tick timeout");

        let err = GatewayError::Closed {
            code: 4321,
            reason: "bye".into(),
        };
        assert_eq!(err.to_string(), "gateway closed (4321): bye");
    }

    #[test]
    fn test_call_error_appends_details() {
        let err = CallError {
            error: GatewayError::Timeout(10_000),
            details: "Gateway target: ws://127.0.0.1:18789".into(),
        };
        assert_eq!(
            err.to_string(),
            "gateway timeout after 10000ms\nGateway target: ws://127.0.0.1:18789"
        );
    }

    #[test]
    fn test_request_error_code() {
        let err = GatewayError::Request {
            code: "NOT_PAIRED".into(),
            message: "pairing required".into(),
            details: None,
        };
        assert_eq!(err.code(), Some("NOT_PAIRED"));
        assert_eq!(err.to_string(), "pairing required");
    }
}
