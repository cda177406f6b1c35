//! Runtime validation of protocol frames and payloads.
//!
//! Each message type is described by a static [`ObjectSchema`] table. Tables
//! are plain `static` data, so nothing is compiled per call. Objects are closed:
//! a key that is not declared in the table is rejected.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{ChallengePayload, ConnectParams, GatewayFrame, HelloOk};

/// A schema violation at a JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum Kind {
    String,
    NonEmptyString,
    Bool,
    /// Non-negative integer.
    Integer,
    Array(&'static Kind),
    /// Object with arbitrary keys whose values share one kind.
    Map(&'static Kind),
    Object(&'static ObjectSchema),
    Literal(&'static str),
    Any,
}

#[derive(Debug)]
pub struct Field {
    pub name: &'static str,
    pub kind: Kind,
    pub required: bool,
}

impl Field {
    const fn required(name: &'static str, kind: Kind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, kind: Kind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug)]
pub struct ObjectSchema {
    pub name: &'static str,
    pub fields: &'static [Field],
}

pub static STATE_VERSION: ObjectSchema = ObjectSchema {
    name: "StateVersion",
    fields: &[
        Field::required("presence", Kind::Integer),
        Field::required("health", Kind::Integer),
    ],
};

pub static ERROR_SHAPE: ObjectSchema = ObjectSchema {
    name: "ErrorShape",
    fields: &[
        Field::required("code", Kind::NonEmptyString),
        Field::required("message", Kind::String),
        Field::optional("details", Kind::Any),
        Field::optional("retryable", Kind::Bool),
        Field::optional("retryAfterMs", Kind::Integer),
    ],
};

pub static REQUEST_FRAME: ObjectSchema = ObjectSchema {
    name: "RequestFrame",
    fields: &[
        Field::required("type", Kind::Literal("req")),
        Field::required("id", Kind::NonEmptyString),
        Field::required("method", Kind::NonEmptyString),
        Field::optional("params", Kind::Any),
    ],
};

pub static RESPONSE_FRAME: ObjectSchema = ObjectSchema {
    name: "ResponseFrame",
    fields: &[
        Field::required("type", Kind::Literal("res")),
        Field::required("id", Kind::NonEmptyString),
        Field::required("ok", Kind::Bool),
        Field::optional("payload", Kind::Any),
        Field::optional("error", Kind::Object(&ERROR_SHAPE)),
    ],
};

pub static EVENT_FRAME: ObjectSchema = ObjectSchema {
    name: "EventFrame",
    fields: &[
        Field::required("type", Kind::Literal("event")),
        Field::required("event", Kind::NonEmptyString),
        Field::optional("payload", Kind::Any),
        Field::optional("seq", Kind::Integer),
        Field::optional("stateVersion", Kind::Object(&STATE_VERSION)),
    ],
};

pub static CLIENT_INFO: ObjectSchema = ObjectSchema {
    name: "ClientInfo",
    fields: &[
        Field::required("id", Kind::NonEmptyString),
        Field::optional("displayName", Kind::String),
        Field::required("version", Kind::NonEmptyString),
        Field::required("platform", Kind::NonEmptyString),
        Field::optional("deviceFamily", Kind::String),
        Field::optional("modelIdentifier", Kind::String),
        Field::required("mode", Kind::NonEmptyString),
        Field::optional("instanceId", Kind::String),
    ],
};

pub static DEVICE_PARAMS: ObjectSchema = ObjectSchema {
    name: "DeviceParams",
    fields: &[
        Field::required("id", Kind::NonEmptyString),
        Field::required("publicKey", Kind::NonEmptyString),
        Field::required("signature", Kind::NonEmptyString),
        Field::required("signedAt", Kind::Integer),
        Field::optional("nonce", Kind::NonEmptyString),
    ],
};

pub static AUTH_PARAMS: ObjectSchema = ObjectSchema {
    name: "AuthParams",
    fields: &[
        Field::optional("token", Kind::String),
        Field::optional("password", Kind::String),
    ],
};

pub static CONNECT_PARAMS: ObjectSchema = ObjectSchema {
    name: "ConnectParams",
    fields: &[
        Field::required("minProtocol", Kind::Integer),
        Field::required("maxProtocol", Kind::Integer),
        Field::required("client", Kind::Object(&CLIENT_INFO)),
        Field::optional("caps", Kind::Array(&Kind::NonEmptyString)),
        Field::optional("commands", Kind::Array(&Kind::NonEmptyString)),
        Field::optional("permissions", Kind::Map(&Kind::Bool)),
        Field::optional("pathEnv", Kind::String),
        Field::optional("role", Kind::NonEmptyString),
        Field::optional("scopes", Kind::Array(&Kind::NonEmptyString)),
        Field::optional("device", Kind::Object(&DEVICE_PARAMS)),
        Field::optional("auth", Kind::Object(&AUTH_PARAMS)),
        Field::optional("locale", Kind::String),
        Field::optional("userAgent", Kind::String),
    ],
};

pub static SERVER_INFO: ObjectSchema = ObjectSchema {
    name: "ServerInfo",
    fields: &[
        Field::required("version", Kind::NonEmptyString),
        Field::optional("commit", Kind::String),
        Field::optional("host", Kind::String),
        Field::required("connId", Kind::NonEmptyString),
    ],
};

pub static FEATURES: ObjectSchema = ObjectSchema {
    name: "Features",
    fields: &[
        Field::required("methods", Kind::Array(&Kind::NonEmptyString)),
        Field::required("events", Kind::Array(&Kind::NonEmptyString)),
    ],
};

pub static HELLO_AUTH: ObjectSchema = ObjectSchema {
    name: "HelloAuth",
    fields: &[
        Field::required("deviceToken", Kind::NonEmptyString),
        Field::required("role", Kind::NonEmptyString),
        Field::required("scopes", Kind::Array(&Kind::NonEmptyString)),
        Field::optional("issuedAtMs", Kind::Integer),
    ],
};

pub static POLICY: ObjectSchema = ObjectSchema {
    name: "Policy",
    fields: &[
        Field::required("maxPayload", Kind::Integer),
        Field::required("maxBufferedBytes", Kind::Integer),
        Field::required("tickIntervalMs", Kind::Integer),
    ],
};

pub static HELLO_OK: ObjectSchema = ObjectSchema {
    name: "HelloOk",
    fields: &[
        Field::required("type", Kind::Literal("hello-ok")),
        Field::required("protocol", Kind::Integer),
        Field::required("server", Kind::Object(&SERVER_INFO)),
        Field::required("features", Kind::Object(&FEATURES)),
        Field::required("snapshot", Kind::Any),
        Field::optional("canvasHostUrl", Kind::String),
        Field::optional("auth", Kind::Object(&HELLO_AUTH)),
        Field::required("policy", Kind::Object(&POLICY)),
    ],
};

pub static CHALLENGE_PAYLOAD: ObjectSchema = ObjectSchema {
    name: "ConnectChallenge",
    fields: &[
        Field::required("nonce", Kind::NonEmptyString),
        Field::optional("ts", Kind::Integer),
    ],
};

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}.{key}")
    }
}

fn check_kind(kind: &Kind, value: &Value, path: &str) -> Result<(), SchemaError> {
    match kind {
        Kind::Any => Ok(()),
        Kind::String => value
            .as_str()
            .map(|_| ())
            .ok_or_else(|| SchemaError::new(path, "must be a string")),
        Kind::NonEmptyString => match value.as_str() {
            Some(s) if !s.is_empty() => Ok(()),
            Some(_) => Err(SchemaError::new(path, "must not be empty")),
            None => Err(SchemaError::new(path, "must be a string")),
        },
        Kind::Bool => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| SchemaError::new(path, "must be a boolean")),
        Kind::Integer => value
            .as_u64()
            .map(|_| ())
            .ok_or_else(|| SchemaError::new(path, "must be a non-negative integer")),
        Kind::Literal(expected) => match value.as_str() {
            Some(s) if s == *expected => Ok(()),
            _ => Err(SchemaError::new(path, format!("must equal \"{expected}\""))),
        },
        Kind::Array(item) => {
            let items = value
                .as_array()
                .ok_or_else(|| SchemaError::new(path, "must be an array"))?;
            for (i, v) in items.iter().enumerate() {
                check_kind(item, v, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        Kind::Map(item) => {
            let map = value
                .as_object()
                .ok_or_else(|| SchemaError::new(path, "must be an object"))?;
            for (k, v) in map {
                check_kind(item, v, &join_path(path, k))?;
            }
            Ok(())
        }
        Kind::Object(schema) => check_object(schema, value, path),
    }
}

fn check_object(schema: &ObjectSchema, value: &Value, path: &str) -> Result<(), SchemaError> {
    let display = if path.is_empty() { schema.name } else { path };
    let map = value
        .as_object()
        .ok_or_else(|| SchemaError::new(display, "must be an object"))?;

    for key in map.keys() {
        if !schema.fields.iter().any(|f| f.name == key) {
            return Err(SchemaError::new(
                join_path(path, key),
                format!("unexpected property in {}", schema.name),
            ));
        }
    }

    for field in schema.fields {
        let field_path = join_path(path, field.name);
        match map.get(field.name) {
            Some(v) => check_kind(&field.kind, v, &field_path)?,
            None if field.required => {
                return Err(SchemaError::new(field_path, "is required"));
            }
            None => {}
        }
    }
    Ok(())
}

/// Validate `value` against `schema`.
pub fn validate(schema: &ObjectSchema, value: &Value) -> Result<(), SchemaError> {
    check_object(schema, value, "")
}

fn decode<T: DeserializeOwned>(schema: &ObjectSchema, value: &Value) -> Result<T, SchemaError> {
    validate(schema, value)?;
    serde_json::from_value(value.clone()).map_err(|e| SchemaError::new(schema.name, e.to_string()))
}

pub fn validate_request_frame(value: &Value) -> Result<(), SchemaError> {
    validate(&REQUEST_FRAME, value)
}

pub fn validate_response_frame(value: &Value) -> Result<(), SchemaError> {
    validate(&RESPONSE_FRAME, value)
}

pub fn validate_event_frame(value: &Value) -> Result<(), SchemaError> {
    validate(&EVENT_FRAME, value)
}

/// Validate and decode an incoming frame, dispatching on its `type` tag.
pub fn parse_frame(value: &Value) -> Result<GatewayFrame, SchemaError> {
    let schema = match value.get("type").and_then(Value::as_str) {
        Some("req") => &REQUEST_FRAME,
        Some("res") => &RESPONSE_FRAME,
        Some("event") => &EVENT_FRAME,
        Some(other) => {
            return Err(SchemaError::new("type", format!("unknown frame type \"{other}\"")));
        }
        None => return Err(SchemaError::new("type", "is required")),
    };
    decode(schema, value)
}

pub fn parse_connect_params(value: &Value) -> Result<ConnectParams, SchemaError> {
    let params: ConnectParams = decode(&CONNECT_PARAMS, value)?;
    if params.min_protocol > params.max_protocol {
        return Err(SchemaError::new(
            "minProtocol",
            "must not exceed maxProtocol",
        ));
    }
    Ok(params)
}

pub fn parse_hello_ok(value: &Value) -> Result<HelloOk, SchemaError> {
    decode(&HELLO_OK, value)
}

pub fn parse_challenge(value: &Value) -> Result<ChallengePayload, SchemaError> {
    decode(&CHALLENGE_PAYLOAD, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_valid() {
        let frame = json!({"type": "req", "id": "1", "method": "health"});
        assert!(validate_request_frame(&frame).is_ok());
    }

    #[test]
    fn test_request_frame_rejects_unknown_field() {
        let frame = json!({"type": "req", "id": "1", "method": "health", "extra": true});
        let err = validate_request_frame(&frame).unwrap_err();
        assert_eq!(err.path, "extra");
    }

    #[test]
    fn test_request_frame_rejects_empty_method() {
        let frame = json!({"type": "req", "id": "1", "method": ""});
        let err = validate_request_frame(&frame).unwrap_err();
        assert_eq!(err.path, "method");
    }

    #[test]
    fn test_response_frame_error_shape() {
        let ok = json!({
            "type": "res", "id": "1", "ok": false,
            "error": {"code": "INVALID_REQUEST", "message": "bad"}
        });
        assert!(validate_response_frame(&ok).is_ok());

        let bad = json!({
            "type": "res", "id": "1", "ok": false,
            "error": {"code": "INVALID_REQUEST"}
        });
        let err = validate_response_frame(&bad).unwrap_err();
        assert_eq!(err.path, "error.message");
    }

    #[test]
    fn test_event_frame_seq_must_be_integer() {
        let bad = json!({"type": "event", "event": "tick", "seq": "1"});
        assert_eq!(validate_event_frame(&bad).unwrap_err().path, "seq");
    }

    #[test]
    fn test_parse_frame_dispatch() {
        let frame = parse_frame(&json!({"type": "event", "event": "tick", "seq": 3})).unwrap();
        assert!(matches!(frame, GatewayFrame::Event { seq: Some(3), .. }));
        assert!(parse_frame(&json!({"type": "bogus"})).is_err());
        assert!(parse_frame(&json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_connect_params_nested_paths() {
        let value = json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "cli", "version": "dev", "platform": "linux", "mode": "cli", "color": "red"}
        });
        let err = parse_connect_params(&value).unwrap_err();
        assert_eq!(err.path, "client.color");
    }

    #[test]
    fn test_connect_params_protocol_bounds() {
        let value = json!({
            "minProtocol": 4,
            "maxProtocol": 3,
            "client": {"id": "cli", "version": "dev", "platform": "linux", "mode": "cli"}
        });
        assert_eq!(parse_connect_params(&value).unwrap_err().path, "minProtocol");
    }

    #[test]
    fn test_scopes_array_items_checked() {
        let value = json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "cli", "version": "dev", "platform": "linux", "mode": "cli"},
            "scopes": ["operator.admin", 5]
        });
        assert_eq!(parse_connect_params(&value).unwrap_err().path, "scopes[1]");
    }

    #[test]
    fn test_hello_ok_requires_policy() {
        let value = json!({
            "type": "hello-ok",
            "protocol": 3,
            "server": {"version": "1", "connId": "c"},
            "features": {"methods": [], "events": []},
            "snapshot": null
        });
        assert_eq!(parse_hello_ok(&value).unwrap_err().path, "policy");
    }

    #[test]
    fn test_challenge_payload() {
        let c = parse_challenge(&json!({"nonce": "abc", "ts": 1700000000000u64})).unwrap();
        assert_eq!(c.nonce, "abc");
        assert!(parse_challenge(&json!({"nonce": ""})).is_err());
    }
}
