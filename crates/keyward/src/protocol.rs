//! JSON-lines wire protocol between agent clients and the agent server.
//!
//! Every line is one frame: an object with a numeric `id` and a `type` tag.
//! Requests are `ping`, `decrypt` and `encrypt`; replies are `ok` or `error`
//! and echo the id of the request they answer. A connection carries any
//! number of concurrent requests and replies may arrive out of order.

use keyward_crypto::EncryptedSymmetricKeyRef;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a single frame (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Decrypt,
    Encrypt,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Ping => write!(f, "ping"),
            MessageType::Decrypt => write!(f, "decrypt"),
            MessageType::Encrypt => write!(f, "encrypt"),
        }
    }
}

/// Envelope carrying a request or reply body together with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame<T> {
    pub id: u64,
    #[serde(flatten)]
    pub body: T,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness check.
    Ping,
    /// Decrypt a ciphertext with the sealed key for its revision.
    Decrypt(DecryptRequest),
    /// Encrypt a value under a sealed symmetric key.
    Encrypt(EncryptRequest),
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Ping => MessageType::Ping,
            Request::Decrypt(_) => MessageType::Decrypt,
            Request::Encrypt(_) => MessageType::Encrypt,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptRequest {
    pub ciphertext: String,
    pub symmetric_key: EncryptedSymmetricKeyRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptRequest {
    pub value: serde_json::Value,
    pub symmetric_key: EncryptedSymmetricKeyRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptReply {
    pub ciphertext: String,
}

/// A request type with a statically known reply payload.
pub trait Message: Into<Request> {
    const TYPE: MessageType;
    type Reply: DeserializeOwned;
}

impl Message for PingRequest {
    const TYPE: MessageType = MessageType::Ping;
    type Reply = ();
}

impl Message for DecryptRequest {
    const TYPE: MessageType = MessageType::Decrypt;
    type Reply = serde_json::Value;
}

impl Message for EncryptRequest {
    const TYPE: MessageType = MessageType::Encrypt;
    type Reply = EncryptReply;
}

impl From<PingRequest> for Request {
    fn from(_: PingRequest) -> Self {
        Request::Ping
    }
}

impl From<DecryptRequest> for Request {
    fn from(req: DecryptRequest) -> Self {
        Request::Decrypt(req)
    }
}

impl From<EncryptRequest> for Request {
    fn from(req: EncryptRequest) -> Self {
        Request::Encrypt(req)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Request succeeded. `data` is `null` for replies without a payload.
    Ok {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Request failed.
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame could not be parsed as a request.
    InvalidRequest,
    /// The agent has no usable private key.
    KeyUnavailable,
    /// The handler ran and failed (bad key reference, tampered ciphertext, ...).
    HandlerFailed,
    /// The handler crashed.
    Internal,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::KeyUnavailable => "key_unavailable",
            ErrorCode::HandlerFailed => "handler_failed",
            ErrorCode::Internal => "internal",
            ErrorCode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key_ref() -> EncryptedSymmetricKeyRef {
        EncryptedSymmetricKeyRef {
            revision: 2,
            ephemeral_public_key: "epk".into(),
            nonce: "n".into(),
            ciphertext: "c".into(),
        }
    }

    #[test]
    fn request_frames_are_flat_objects() {
        let frame = Frame {
            id: 7,
            body: Request::Ping,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "id": 7, "type": "ping" })
        );

        let frame = Frame {
            id: 8,
            body: Request::from(DecryptRequest {
                ciphertext: "kw1:2:abc".into(),
                symmetric_key: key_ref(),
            }),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["id"], 8);
        assert_eq!(value["type"], "decrypt");
        assert_eq!(value["ciphertext"], "kw1:2:abc");
        assert_eq!(value["symmetric_key"]["revision"], 2);
    }

    #[test]
    fn decode_request_frame() {
        let line = r#"{"id":3,"type":"encrypt","value":{"a":[1,2]},"symmetric_key":{"revision":2,"ephemeral_public_key":"epk","nonce":"n","ciphertext":"c"}}"#;
        let frame: Frame<Request> = serde_json::from_str(line).unwrap();
        assert_eq!(frame.id, 3);
        match frame.body {
            Request::Encrypt(req) => {
                assert_eq!(req.value, json!({ "a": [1, 2] }));
                assert_eq!(req.symmetric_key, key_ref());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn ok_reply_without_data_decodes_as_null() {
        let frame: Frame<Response> = serde_json::from_str(r#"{"id":1,"type":"ok"}"#).unwrap();
        assert_eq!(frame.body, Response::ok(serde_json::Value::Null));
        serde_json::from_value::<<PingRequest as Message>::Reply>(serde_json::Value::Null)
            .unwrap();
    }

    #[test]
    fn error_reply_round_trip() {
        let frame = Frame {
            id: 4,
            body: Response::error(ErrorCode::HandlerFailed, "decryption failed"),
        };
        let line = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            line,
            r#"{"id":4,"type":"error","code":"handler_failed","message":"decryption failed"}"#
        );
        let back: Frame<Response> = serde_json::from_str(&line).unwrap();
        assert_eq!(back.body, frame.body);
    }

    #[test]
    fn unrecognized_error_code_is_tolerated() {
        let frame: Frame<Response> =
            serde_json::from_str(r#"{"id":1,"type":"error","code":"quota","message":"x"}"#)
                .unwrap();
        assert_eq!(frame.body, Response::error(ErrorCode::Unknown, "x"));
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        assert!(serde_json::from_str::<Frame<Request>>(r#"{"id":1,"type":"shutdown"}"#).is_err());
    }
}
