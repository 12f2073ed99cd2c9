//! Protobuf payloads and message ids owned by the engine.
//!
//! Business modules are free to use any id outside the reserved ranges
//! below. The types are declared with `prost` derives directly so no build
//! step is needed.

use super::codec::MessageId;
use prost::Message;

/// Message ids reserved by the engine.
pub mod ids {
    use super::MessageId;

    pub const HEARTBEAT_REQUEST: MessageId = 1001;
    pub const HEARTBEAT_RESPONSE: MessageId = 1002;
    /// Sent to a session just before it is evicted by a newer login.
    pub const KICK_NOTICE: MessageId = 1003;
    pub const LOGIN_REQUEST: MessageId = 2001;
    pub const LOGIN_RESPONSE: MessageId = 2002;
    pub const ERROR_RESPONSE: MessageId = 9999;
}

/// Status codes carried by [`ErrorResponse`].
pub mod error_codes {
    pub const BAD_REQUEST: i32 = 400;
    pub const AUTH_REQUIRED: i32 = 401;
    pub const HANDLER_FAILED: i32 = 500;
    pub const SHUTTING_DOWN: i32 = 503;
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatRequest {
    #[prost(int64, tag = "1")]
    pub client_time: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatResponse {
    #[prost(int64, tag = "1")]
    pub client_time: i64,
    #[prost(int64, tag = "2")]
    pub server_time: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct KickNotice {
    #[prost(string, tag = "1")]
    pub reason: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct LoginRequest {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub token: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct LoginResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub user_id: String,
    #[prost(uint64, tag = "3")]
    pub session_id: u64,
    #[prost(string, tag = "4")]
    pub message: String,
}

/// Structured failure returned to the client instead of a silent drop.
#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint32, tag = "3")]
    pub request_message_id: u32,
}

impl ErrorResponse {
    pub fn new(code: i32, message: impl Into<String>, request_message_id: MessageId) -> Self {
        Self {
            code,
            message: message.into(),
            request_message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    #[test]
    fn test_error_response_survives_framing() {
        let response = ErrorResponse::new(error_codes::AUTH_REQUIRED, "login first", 3001);
        let frame = Frame::from_message(ids::ERROR_RESPONSE, &response);
        let decoded: ErrorResponse = frame.decode_payload().expect("decode");
        assert_eq!(decoded, response);
        assert_eq!(frame.message_id, ids::ERROR_RESPONSE);
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        let frame = Frame::new(ids::LOGIN_REQUEST, vec![0xFF, 0xFF, 0xFF]);
        assert!(frame.decode_payload::<LoginRequest>().is_err());
    }
}
