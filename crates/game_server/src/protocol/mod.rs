//! Client wire protocol: framing and engine-level payloads.

pub mod codec;
pub mod messages;

pub use codec::{Frame, FrameCodec, MessageId, HEADER_LEN, LENGTH_FIELD_LEN, MAX_FRAME_BYTES};
pub use messages::{
    error_codes, ids, ErrorResponse, HeartbeatRequest, HeartbeatResponse, KickNotice,
    LoginRequest, LoginResponse,
};
