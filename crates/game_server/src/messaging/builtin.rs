//! Handlers the server registers for itself.

use super::DispatchRegistry;
use crate::protocol::{ids, HeartbeatRequest, HeartbeatResponse};
use crate::utils::current_timestamp_ms;

/// Registers the heartbeat echo. Heartbeats need no authentication so that
/// clients can keep a connection alive before logging in.
pub fn register_builtin_handlers(dispatcher: &DispatchRegistry) {
    dispatcher.register_typed(ids::HEARTBEAT_REQUEST, false, |session, req: HeartbeatRequest| async move {
        let response = HeartbeatResponse {
            client_time: req.client_time,
            server_time: current_timestamp_ms() as i64,
        };
        // A full queue just means this heartbeat goes unanswered.
        let _ = session.send_message(ids::HEARTBEAT_RESPONSE, &response);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingConnection;
    use crate::health::ServerStats;
    use crate::messaging::DispatchOutcome;
    use crate::protocol::Frame;
    use crate::session::{Session, SessionId};
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_heartbeat_echoes_client_time() {
        let dispatcher = DispatchRegistry::new(Arc::new(ServerStats::new()));
        register_builtin_handlers(&dispatcher);
        assert_eq!(dispatcher.requires_auth(ids::HEARTBEAT_REQUEST), Some(false));

        let conn = RecordingConnection::new();
        let session = Arc::new(Session::new(SessionId(1), Uuid::new_v4(), conn.clone()));
        let frame = Frame::from_message(ids::HEARTBEAT_REQUEST, &HeartbeatRequest { client_time: 1234 });
        assert_eq!(dispatcher.dispatch(&session, frame).await, DispatchOutcome::Handled);

        let reply = conn.sent().pop().unwrap();
        assert_eq!(reply.message_id, ids::HEARTBEAT_RESPONSE);
        let response: HeartbeatResponse = reply.decode_payload().unwrap();
        assert_eq!(response.client_time, 1234);
        assert!(response.server_time > 0);
    }
}
