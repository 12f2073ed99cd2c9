//! Development login handler.

use game_server::error::HandlerError;
use game_server::protocol::{ids, LoginRequest, LoginResponse};
use game_server::GameServer;
use tracing::{info, warn};

/// Registers a login handler for [`ids::LOGIN_REQUEST`] that trusts the
/// user id in the request. The token is ignored.
///
/// An empty user id is rejected with a 400 error response.
pub fn register_dev_login(server: &GameServer) {
    let registry = server.registry();
    server
        .dispatcher()
        .register_typed(ids::LOGIN_REQUEST, false, move |session, req: LoginRequest| {
            let registry = registry.clone();
            async move {
                let user_id = req.user_id.trim().to_string();
                if user_id.is_empty() {
                    return Err(HandlerError::Rejected("user_id must not be empty".into()));
                }

                let success = registry.bind_user(session.id(), &user_id).await;
                let response = LoginResponse {
                    success,
                    message: if success { "welcome" } else { "session expired" }.to_string(),
                    user_id,
                    session_id: session.id().0,
                };
                session
                    .send_message(ids::LOGIN_RESPONSE, &response)
                    .map_err(|e| HandlerError::Internal(e.to_string()))?;
                info!("🎫 Dev login: session {} is now {}", session.id(), response.user_id);
                Ok(())
            }
        });
    warn!("🔓 Development login enabled: any non-empty user id is accepted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use game_server::config::{StoreBackendKind, StoreConfig};
    use game_server::protocol::{error_codes, ErrorResponse, Frame, FrameCodec};
    use game_server::ServerConfig;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    async fn login(framed: &mut Framed<TcpStream, FrameCodec>, user_id: &str) -> Frame {
        let request = LoginRequest {
            user_id: user_id.to_string(),
            token: "ignored".to_string(),
        };
        framed
            .send(Frame::from_message(ids::LOGIN_REQUEST, &request))
            .await
            .unwrap();
        framed.next().await.unwrap().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dev_login_binds_user() {
        let server = GameServer::new(ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            store: StoreConfig {
                backend: StoreBackendKind::None,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        register_dev_login(&server);
        let addr = server.start().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::default());

        let reply = login(&mut framed, "  ").await;
        assert_eq!(reply.message_id, ids::ERROR_RESPONSE);
        let error: ErrorResponse = reply.decode_payload().unwrap();
        assert_eq!(error.code, error_codes::BAD_REQUEST);

        let reply = login(&mut framed, " player-1 ").await;
        assert_eq!(reply.message_id, ids::LOGIN_RESPONSE);
        let response: LoginResponse = reply.decode_payload().unwrap();
        assert!(response.success);
        assert_eq!(response.user_id, "player-1");

        let session = server.registry().get_session_by_user("player-1").unwrap();
        assert!(session.is_authenticated());
        assert_eq!(session.id().0, response.session_id);

        server.shutdown().await;
    }
}
