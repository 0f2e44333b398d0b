//! Request handling seam shared by services and connection workers.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::{Action, Message, RequestError};
use tracing::debug;

/// Business logic behind a listening socket or a long-lived channel.
///
/// Implementations return either a response envelope or a `RequestError`;
/// the caller turns the latter into a failure response and copies the
/// request's `messageID` onto whatever is sent back.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Message, peer: SocketAddr) -> Result<Message, RequestError>;
}

/// Handler for channels that only carry outbound requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefuseRequests;

#[async_trait]
impl RequestHandler for RefuseRequests {
    async fn handle(&self, request: Message, _peer: SocketAddr) -> Result<Message, RequestError> {
        Err(RequestError::bad_request(format!(
            "Unknown request action: {}",
            request.action_name().unwrap_or_default()
        )))
    }
}

/// Answer one inbound frame.
///
/// `testConnection` is answered here so every endpoint supports it, and
/// frames that are not requests get a protocol error.
pub async fn dispatch(
    handler: &Arc<dyn RequestHandler>,
    request: Message,
    peer: SocketAddr,
) -> Message {
    let id = request.message_id();
    if !request.is_request() {
        let err = RequestError::bad_request("Malformed JSON request: expected a request");
        return Message::error(&err).with_message_id(id);
    }

    let response = match request.action() {
        Ok(Action::TestConnection) => Ok(Message::ok()),
        Ok(action) => {
            debug!(%action, %peer, "dispatching request");
            handler.handle(request, peer).await
        }
        Err(e) => Err(e),
    };

    response
        .unwrap_or_else(|e| Message::error(&e))
        .with_message_id(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(
            &self,
            request: Message,
            _peer: SocketAddr,
        ) -> Result<Message, RequestError> {
            Ok(Message::ok().with("message", request.string_field("message")?))
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connection_bypasses_handler() {
        let handler: Arc<dyn RequestHandler> = Arc::new(RefuseRequests);
        let request = Message::request(Action::TestConnection).with_message_id(Some(3));
        let response = dispatch(&handler, request, peer()).await;
        assert!(response.is_success());
        assert_eq!(response.message_id(), Some(3));
    }

    #[tokio::test]
    async fn handler_errors_become_responses() {
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        let request = Message::from_value(json!({"action": "process", "messageID": 9})).unwrap();
        let response = dispatch(&handler, request, peer()).await;
        assert_eq!(response.status(), 400);
        assert_eq!(response.message_id(), Some(9));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        let request = Message::from_value(json!({"action": "dance"})).unwrap();
        let response = dispatch(&handler, request, peer()).await;
        assert_eq!(response.status(), 400);
        assert!(response.response_text().unwrap().contains("dance"));
    }

    #[tokio::test]
    async fn responses_are_not_requests() {
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        let response = dispatch(&handler, Message::ok(), peer()).await;
        assert_eq!(response.status(), 400);
    }
}
