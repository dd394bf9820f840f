use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use serde::Deserialize;
use switchboard::{
    agent::ReplyRequest,
    models::message::Message,
    multiplexer::{self, ClientEvent, MuxReceiver},
};
use tokio_util::sync::CancellationToken;

use crate::error::{api_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ReplyBody {
    conversation_id: String,
    text: String,
}

/// Server sent events carrying one JSON encoded `ClientEvent` per frame.
/// Heartbeats become comment frames.
struct SseResponse {
    events: BoxStream<'static, ClientEvent>,
}

impl SseResponse {
    fn new(receiver: MuxReceiver) -> Self {
        Self {
            events: receiver.into_stream().boxed(),
        }
    }
}

fn encode(event: &ClientEvent) -> Bytes {
    if event.is_heartbeat() {
        return Bytes::from_static(b": keep-alive\n\n");
    }
    match serde_json::to_string(event) {
        Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
        Err(error) => {
            tracing::error!(error = %error, "failed to encode client event");
            Bytes::from_static(b": unencodable event\n\n")
        }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_next_unpin(cx)
            .map(|event| event.map(|event| Ok(encode(&event))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
            ],
            Body::from_stream(self),
        )
            .into_response()
    }
}

async fn reply_handler(
    State(state): State<AppState>,
    Json(body): Json<ReplyBody>,
) -> Result<SseResponse, ApiError> {
    if body.text.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "text must not be empty"));
    }

    // Dropping the response body cancels the turn
    let cancel = CancellationToken::new();
    let (sender, receiver) = multiplexer::channel(
        state.stream.capacity,
        state.stream.heartbeat_interval(),
        cancel.clone(),
    );
    let request = ReplyRequest::new(body.conversation_id, Message::user().with_text(body.text));
    let agent = state.agent.clone();

    tokio::spawn(async move {
        let outcome = agent.reply(request, sender, cancel).await;
        tracing::debug!(phase = %outcome.phase, messages = outcome.message_ids.len(), "reply finished");
    });

    Ok(SseResponse::new(receiver))
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(reply_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_state, parse_events, reply_request};
    use http_body_util::BodyExt;
    use switchboard::models::delta::Delta;
    use switchboard::providers::mock::MockResponse;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_reply_streams_events_until_done() {
        let (state, provider) = mock_state(vec![MockResponse::text("Hello there")]);
        let app = routes(state);

        let response = app.oneshot(reply_request("c1", "Hi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let events = parse_events(&body);
        assert_eq!(
            events.first(),
            Some(&ClientEvent::Delta {
                delta: Delta::text("Hello there")
            })
        );
        assert!(matches!(events.last(), Some(ClientEvent::Done { .. })));
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let (state, provider) = mock_state(vec![]);
        let app = routes(state);

        let response = app.oneshot(reply_request("c1", "   ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(provider.requests().is_empty());
    }

    #[test]
    fn test_heartbeat_is_a_comment_frame() {
        assert_eq!(encode(&ClientEvent::Heartbeat), Bytes::from_static(b": keep-alive\n\n"));
        let frame = encode(&ClientEvent::Cancelled);
        assert_eq!(frame, Bytes::from_static(b"data: {\"event\":\"cancelled\"}\n\n"));
    }
}
