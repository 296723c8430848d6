//! MessagePut and MessageGet: the data path.
//!
//! Put never fails outright: a message that cannot reach its destination is
//! diverted to the dead-letter queue and the reply says so with a WARN.
//! Get distinguishes a missing queue (FAIL) from an empty lane (WARN).

use crate::manager::remote::EMBEDDED;
use crate::manager::PutOutcome;
use crate::processor::{disabled_reply, take_request, Processor, SessionContext};
use crate::queue::canonical_name;
use crate::wire;
use async_trait::async_trait;
use ferrumq_core::message::keys;
use ferrumq_core::{Completion, CompletionCode, Message, Result};
use tracing::debug;

/// Default poll interval for timed gets, in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: i64 = 50;

/// Strip the routing envelope off a put request, leaving the message to
/// store. Identity, priority, timestamps, and payload survive unchanged.
fn detach(request: &Message) -> Message {
    let mut stored = request.clone();
    stored.request = None;
    stored.correlation_id = None;
    stored.completion = None;
    stored.properties.remove(keys::QUEUE);
    stored.properties.remove(keys::SESSION);
    stored.properties.remove(EMBEDDED);
    stored
}

/// Enqueues a message, diverting to the dead-letter queue on any miss.
pub struct MessagePutProcessor {
    request: Option<Message>,
}

impl MessagePutProcessor {
    /// Create the processor for one MessagePut request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request) }
    }

    fn diverted_reply(
        ctx: &SessionContext,
        request: &Message,
        message: Message,
        reason: &str,
    ) -> Message {
        let description = if ctx.repository.divert_to_dead_letter(message) {
            format!("{reason}; diverted to dead-letter queue")
        } else {
            format!("{reason}; dead-letter queue unavailable, message lost")
        };
        request.reply_for_session(ctx.session_id, Completion::warn(description))
    }
}

#[async_trait]
impl Processor for MessagePutProcessor {
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message> {
        let request = take_request(&mut self.request)?;
        if !ctx.config().enabled {
            return Ok(disabled_reply(ctx, &request));
        }

        // Forwarded puts carry the stored message whole in the payload;
        // direct puts are stripped of their routing envelope.
        let stored = if request.properties.get_bool(EMBEDDED, false) {
            wire::extract_message(&request)?
        } else {
            detach(&request)
        };

        let name = canonical_name(&request.properties.get_str(keys::QUEUE, ""));
        if name.is_empty() {
            return Ok(Self::diverted_reply(ctx, &request, stored, "missing queue name"));
        }

        let Some(handle) = ctx.repository.get_queue(&name) else {
            return Ok(Self::diverted_reply(
                ctx,
                &request,
                stored,
                &format!("queue {name} not found"),
            ));
        };

        match handle.put(stored).await {
            PutOutcome::Delivered => {
                handle.touch(ctx.acting_user(), "put");
                debug!(queue = %name, "message delivered");
                Ok(request.reply_for_session(
                    ctx.session_id,
                    Completion::ok(format!("message delivered to {name}")),
                ))
            },
            PutOutcome::Rejected(message) => Ok(Self::diverted_reply(
                ctx,
                &request,
                message,
                &format!("queue {name} rejected the message"),
            )),
            PutOutcome::Unreachable(message) => Ok(Self::diverted_reply(
                ctx,
                &request,
                message,
                &format!("queue {name} unreachable"),
            )),
        }
    }
}

/// Dequeues from the lane matching the request's own priority.
pub struct MessageGetProcessor {
    request: Option<Message>,
}

impl MessageGetProcessor {
    /// Create the processor for one MessageGet request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request) }
    }
}

#[async_trait]
impl Processor for MessageGetProcessor {
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message> {
        let request = take_request(&mut self.request)?;
        if !ctx.config().enabled {
            return Ok(disabled_reply(ctx, &request));
        }

        let name = canonical_name(&request.properties.get_str(keys::QUEUE, ""));
        if name.is_empty() {
            return Ok(request
                .reply_for_session(ctx.session_id, Completion::fail("queue name required")));
        }

        let Some(handle) = ctx.repository.get_queue(&name) else {
            return Ok(request.reply_for_session(
                ctx.session_id,
                Completion::fail(format!("queue {name} not found")),
            ));
        };

        let timeout_ms =
            u64::try_from(request.properties.get_i64(keys::TIMEOUT_MS, 0)).unwrap_or(0);
        let interval_ms = u64::try_from(
            request.properties.get_i64(keys::INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS),
        )
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS as u64)
        .max(1);

        // The request's own priority selects the lane.
        match handle.get_timed(request.priority(), timeout_ms, interval_ms).await {
            Ok(Some(message)) => {
                handle.touch(ctx.acting_user(), "get");
                let mut reply = request.reply_for_session(
                    ctx.session_id,
                    Completion::new(CompletionCode::Ok, 1, "message retrieved"),
                );
                reply.properties.set(EMBEDDED, true);
                wire::embed_message(&mut reply, &message)?;
                Ok(reply)
            },
            // An empty lane is an outcome, not an error.
            Ok(None) => Ok(request.reply_for_session(
                ctx.session_id,
                Completion::warn(format!("no message available within {timeout_ms}ms")),
            )),
            Err(e) => Ok(request
                .reply_for_session(ctx.session_id, Completion::fail(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::{completion, test_context};
    use ferrumq_core::{Payload, RequestType};
    use tempfile::TempDir;

    fn put_request(queue: &str, priority: u8, text: &str) -> Message {
        let mut request = Message::builder()
            .priority(priority)
            .request(RequestType::MessagePut)
            .property(keys::QUEUE, queue)
            .build()
            .unwrap();
        request.payload = Payload::Text(text.to_string());
        request
    }

    fn get_request(queue: &str, priority: u8) -> Message {
        Message::builder()
            .priority(priority)
            .request(RequestType::MessageGet)
            .property(keys::QUEUE, queue)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_preserves_message() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;
        ctx.repository.define_local_queue("WORK", 10).unwrap();

        let request = put_request("WORK", 4, "payload");
        let stored_id = request.id;
        let reply =
            MessagePutProcessor::new(request).process(&mut ctx).await.unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Ok);

        let reply =
            MessageGetProcessor::new(get_request("WORK", 4)).process(&mut ctx).await.unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Ok);
        let message = wire::extract_message(&reply).unwrap();
        assert_eq!(message.id, stored_id);
        assert_eq!(message.priority().value(), 4);
        assert_eq!(message.payload, Payload::Text("payload".to_string()));
        // The routing envelope does not travel with the stored message.
        assert!(!message.properties.contains(keys::QUEUE));
    }

    #[tokio::test]
    async fn test_put_to_missing_queue_diverts() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;

        let reply = MessagePutProcessor::new(put_request("NOWHERE", 0, "lost?"))
            .process(&mut ctx)
            .await
            .unwrap();

        assert_eq!(completion(&reply).code, CompletionCode::Warn);
        assert!(completion(&reply).description.contains("diverted"));
        let dlq = ctx.repository.dead_letter_queue().unwrap();
        assert_eq!(dlq.size(), 1);
    }

    #[tokio::test]
    async fn test_put_to_full_queue_diverts() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;
        ctx.repository.define_local_queue("TINY", 1).unwrap();

        let first = MessagePutProcessor::new(put_request("TINY", 0, "fits"))
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(completion(&first).code, CompletionCode::Ok);

        let second = MessagePutProcessor::new(put_request("TINY", 0, "overflow"))
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(completion(&second).code, CompletionCode::Warn);
        assert_eq!(ctx.repository.dead_letter_queue().unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_get_from_empty_lane_warns() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;
        ctx.repository.define_local_queue("WORK", 10).unwrap();

        let reply =
            MessageGetProcessor::new(get_request("WORK", 0)).process(&mut ctx).await.unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Warn);
    }

    #[tokio::test]
    async fn test_get_wrong_lane_leaves_message() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;
        ctx.repository.define_local_queue("WORK", 10).unwrap();

        MessagePutProcessor::new(put_request("WORK", 7, "high"))
            .process(&mut ctx)
            .await
            .unwrap();

        // Lane 3 is empty even though lane 7 holds a message.
        let reply =
            MessageGetProcessor::new(get_request("WORK", 3)).process(&mut ctx).await.unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Warn);
        assert_eq!(ctx.repository.local().queue("WORK").unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_queue_fails() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;

        let reply = MessageGetProcessor::new(get_request("NOWHERE", 0))
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Fail);
    }

    #[tokio::test]
    async fn test_embedded_put_stores_carried_message() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;
        ctx.repository.define_local_queue("RELAY", 10).unwrap();

        let mut original = Message::builder().priority(6).build().unwrap();
        original.payload = Payload::Text("forwarded".to_string());
        let original_id = original.id;

        let mut request = Message::builder()
            .priority(6)
            .request(RequestType::MessagePut)
            .property(keys::QUEUE, "RELAY")
            .property(EMBEDDED, true)
            .build()
            .unwrap();
        wire::embed_message(&mut request, &original).unwrap();

        let reply =
            MessagePutProcessor::new(request).process(&mut ctx).await.unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Ok);

        let queue = ctx.repository.local().queue("RELAY").unwrap();
        let stored = queue.get(ferrumq_core::Priority::new(6).unwrap()).unwrap();
        assert_eq!(stored.id, original_id);
        assert_eq!(stored.payload, Payload::Text("forwarded".to_string()));
    }
}
