//! Request processors: one per request type, dispatched by the session loop.
//!
//! A processor is created for exactly one request, runs [`Processor::process`]
//! to produce the reply, and then [`Processor::postprocess`] after the reply
//! has been written. Processing never raises an error across the session
//! boundary: any failure becomes a FAIL reply carrying the error text.

mod login;
mod messages;
mod queues;
mod query;
mod shutdown;
mod sys_state;

use crate::config::BrokerConfig;
use crate::repository::Repository;
use crate::wire;
use async_trait::async_trait;
use ferrumq_core::message::keys;
use ferrumq_core::{Completion, Error, Message, MessageId, Priority, RequestType, Result, SessionId};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::broadcast;
use tracing::warn;

pub use login::LoginProcessor;
pub use messages::{MessageGetProcessor, MessagePutProcessor};
pub use queues::{DefineQueueProcessor, DeleteQueueProcessor};
pub use query::QueryProcessor;
pub use shutdown::ShutdownProcessor;
pub use sys_state::SysStateProcessor;

/// Per-session state shared with every processor the session dispatches.
pub struct SessionContext {
    /// Id of the owning session, stamped on every reply.
    pub session_id: SessionId,
    /// Authenticated user, set by a successful Login.
    pub user: Option<String>,
    /// The queue repository.
    pub repository: Arc<Repository>,
    /// Broadcast channel used to request broker shutdown.
    pub shutdown: broadcast::Sender<()>,
}

impl SessionContext {
    /// Create the context for one session.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        repository: Arc<Repository>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self { session_id, user: None, repository, shutdown }
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        self.repository.config()
    }

    /// Name to record on queue accesses for this session.
    #[must_use]
    pub fn acting_user(&self) -> &str {
        self.user.as_deref().unwrap_or("anonymous")
    }
}

/// One request's lifecycle.
#[async_trait]
pub trait Processor: Send {
    /// Consume the request and produce the reply.
    ///
    /// # Errors
    /// Returns an error when the request cannot be processed at all; the
    /// dispatcher converts it into a FAIL reply.
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message>;

    /// Run after the reply has been written. Returns `false` to end the
    /// session.
    async fn postprocess(&mut self, _ctx: &mut SessionContext) -> bool {
        true
    }
}

/// Take the request out of a processor's slot, enforcing single use.
pub(crate) fn take_request(slot: &mut Option<Message>) -> Result<Message> {
    slot.take().ok_or_else(|| Error::Internal {
        message: "processor already consumed its request".to_string(),
    })
}

/// Build the processor for a request, or `None` when the message carries no
/// request type.
#[must_use]
pub fn build(request: Message) -> Option<Box<dyn Processor>> {
    let kind = request.request?;
    let processor: Box<dyn Processor> = match kind {
        RequestType::Login => Box::new(LoginProcessor::new(request)),
        RequestType::DefineQueue => Box::new(DefineQueueProcessor::new(request)),
        RequestType::DeleteQueue => Box::new(DeleteQueueProcessor::new(request)),
        RequestType::MessagePut => Box::new(MessagePutProcessor::new(request)),
        RequestType::MessageGet => Box::new(MessageGetProcessor::new(request)),
        RequestType::QueryQueue | RequestType::QueryServer => {
            Box::new(QueryProcessor::new(request))
        },
        RequestType::SysState => Box::new(SysStateProcessor::new(request)),
        RequestType::Shutdown => Box::new(ShutdownProcessor::new(request)),
    };
    Some(processor)
}

/// Dispatch one request: build its processor, write the reply, run the
/// postprocessing step.
///
/// Returns `Ok(false)` when the session should end.
///
/// # Errors
/// Returns an error only when the reply cannot be written; processing
/// failures are folded into FAIL replies.
pub async fn handle_request<S>(
    ctx: &mut SessionContext,
    request: Message,
    stream: &mut S,
) -> Result<bool>
where
    S: AsyncWrite + Unpin + Send,
{
    // All a FAIL reply needs from the request; cheaper than cloning the
    // whole message, payload included.
    let request_id = request.id;
    let priority = request.priority();

    let Some(mut processor) = build(request) else {
        let reply = fail_reply(ctx, request_id, priority, "message carries no request");
        wire::write_message(stream, &reply).await?;
        return Ok(true);
    };

    let reply = match processor.process(ctx).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(session = %ctx.session_id, "request failed: {e}");
            fail_reply(ctx, request_id, priority, e.to_string())
        },
    };
    wire::write_message(stream, &reply).await?;

    Ok(processor.postprocess(ctx).await)
}

fn fail_reply(
    ctx: &SessionContext,
    request_id: MessageId,
    priority: Priority,
    description: impl Into<String>,
) -> Message {
    let mut reply = Message::reply_to(request_id, priority, Completion::fail(description));
    reply.properties.set(keys::SESSION, ctx.session_id.to_string());
    reply
}

/// FAIL reply used when the broker is administratively disabled.
pub(crate) fn disabled_reply(ctx: &SessionContext, request: &Message) -> Message {
    request.reply_for_session(ctx.session_id, Completion::fail("server disabled"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::session::SessionRegistry;
    use tempfile::TempDir;

    pub fn test_config(dir: &TempDir) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.storage.backup_dir = dir.path().to_path_buf();
        config.credentials.insert("admin".to_string(), "s3cret".to_string());
        config.credentials.insert("app".to_string(), "app-pass".to_string());
        config
    }

    /// Build an active repository and session context over a temp directory,
    /// without any sockets.
    pub async fn test_context(dir: &TempDir) -> SessionContext {
        test_context_with(test_config(dir)).await
    }

    pub async fn test_context_with(config: BrokerConfig) -> SessionContext {
        let repository =
            Arc::new(Repository::new(Arc::new(config), Arc::new(SessionRegistry::new())));
        repository.activate().await.unwrap();
        let (shutdown, _) = broadcast::channel(1);
        SessionContext::new(SessionId::new(), repository, shutdown)
    }

    pub fn completion(reply: &Message) -> &Completion {
        reply.completion.as_ref().expect("reply carries a completion")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{completion, test_context};
    use super::*;
    use ferrumq_core::{CompletionCode, Priority};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_non_request_message_gets_fail_reply() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;

        let message = Message::new(Priority::MIN);
        let request_id = message.id;
        let mut buffer = Vec::new();
        let keep_going = handle_request(&mut ctx, message, &mut buffer).await.unwrap();
        assert!(keep_going);

        let mut cursor = std::io::Cursor::new(buffer);
        let reply = wire::read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, Some(request_id));
        assert_eq!(completion(&reply).code, CompletionCode::Fail);
        assert_eq!(
            reply.properties.get_str(keys::SESSION, ""),
            ctx.session_id.to_string()
        );
    }

    #[tokio::test]
    async fn test_processing_error_becomes_fail_reply() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;

        // MessageGet without a queue name fails inside the processor.
        let request = Message::request(RequestType::MessageGet);
        let mut buffer = Vec::new();
        let keep_going = handle_request(&mut ctx, request, &mut buffer).await.unwrap();
        assert!(keep_going);

        let mut cursor = std::io::Cursor::new(buffer);
        let reply = wire::read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Fail);
    }

    #[tokio::test]
    async fn test_reply_carries_session_id() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;

        let request = Message::request(RequestType::QueryServer);
        let mut buffer = Vec::new();
        handle_request(&mut ctx, request, &mut buffer).await.unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let reply = wire::read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(
            reply.properties.get_str(ferrumq_core::message::keys::SESSION, ""),
            ctx.session_id.to_string()
        );
    }

    #[tokio::test]
    async fn test_processor_consumes_request_once() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir).await;

        let mut processor = QueryProcessor::new(Message::request(RequestType::QueryQueue));
        assert!(processor.process(&mut ctx).await.is_ok());
        assert!(processor.process(&mut ctx).await.is_err());
    }
}
