//! SysState: topology notifications exchanged between brokers.

use crate::processor::{disabled_reply, take_request, Processor, SessionContext};
use async_trait::async_trait;
use ferrumq_core::message::keys::{self, actions};
use ferrumq_core::{Completion, Message, Result};
use tracing::info;

/// Applies a peer's sys-state notification to the repository.
pub struct SysStateProcessor {
    request: Option<Message>,
}

impl SysStateProcessor {
    /// Create the processor for one SysState request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request) }
    }
}

#[async_trait]
impl Processor for SysStateProcessor {
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message> {
        let request = take_request(&mut self.request)?;
        if !ctx.config().enabled {
            return Ok(disabled_reply(ctx, &request));
        }

        let manager = request.properties.get_str(keys::MANAGER, "");
        if manager.is_empty() {
            return Ok(request
                .reply_for_session(ctx.session_id, Completion::fail("manager name required")));
        }
        let action = request.properties.get_str(keys::ACTION, "");

        match ctx.repository.handle_sys_state(&manager, &action, &request.properties).await {
            Ok(()) => {
                info!(peer = %manager, "applied sys-state {action}");
                let mut reply = request.reply_for_session(
                    ctx.session_id,
                    Completion::ok(format!("sys-state {action} applied")),
                );
                // Activation is mutual: the reply advertises our own queue
                // list so the peer can mirror us in the same exchange.
                if action == actions::ACTIVATED {
                    reply
                        .properties
                        .set(keys::MANAGER, ctx.repository.manager_name().to_string());
                    for (key, value) in ctx.repository.local_queue_properties().iter() {
                        reply.properties.set(key.clone(), value.clone());
                    }
                }
                Ok(reply)
            },
            Err(e) => Ok(request
                .reply_for_session(ctx.session_id, Completion::fail(e.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::{completion, test_config, test_context_with};
    use ferrumq_core::{CompletionCode, RequestType};
    use tempfile::TempDir;

    fn sys_state(manager: &str, action: &str) -> Message {
        let mut request = Message::request(RequestType::SysState);
        request.properties.set(keys::MANAGER, manager);
        request.properties.set(keys::ACTION, action);
        request
    }

    #[tokio::test]
    async fn test_activation_reply_carries_local_queue_list() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.peers.insert("QMGR2".to_string(), "127.0.0.1:7475".to_string());
        let mut ctx = test_context_with(config).await;
        ctx.repository.define_local_queue("ORDERS", 77).unwrap();

        let mut request = sys_state("QMGR2", actions::ACTIVATED);
        request.properties.set("queue.THEIRS", 10i64);

        let reply =
            SysStateProcessor::new(request).process(&mut ctx).await.unwrap();

        assert_eq!(completion(&reply).code, CompletionCode::Ok);
        assert_eq!(reply.properties.get_str(keys::MANAGER, ""), "QMGR1");
        assert_eq!(reply.properties.get_i64("queue.ORDERS", 0), 77);

        // The peer's queue list became our proxy set.
        assert!(!ctx.repository.is_peer_inactive("QMGR2"));
        assert!(ctx.repository.get_queue("THEIRS").is_some());
    }

    #[tokio::test]
    async fn test_unknown_peer_fails() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context_with(test_config(&dir)).await;

        let reply = SysStateProcessor::new(sys_state("GHOST", actions::ACTIVATED))
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Fail);
    }

    #[tokio::test]
    async fn test_missing_manager_fails() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context_with(test_config(&dir)).await;

        let reply = SysStateProcessor::new(Message::request(RequestType::SysState))
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(completion(&reply).code, CompletionCode::Fail);
        assert_eq!(completion(&reply).description, "manager name required");
    }
}
