//! DefineQueue and DeleteQueue: local queue lifecycle, with peer
//! notification after the reply is written.

use crate::processor::{disabled_reply, take_request, Processor, SessionContext};
use crate::queue::canonical_name;
use async_trait::async_trait;
use ferrumq_core::message::keys;
use ferrumq_core::{Completion, CompletionCode, Message, Result};
use tracing::info;

/// Defines a local queue and notifies peers of the addition.
pub struct DefineQueueProcessor {
    request: Option<Message>,
    defined: Option<String>,
}

impl DefineQueueProcessor {
    /// Create the processor for one DefineQueue request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request), defined: None }
    }
}

#[async_trait]
impl Processor for DefineQueueProcessor {
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

        let default = i64::try_from(ctx.config().default_threshold).unwrap_or(i64::MAX);
        let threshold = request.properties.get_i64(keys::THRESHOLD, default);
        if threshold <= 0 {
            return Ok(request.reply_for_session(
                ctx.session_id,
                Completion::fail(format!("invalid threshold {threshold}")),
            ));
        }
        let threshold = usize::try_from(threshold).unwrap_or(usize::MAX);

        match ctx.repository.define_local_queue(&name, threshold) {
            Some(queue) => {
                queue.touch(ctx.acting_user(), "define");
                self.defined = Some(name.clone());
                Ok(request.reply_for_session(
                    ctx.session_id,
                    Completion::ok(format!("queue {name} defined")),
                ))
            },
            // Duplicate define is soft: the existing queue is untouched.
            None => Ok(request.reply_for_session(
                ctx.session_id,
                Completion::fail(format!("queue {name} already exists")),
            )),
        }
    }

    async fn postprocess(&mut self, ctx: &mut SessionContext) -> bool {
        if let Some(name) = self.defined.take() {
            ctx.repository.notify_peers(&name, true).await;
        }
        true
    }
}

/// Deletes a local queue and notifies peers of the removal.
pub struct DeleteQueueProcessor {
    request: Option<Message>,
    deleted: Option<String>,
}

impl DeleteQueueProcessor {
    /// Create the processor for one DeleteQueue request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request), deleted: None }
    }
}

#[async_trait]
impl Processor for DeleteQueueProcessor {
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

        let Some(queue) = ctx.repository.local().queue(&name) else {
            return Ok(request.reply_for_session(
                ctx.session_id,
                Completion::fail(format!("queue {name} not found")),
            ));
        };

        let force = request.properties.get_bool(keys::FORCE, false);
        if !queue.is_empty() && !force {
            return Ok(request.reply_for_session(
                ctx.session_id,
                Completion::fail(format!("queue {name} not empty")),
            ));
        }

        ctx.repository.delete_local_queue(&name);
        let discarded = queue.clear();
        self.deleted = Some(name.clone());
        if discarded > 0 {
            info!(queue = %name, "forced delete discarded {discarded} messages");
        }

        let discarded = i64::try_from(discarded).unwrap_or(i64::MAX);
        let mut reply = request.reply_for_session(
            ctx.session_id,
            Completion::new(
                CompletionCode::Ok,
                discarded,
                format!("queue {name} deleted"),
            ),
        );
        reply.properties.set(keys::DISCARDED, discarded);
        Ok(reply)
    }

    async fn postprocess(&mut self, ctx: &mut SessionContext) -> bool {
        if let Some(name) = self.deleted.take() {
            ctx.repository.notify_peers(&name, false).await;
        }
        true
    }
}
