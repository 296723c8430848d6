//! Shutdown: administrative stop of the whole broker.

use crate::processor::{disabled_reply, take_request, Processor, SessionContext};
use async_trait::async_trait;
use ferrumq_core::{Completion, Message, Result};
use tracing::{info, warn};

/// Requests broker shutdown. Only the configured administrative user may.
pub struct ShutdownProcessor {
    request: Option<Message>,
    granted: bool,
}

impl ShutdownProcessor {
    /// Create the processor for one Shutdown request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request), granted: false }
    }
}

#[async_trait]
impl Processor for ShutdownProcessor {
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message> {
        let request = take_request(&mut self.request)?;
        if !ctx.config().enabled {
            return Ok(disabled_reply(ctx, &request));
        }

        if ctx.user.as_deref() != Some(ctx.config().admin_user.as_str()) {
            warn!(session = %ctx.session_id, "shutdown refused for non-administrative user");
            return Ok(request.reply_for_session(
                ctx.session_id,
                Completion::fail("shutdown requires the administrative user"),
            ));
        }

        info!(session = %ctx.session_id, "shutdown requested");
        self.granted = true;
        // Nobody listening means the broker is already going down.
        let _ = ctx.shutdown.send(());
        Ok(request.reply_for_session(ctx.session_id, Completion::ok("shutdown initiated")))
    }

    /// A granted shutdown also ends the requesting session.
    async fn postprocess(&mut self, _ctx: &mut SessionContext) -> bool {
        !self.granted
    }
}
