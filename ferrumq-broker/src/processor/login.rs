//! Login: authenticates the session against the configured credential table.

use crate::processor::{disabled_reply, take_request, Processor, SessionContext};
use async_trait::async_trait;
use ferrumq_core::message::keys;
use ferrumq_core::{Completion, Message, Result};
use tracing::{info, warn};

/// Authenticates a session. A failed login ends the session.
pub struct LoginProcessor {
    request: Option<Message>,
    authenticated: bool,
}

impl LoginProcessor {
    /// Create the processor for one Login request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request), authenticated: false }
    }
}

#[async_trait]
impl Processor for LoginProcessor {
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message> {
        let request = take_request(&mut self.request)?;
        if !ctx.config().enabled {
            return Ok(disabled_reply(ctx, &request));
        }

        let user = request.properties.get_str(keys::USER, "");
        let password = request.properties.get_str(keys::PASSWORD, "");
        if user.is_empty() || password.is_empty() {
            return Ok(request
                .reply_for_session(ctx.session_id, Completion::fail("missing credentials")));
        }

        match ctx.config().credentials.get(&user) {
            Some(expected) if *expected == password => {
                info!(session = %ctx.session_id, "user {user} authenticated");
                ctx.user = Some(user.clone());
                self.authenticated = true;
                let mut reply = request
                    .reply_for_session(ctx.session_id, Completion::ok("authenticated"));
                reply.properties.set(keys::USER, user);
                Ok(reply)
            },
            // Unknown user and wrong password read the same from outside.
            _ => {
                warn!(session = %ctx.session_id, "authentication failed for {user}");
                Ok(request
                    .reply_for_session(ctx.session_id, Completion::fail("authentication failed")))
            },
        }
    }

    async fn postprocess(&mut self, _ctx: &mut SessionContext) -> bool {
        self.authenticated
    }
}
