//! QueryQueue and QueryServer: read-only views over the repository.
//!
//! A query arriving from a peer the repository believes inactive triggers a
//! self-healing sys-state activation after the reply is written: the peer is
//! evidently alive, so its proxy namespace is brought back.

use crate::manager::QueueManager;
use crate::processor::sys_state::SysStateProcessor;
use crate::processor::{disabled_reply, take_request, Processor, SessionContext};
use async_trait::async_trait;
use ferrumq_core::message::keys::{self, actions};
use ferrumq_core::{
    Completion, CompletionCode, Message, Payload, Properties, RequestType, Result,
};
use std::fmt::Write as _;
use tracing::info;

/// Serves QueryQueue and QueryServer requests.
pub struct QueryProcessor {
    request: Option<Message>,
    origin: Option<(String, Properties)>,
}

impl QueryProcessor {
    /// Create the processor for one query request.
    #[must_use]
    pub fn new(request: Message) -> Self {
        Self { request: Some(request), origin: None }
    }
}

#[async_trait]
impl Processor for QueryProcessor {
    async fn process(&mut self, ctx: &mut SessionContext) -> Result<Message> {
        let request = take_request(&mut self.request)?;
        if !ctx.config().enabled {
            return Ok(disabled_reply(ctx, &request));
        }

        // A peer identifying itself is remembered for the self-healing check.
        let origin = request.properties.get_str(keys::MANAGER, "");
        if !origin.is_empty() {
            self.origin = Some((origin, request.properties.clone()));
        }

        let pattern = request.properties.get_str(keys::QUEUE, "");
        let is_prefix = request.properties.get_bool(keys::PREFIX, pattern.is_empty());
        let verbose = request.properties.get_bool(keys::VERBOSE, false);
        let raw = request.properties.get_bool(keys::RAW, false);

        let results = ctx.repository.query_queues(&pattern, is_prefix, verbose);
        let count = i64::try_from(results.len()).unwrap_or(i64::MAX);
        let mut reply = request.reply_for_session(
            ctx.session_id,
            Completion::new(CompletionCode::Ok, count, format!("{count} queue(s)")),
        );

        if raw {
            for (name, description) in results {
                reply
                    .properties
                    .set(format!("{}{name}", keys::QUEUE_LIST_PREFIX), description);
            }
            return Ok(reply);
        }

        let mut text = String::new();
        if request.request == Some(RequestType::QueryServer) {
            let repository = &ctx.repository;
            let _ = writeln!(
                text,
                "manager {} active={} queues={} sessions={}",
                repository.manager_name(),
                repository.local().is_active(),
                repository.local().queue_count(),
                repository.sessions().len(),
            );
            reply.properties.set(keys::MANAGER, repository.manager_name().to_string());
        }
        for (name, description) in results {
            let _ = writeln!(text, "{name}: {description}");
        }
        reply.payload = Payload::Text(text);
        Ok(reply)
    }

    async fn postprocess(&mut self, ctx: &mut SessionContext) -> bool {
        let Some((peer, properties)) = self.origin.take() else {
            return true;
        };
        if !ctx.repository.is_peer_inactive(&peer) {
            return true;
        }

        // The peer just spoke to us, so it is alive: replay an activation
        // from the queue list its request carried.
        info!(peer = %peer, "self-healing activation of inactive peer");
        let mut synthetic = Message::request(RequestType::SysState);
        synthetic.properties.set(keys::MANAGER, peer);
        synthetic.properties.set(keys::ACTION, actions::ACTIVATED);
        for (key, value) in properties.subset(keys::QUEUE_LIST_PREFIX) {
            synthetic
                .properties
                .set(format!("{}{key}", keys::QUEUE_LIST_PREFIX), value);
        }
        let mut activation = SysStateProcessor::new(synthetic);
        // Failures stay local; the query reply is already on the wire.
        let _ = activation.process(ctx).await;
        true
    }
}
