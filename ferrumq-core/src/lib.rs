//! # FerrumQ Core
//!
//! Core message model and shared types for the FerrumQ message-queuing
//! broker.
//!
//! FerrumQ is a federated point-to-point queuing system: clients connect to a
//! broker ("queue manager"), define and delete named queues, and put/get
//! prioritized messages; multiple brokers cooperate to present one federated
//! namespace of queues.
//!
//! This crate holds the pieces shared between the broker and any client-side
//! tooling:
//!
//! - [`message`]: the [`Message`] data model — ids, priorities, typed
//!   property bags, payload variants, completion triples, request types
//! - [`types`]: priority, queue/session id, and timestamp newtypes
//! - [`error`]: the common [`Error`] type and [`Result`] alias

pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{
    Completion, Message, MessageBuilder, MessageId, Payload, PayloadKind, Properties,
    PropertyValue, RequestType,
};
pub use types::{CompletionCode, Priority, QueueId, SessionId, Timestamp};

/// Common imports for convenient usage.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::message::{
        keys, Completion, Message, MessageBuilder, MessageId, Payload, Properties, PropertyValue,
        RequestType,
    };
    pub use crate::types::{CompletionCode, Priority, QueueId, SessionId, Timestamp};
}
