//! Message types and utilities for the queuing system.
//!
//! A [`Message`] is the unit of data carried by queues and by the wire
//! protocol. Requests and replies are messages too: a request carries a
//! [`RequestType`] discriminant, a reply carries a [`Completion`] triple and a
//! correlation id referencing the request it answers.

use crate::types::{CompletionCode, Priority, SessionId, Timestamp};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new unique message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a message ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request type discriminant for messages that represent client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// Authenticate a session
    Login,
    /// Define a local queue
    DefineQueue,
    /// Delete a local queue
    DeleteQueue,
    /// Enqueue a message
    MessagePut,
    /// Dequeue a message
    MessageGet,
    /// Query queue metadata
    QueryQueue,
    /// Query server/manager metadata
    QueryServer,
    /// Peer manager state notification
    SysState,
    /// Stop the broker
    Shutdown,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Login => "Login",
            Self::DefineQueue => "DefineQueue",
            Self::DeleteQueue => "DeleteQueue",
            Self::MessagePut => "MessagePut",
            Self::MessageGet => "MessageGet",
            Self::QueryQueue => "QueryQueue",
            Self::QueryServer => "QueryServer",
            Self::SysState => "SysState",
            Self::Shutdown => "Shutdown",
        };
        write!(f, "{name}")
    }
}

/// Typed value stored in a message property bag or an ordered payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer
    I8(i8),
    /// 16-bit signed integer
    I16(i16),
    /// 32-bit signed integer
    I32(i32),
    /// 64-bit signed integer
    I64(i64),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// UTF-8 string
    Str(String),
    /// Raw byte sequence
    Bytes(Bytes),
    /// Structured object value
    Object(#[serde(with = "json_text")] serde_json::Value),
}

/// Serde adapter encoding a `serde_json::Value` as JSON text.
///
/// `Value`'s own `Deserialize` is self-describing (`deserialize_any`), which
/// non-self-describing formats such as bincode reject; routing through a
/// string keeps object values decodable on the wire and in backup files.
mod json_text {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &serde_json::Value, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

impl PropertyValue {
    /// Coerce to a signed integer, widening across the integer kinds.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Coerce to a float, accepting either float width.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Get the boolean value, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the byte sequence, if this holds bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

/// Typed property bag with get-with-default accessors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Properties(HashMap<String, PropertyValue>);

impl Properties {
    /// Create an empty property bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a raw property value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Remove a property.
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    /// Check whether a property is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of properties in the bag.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get a boolean property, falling back to `default`.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(PropertyValue::as_bool).unwrap_or(default)
    }

    /// Get an integer property (any width), falling back to `default`.
    #[must_use]
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(PropertyValue::as_i64).unwrap_or(default)
    }

    /// Get a float property (either width), falling back to `default`.
    #[must_use]
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(PropertyValue::as_f64).unwrap_or(default)
    }

    /// Get a string property, falling back to `default`.
    #[must_use]
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).and_then(PropertyValue::as_str).unwrap_or(default).to_string()
    }

    /// Get a byte-sequence property, falling back to an empty buffer.
    #[must_use]
    pub fn get_bytes(&self, key: &str) -> Bytes {
        self.get(key).and_then(PropertyValue::as_bytes).cloned().unwrap_or_default()
    }

    /// Extract the properties whose keys start with `prefix`, with the prefix
    /// stripped from the returned keys.
    ///
    /// Used for grouped property conventions such as `queue.<NAME>` queue
    /// lists and `session.<n>` session-id lists.
    #[must_use]
    pub fn subset(&self, prefix: &str) -> Vec<(String, PropertyValue)> {
        let mut entries: Vec<(String, PropertyValue)> = self
            .0
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix).map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }
}

/// Discriminant identifying the concrete payload kind, carried in wire and
/// backup headers so the payload can be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    /// No payload
    None,
    /// UTF-8 text
    Text,
    /// Raw bytes
    Data,
    /// Structured object
    Object,
    /// Ordered key-value map
    Map,
    /// Ordered primitive stream
    Stream,
}

/// Message payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Payload {
    /// No payload
    #[default]
    None,
    /// UTF-8 text payload
    Text(String),
    /// Raw byte payload
    Data(Bytes),
    /// Structured object payload
    Object(#[serde(with = "json_text")] serde_json::Value),
    /// Ordered key-value map payload
    Map(Vec<(String, PropertyValue)>),
    /// Ordered primitive read/write stream payload
    Stream(Vec<PropertyValue>),
}

impl Payload {
    /// Get the kind discriminant for this payload.
    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        match self {
            Self::None => PayloadKind::None,
            Self::Text(_) => PayloadKind::Text,
            Self::Data(_) => PayloadKind::Data,
            Self::Object(_) => PayloadKind::Object,
            Self::Map(_) => PayloadKind::Map,
            Self::Stream(_) => PayloadKind::Stream,
        }
    }

    /// Check whether there is no payload.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Completion triple attached to a message used as a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Outcome class
    pub code: CompletionCode,
    /// Numeric completion value (operation-specific)
    pub value: i64,
    /// Human-readable description
    pub description: String,
}

impl Completion {
    /// Create a new completion triple.
    #[must_use]
    pub fn new(code: CompletionCode, value: i64, description: impl Into<String>) -> Self {
        Self { code, value, description: description.into() }
    }

    /// Successful completion.
    #[must_use]
    pub fn ok(description: impl Into<String>) -> Self {
        Self::new(CompletionCode::Ok, 0, description)
    }

    /// Warning completion (completed without its primary effect).
    #[must_use]
    pub fn warn(description: impl Into<String>) -> Self {
        Self::new(CompletionCode::Warn, 0, description)
    }

    /// Failed completion.
    #[must_use]
    pub fn fail(description: impl Into<String>) -> Self {
        Self::new(CompletionCode::Fail, 0, description)
    }
}

/// Well-known property keys used by the request protocol.
pub mod keys {
    /// Authenticated user name (Login)
    pub const USER: &str = "user";
    /// Hashed password (Login)
    pub const PASSWORD: &str = "password";
    /// Session identifier, present on every reply
    pub const SESSION: &str = "sessionId";
    /// Target queue name
    pub const QUEUE: &str = "queueName";
    /// Queue capacity threshold (DefineQueue)
    pub const THRESHOLD: &str = "threshold";
    /// Force flag (DeleteQueue)
    pub const FORCE: &str = "force";
    /// Get timeout in milliseconds (MessageGet)
    pub const TIMEOUT_MS: &str = "timeoutMs";
    /// Get poll interval in milliseconds (MessageGet)
    pub const INTERVAL_MS: &str = "intervalMs";
    /// Prefix-match flag (QueryQueue/QueryServer)
    pub const PREFIX: &str = "prefix";
    /// Verbose output flag (QueryQueue/QueryServer)
    pub const VERBOSE: &str = "verbose";
    /// Raw property-subset output flag (QueryQueue/QueryServer)
    pub const RAW: &str = "raw";
    /// Originating queue manager name
    pub const MANAGER: &str = "manager";
    /// Sys-state action discriminant
    pub const ACTION: &str = "action";
    /// Number of messages discarded by a forced delete
    pub const DISCARDED: &str = "discarded";
    /// Prefix for `queue.<NAME> = threshold` queue-list entries
    pub const QUEUE_LIST_PREFIX: &str = "queue.";
    /// Prefix for `session.<n> = id` session-id list entries
    pub const SESSION_LIST_PREFIX: &str = "session.";

    /// Sys-state action values.
    pub mod actions {
        /// Peer manager activated; properties carry its queue list
        pub const ACTIVATED: &str = "activated";
        /// Peer manager deactivated; properties carry affected session ids
        pub const DEACTIVATED: &str = "deactivated";
        /// Peer defined a local queue
        pub const QUEUE_ADDED: &str = "queue-added";
        /// Peer deleted a local queue
        pub const QUEUE_REMOVED: &str = "queue-removed";
    }
}

/// Core message structure.
///
/// A message is exclusively owned by whichever container currently holds it
/// (socket buffer, queue lane, in-flight request); transfer of ownership is
/// by move. The priority is immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Correlation id: on a reply, the id of the request it answers
    pub correlation_id: Option<MessageId>,

    /// Request type for messages that represent requests
    pub request: Option<RequestType>,

    /// Priority, selects the queue lane (immutable)
    priority: Priority,

    /// Creation timestamp
    pub created_at: Timestamp,

    /// Expiration offset in milliseconds from creation; 0 means never
    pub expiration_ms: u64,

    /// Typed property bag
    pub properties: Properties,

    /// Message payload
    pub payload: Payload,

    /// Completion triple, attached when used as a reply
    pub completion: Option<Completion>,
}

impl Message {
    /// Create a new message with the given priority.
    #[must_use]
    pub fn new(priority: Priority) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: None,
            request: None,
            priority,
            created_at: Utc::now(),
            expiration_ms: 0,
            properties: Properties::new(),
            payload: Payload::None,
            completion: None,
        }
    }

    /// Create a request message of the given type at the lowest priority.
    #[must_use]
    pub fn request(request: RequestType) -> Self {
        let mut message = Self::new(Priority::MIN);
        message.request = Some(request);
        message
    }

    /// Create a message builder.
    #[must_use]
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Get the message priority.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Build a reply to the message identified by `id`, without needing the
    /// message itself.
    #[must_use]
    pub fn reply_to(id: MessageId, priority: Priority, completion: Completion) -> Self {
        let mut reply = Self::new(priority);
        reply.correlation_id = Some(id);
        reply.completion = Some(completion);
        reply
    }

    /// Build a reply to this message: same priority, correlation id set to
    /// this message's id.
    #[must_use]
    pub fn reply(&self, completion: Completion) -> Self {
        Self::reply_to(self.id, self.priority, completion)
    }

    /// Build a reply carrying the given session id property.
    #[must_use]
    pub fn reply_for_session(&self, session: SessionId, completion: Completion) -> Self {
        let mut reply = self.reply(completion);
        reply.properties.set(keys::SESSION, session.to_string());
        reply
    }

    /// Check whether the message has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        if self.expiration_ms == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= 0 && age.num_milliseconds() as u64 >= self.expiration_ms
    }

    /// Get the payload size estimate in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        match &self.payload {
            Payload::None => 0,
            Payload::Text(text) => text.len(),
            Payload::Data(bytes) => bytes.len(),
            Payload::Object(value) => value.to_string().len(),
            Payload::Map(entries) => entries.len() * std::mem::size_of::<PropertyValue>(),
            Payload::Stream(values) => values.len() * std::mem::size_of::<PropertyValue>(),
        }
    }
}

/// Builder for constructing messages with various options.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    priority: Option<u8>,
    request: Option<RequestType>,
    expiration_ms: u64,
    properties: Properties,
    payload: Payload,
}

impl MessageBuilder {
    /// Set the message priority (validated at build).
    #[must_use]
    pub const fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the request type.
    #[must_use]
    pub const fn request(mut self, request: RequestType) -> Self {
        self.request = Some(request);
        self
    }

    /// Set the expiration offset in milliseconds (0 = never).
    #[must_use]
    pub const fn expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = expiration_ms;
        self
    }

    /// Add a property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.set(key, value);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Build the message.
    ///
    /// # Errors
    /// Returns an error if the priority is out of range.
    pub fn build(self) -> crate::Result<Message> {
        let priority = Priority::new(self.priority.unwrap_or(0))?;
        let mut message = Message::new(priority);
        message.request = self.request;
        message.expiration_ms = self.expiration_ms;
        message.properties = self.properties;
        message.payload = self.payload;
        Ok(message)
    }
}
