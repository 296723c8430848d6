//! FerrumQ broker: priority-ordered persistent queues behind a small
//! request protocol, federated across peer brokers.
//!
//! The [`repository::Repository`] unifies the local
//! [`manager::LocalManager`] with one [`manager::RemoteManager`] proxy per
//! configured peer. Clients speak the length-prefixed [`wire`] protocol to
//! the [`server::Server`], which runs one [`session::Session`] per
//! connection and dispatches each request to a [`processor::Processor`].

pub mod config;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod repository;
pub mod server;
pub mod session;
pub mod storage;
pub mod wire;

pub use config::BrokerConfig;
pub use queue::Queue;
pub use repository::Repository;
pub use server::Server;
