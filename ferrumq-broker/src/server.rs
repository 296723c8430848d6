//! The TCP front end: accepts connections and runs one session per client.

use crate::config::BrokerConfig;
use crate::processor::SessionContext;
use crate::repository::Repository;
use crate::session::Session;
use ferrumq_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

/// Accepts client connections and spawns a [`Session`] for each, bounded by
/// the configured session limit.
pub struct Server {
    config: Arc<BrokerConfig>,
    repository: Arc<Repository>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server over an active repository.
    #[must_use]
    pub fn new(config: Arc<BrokerConfig>, repository: Arc<Repository>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self { config, repository, shutdown_tx }
    }

    /// Sender half of the shutdown channel, for wiring signal handlers.
    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// # Errors
    /// Returns an error if the listen address cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let listener =
            TcpListener::bind(self.config.bind_address).await.map_err(|e| Error::Network {
                message: format!("cannot bind {}: {e}", self.config.bind_address),
            })?;
        info!("listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown.
    ///
    /// # Errors
    /// Currently infallible past binding; kept fallible for symmetry with
    /// [`Server::run`].
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_sessions));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if self.config.housekeeping.enabled {
            tokio::spawn(housekeeping(
                Arc::clone(&self.repository),
                self.config.housekeeping.interval_ms,
                self.shutdown_tx.subscribe(),
            ));
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        },
                    };
                    let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                        warn!("session limit {} reached, refusing {addr}", self.config.max_sessions);
                        continue;
                    };
                    debug!("accepted connection from {addr}");

                    let repository = Arc::clone(&self.repository);
                    let shutdown = self.shutdown_tx.clone();
                    tokio::spawn(async move {
                        let registry = Arc::clone(repository.sessions());
                        let handle = registry.register();
                        let context = SessionContext::new(handle.id(), repository, shutdown);
                        Session::new(stream, context, handle, registry).run().await;
                        drop(permit);
                    });
                }
            }
        }
        Ok(())
    }
}

/// Periodically purge expired messages from the local queues.
async fn housekeeping(
    repository: Arc<Repository>,
    interval_ms: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = repository.purge_expired();
                if purged > 0 {
                    info!("housekeeping purged {purged} expired messages");
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("housekeeping stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::wire;
    use ferrumq_core::message::keys;
    use ferrumq_core::{CompletionCode, Message, Payload, RequestType};
    use tempfile::TempDir;
    use tokio::net::TcpStream;

    async fn start_server(dir: &TempDir) -> (std::net::SocketAddr, Arc<Repository>, broadcast::Sender<()>) {
        let mut config = BrokerConfig::default();
        config.storage.backup_dir = dir.path().to_path_buf();
        config.credentials.insert("admin".to_string(), "s3cret".to_string());
        let config = Arc::new(config);

        let repository =
            Arc::new(Repository::new(Arc::clone(&config), Arc::new(SessionRegistry::new())));
        repository.activate().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::new(config, Arc::clone(&repository));
        let shutdown = server.shutdown_sender();
        tokio::spawn(async move { server.serve(listener).await });

        (addr, repository, shutdown)
    }

    async fn exchange(stream: &mut TcpStream, request: &Message) -> Message {
        wire::write_message(stream, request).await.unwrap();
        wire::read_message(stream).await.unwrap().unwrap()
    }

    fn login(user: &str, password: &str) -> Message {
        let mut request = Message::request(RequestType::Login);
        request.properties.set(keys::USER, user);
        request.properties.set(keys::PASSWORD, password);
        request
    }

    #[tokio::test]
    async fn test_full_session_over_socket() {
        let dir = TempDir::new().unwrap();
        let (addr, _repository, shutdown) = start_server(&dir).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = exchange(&mut stream, &login("admin", "s3cret")).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Ok);

        let mut define = Message::request(RequestType::DefineQueue);
        define.properties.set(keys::QUEUE, "WORK");
        let reply = exchange(&mut stream, &define).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Ok);

        let mut put = Message::builder()
            .priority(5)
            .request(RequestType::MessagePut)
            .property(keys::QUEUE, "WORK")
            .build()
            .unwrap();
        put.payload = Payload::Text("over the wire".to_string());
        let reply = exchange(&mut stream, &put).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Ok);

        let get = Message::builder()
            .priority(5)
            .request(RequestType::MessageGet)
            .property(keys::QUEUE, "WORK")
            .build()
            .unwrap();
        let reply = exchange(&mut stream, &get).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Ok);
        let message = wire::extract_message(&reply).unwrap();
        assert_eq!(message.payload, Payload::Text("over the wire".to_string()));

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_activation_broadcast_establishes_federation() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();

        // Broker A serves; broker B only broadcasts at it.
        let mut config_a = BrokerConfig::default();
        config_a.manager_name = "QMGRA".to_string();
        config_a.storage.backup_dir = dir_a.path().to_path_buf();
        config_a.peers.insert("QMGRB".to_string(), "127.0.0.1:1".to_string());
        let config_a = Arc::new(config_a);
        let repo_a =
            Arc::new(Repository::new(Arc::clone(&config_a), Arc::new(SessionRegistry::new())));
        repo_a.activate().await.unwrap();
        repo_a.define_local_queue("SHARED", 30).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(config_a, Arc::clone(&repo_a));
        let shutdown = server.shutdown_sender();
        tokio::spawn(async move { server.serve(listener).await });

        let mut config_b = BrokerConfig::default();
        config_b.manager_name = "QMGRB".to_string();
        config_b.storage.backup_dir = dir_b.path().to_path_buf();
        config_b.peers.insert("QMGRA".to_string(), addr.to_string());
        let repo_b = Arc::new(Repository::new(
            Arc::new(config_b),
            Arc::new(SessionRegistry::new()),
        ));
        repo_b.activate().await.unwrap();
        repo_b.define_local_queue("B.ONLY", 10).unwrap();

        repo_b.broadcast_activation().await;

        // One exchange establishes both directions.
        assert!(!repo_b.is_peer_inactive("QMGRA"));
        let handle = repo_b.get_queue("SHARED").unwrap();
        assert!(!handle.is_local());
        assert!(!repo_a.is_peer_inactive("QMGRB"));
        assert!(repo_a.get_queue("B.ONLY").is_some());

        // Going down tells the peer to drop the proxies.
        repo_b.broadcast_deactivation().await;
        assert!(repo_a.is_peer_inactive("QMGRB"));
        assert!(repo_a.get_queue("B.ONLY").is_none());

        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_failed_login_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (addr, _repository, shutdown) = start_server(&dir).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(&mut stream, &login("admin", "wrong")).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Fail);

        // The server ends the session after a failed login.
        assert!(wire::read_message(&mut stream).await.unwrap().is_none());
        let _ = shutdown.send(());
    }

    #[tokio::test]
    async fn test_shutdown_request_stops_accepting() {
        let dir = TempDir::new().unwrap();
        let (addr, _repository, _shutdown) = start_server(&dir).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(&mut stream, &login("admin", "s3cret")).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Ok);

        let reply = exchange(&mut stream, &Message::request(RequestType::Shutdown)).await;
        assert_eq!(reply.completion.as_ref().unwrap().code, CompletionCode::Ok);

        // The shutdown also ends the requesting session.
        assert!(wire::read_message(&mut stream).await.unwrap().is_none());
    }
}
