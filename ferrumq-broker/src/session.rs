//! Client sessions: the sequential request→reply loop and the registry that
//! allows sessions to be terminated by id.

use crate::processor::{self, SessionContext};
use crate::wire;
use dashmap::DashMap;
use ferrumq_core::SessionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Cooperative stop handle for one session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    stop: AtomicBool,
}

impl SessionHandle {
    fn new() -> Self {
        Self { id: SessionId::new(), stop: AtomicBool::new(false) }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Request cooperative termination; the session loop checks this flag
    /// between requests.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether termination has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Registry of live sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and hand back its stop handle.
    #[must_use]
    pub fn register(&self) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new());
        self.sessions.insert(handle.id(), Arc::clone(&handle));
        handle
    }

    /// Remove a finished session.
    pub fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Request termination of the identified session.
    ///
    /// Returns `false` when no such session is registered.
    pub fn terminate(&self, id: SessionId) -> bool {
        match self.sessions.get(&id) {
            Some(handle) => {
                handle.stop();
                true
            },
            None => false,
        }
    }

    /// Ids of all live sessions.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// One client session: reads requests, dispatches them, writes replies.
///
/// Strictly sequential: no pipelining, no concurrent requests within one
/// session. The loop ends when the client disconnects, the per-session error
/// budget is spent, a processor ends the session (failed Login, Shutdown), or
/// the handle's stop flag is raised.
pub struct Session<S> {
    stream: S,
    context: SessionContext,
    handle: Arc<SessionHandle>,
    registry: Arc<SessionRegistry>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a session over an accepted stream.
    pub fn new(
        stream: S,
        context: SessionContext,
        handle: Arc<SessionHandle>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self { stream, context, handle, registry }
    }

    /// Run the request→reply loop to completion.
    pub async fn run(mut self) {
        let timeout = Duration::from_millis(self.context.config().socket_timeout_ms);
        let max_errors = self.context.config().max_session_errors;
        let mut errors: u32 = 0;

        loop {
            if self.handle.is_stopped() {
                debug!(session = %self.handle.id(), "session stop requested");
                break;
            }

            // The timeout covers only the wait for a frame to start, so a
            // slow request cannot desynchronize the framing.
            let request = match wire::read_message_timed(&mut self.stream, timeout).await {
                Ok(Some(request)) => {
                    errors = 0;
                    request
                },
                Ok(None) => {
                    debug!(session = %self.handle.id(), "client closed the connection");
                    break;
                },
                Err(e) => {
                    errors += 1;
                    warn!(session = %self.handle.id(), "bad request ({errors}/{max_errors}): {e}");
                    if errors > max_errors {
                        break;
                    }
                    continue;
                },
            };

            match processor::handle_request(&mut self.context, request, &mut self.stream).await {
                Ok(true) => {},
                Ok(false) => break,
                Err(e) => {
                    warn!(session = %self.handle.id(), "reply write failed: {e}");
                    break;
                },
            }
        }

        self.registry.remove(self.handle.id());
        debug!(session = %self.handle.id(), "session ended");
    }
}
