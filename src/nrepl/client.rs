//! Async nREPL client over a persistent TCP connection.
//!
//! This module provides [`NreplClient`], which owns one socket to a
//! fixed `127.0.0.1:<port>` target and multiplexes concurrent `eval`
//! calls over it by correlation id, with automatic timeout handling and
//! lazy reconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bencode::{decode, encode, Value};
use crate::nrepl::message::{self, Response};

/// Default connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default per-request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Read buffer size for the inbound socket loop.
const READ_BUF_SIZE: usize = 64 * 1024;

/// nREPL client error types.
#[derive(Debug, Error)]
pub enum NreplError {
    /// Failed to open the TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// Connect attempt did not complete within the connect timeout.
    #[error("Connection timed out after {0}s")]
    ConnectionTimeout(u64),

    /// Socket closed or errored while requests were in flight.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No terminal response arrived within the request timeout.
    #[error("Request {op} (id {id}) timed out after {secs}s")]
    RequestTimeout {
        /// Operation name of the original request.
        op: &'static str,
        /// Correlation id of the original request.
        id: String,
        /// Timeout that elapsed, in seconds.
        secs: u64,
        /// The original request, retained for diagnostics.
        request: Value,
    },

    /// `clone` completed without granting a new session id.
    #[error("Session establishment failed: no new-session in clone response")]
    SessionEstablishmentFailure,

    /// `eval` was attempted without an established session.
    #[error("No active session")]
    NoActiveSession,

    /// The remote evaluation itself failed; carries the reported error
    /// text verbatim. Not a transport fault and never triggers reconnect.
    #[error("Evaluation error: {0}")]
    Eval(String),

    /// Encode/decode failure.
    #[error("Codec error: {0}")]
    Codec(#[from] crate::bencode::BencodeError),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only diagnostic view of the client, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    /// Whether the socket is currently connected.
    pub connected: bool,
    /// The active session id, if one is established.
    pub session: Option<String>,
    /// Last observed transport-level error text, retained until
    /// overwritten by a newer error.
    pub last_error: Option<String>,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A request that has been sent but whose terminal response has not
/// arrived. Accumulates every response bearing its correlation id.
struct Pending {
    responses: Vec<Response>,
    done_tx: oneshot::Sender<Result<Vec<Response>, NreplError>>,
}

/// Async nREPL client.
///
/// The client is cheaply cloneable; clones share one socket, one session,
/// and one pending-request table. Multiple `eval` calls may be in flight
/// concurrently; responses are routed back by correlation id.
///
/// # Connection Lifecycle
///
/// - [`NreplClient::new`] - bind to a fixed target port (no I/O)
/// - [`NreplClient::connect`] - dial, spawn the read loop, clone a session
/// - [`NreplClient::eval`] - evaluate code, reconnecting first if needed
///
/// A reconnect always establishes a fresh session: a new socket implies
/// the server has no memory of the old one.
#[derive(Clone)]
pub struct NreplClient {
    inner: Arc<Inner>,
}

struct Inner {
    addr: SocketAddr,
    /// Monotonically increasing correlation-id counter.
    next_id: AtomicU64,
    /// Bumped on every successful dial; stale read loops compare it
    /// before touching shared state.
    generation: AtomicU64,
    state: StdMutex<ConnectionState>,
    session: StdMutex<Option<String>>,
    last_error: StdMutex<Option<String>>,
    request_timeout: StdMutex<Duration>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<String, Pending>>,
    /// Serializes reconnect attempts: concurrent discoverers of a dead
    /// connection await the same dial instead of racing to open
    /// duplicate sockets.
    reconnect: Mutex<()>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Lock a std mutex, recovering the guard if a holder panicked.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NreplClient {
    /// Create a client bound to `127.0.0.1:<port>`. Performs no I/O;
    /// call [`connect`](Self::connect) to dial.
    pub fn new(port: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr: SocketAddr::from(([127, 0, 0, 1], port)),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                state: StdMutex::new(ConnectionState::Disconnected),
                session: StdMutex::new(None),
                last_error: StdMutex::new(None),
                request_timeout: StdMutex::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                reconnect: Mutex::new(()),
                reader_task: StdMutex::new(None),
            }),
        }
    }

    /// Set the per-request timeout.
    ///
    /// Default is 30 seconds.
    pub fn set_request_timeout(&self, timeout: Duration) {
        *lock(&self.inner.request_timeout) = timeout;
    }

    /// (Re)initialize the connection: dial the target, start the read
    /// loop, and establish a fresh session.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionTimeout` if the dial does not complete within
    /// 5 seconds, `ConnectionFailed` if it is refused, and
    /// `SessionEstablishmentFailure` if the server grants no session.
    pub async fn connect(&self) -> Result<(), NreplError> {
        let _guard = self.inner.reconnect.lock().await;
        self.reconnect_locked().await
    }

    /// Reconnect if the connection is down; no-op when already
    /// connected. Must be called with intent at operation entry points
    /// only, never from the decode loop.
    async fn ensure_connected(&self) -> Result<(), NreplError> {
        let _guard = self.inner.reconnect.lock().await;
        if self.inner.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.reconnect_locked().await
    }

    /// Dial and re-establish a session. Caller must hold the reconnect
    /// lock.
    async fn reconnect_locked(&self) -> Result<(), NreplError> {
        let inner = &self.inner;
        inner.set_state(ConnectionState::Connecting);

        // Discard the previous socket; the read loop for it is aborted
        // and its half-read inbound buffer goes with it. Anything still
        // in flight on the old socket can never be answered now.
        if let Some(task) = lock(&inner.reader_task).take() {
            task.abort();
        }
        *inner.writer.lock().await = None;
        inner.fail_all_pending("connection replaced").await;

        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let stream = match timeout(connect_timeout, TcpStream::connect(inner.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                inner.record_error(&err.to_string());
                inner.set_state(ConnectionState::Disconnected);
                return Err(NreplError::ConnectionFailed(err));
            }
            Err(_) => {
                inner.record_error("connect timed out");
                inner.set_state(ConnectionState::Disconnected);
                return Err(NreplError::ConnectionTimeout(CONNECT_TIMEOUT_SECS));
            }
        };

        let (read_half, write_half) = stream.into_split();
        *inner.writer.lock().await = Some(write_half);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.set_state(ConnectionState::Connected);

        let task = tokio::spawn(read_loop(self.inner.clone(), read_half, generation));
        *lock(&inner.reader_task) = Some(task);

        // A new socket implies the server has no memory of the old
        // session, so establish a fresh one before returning.
        self.establish_session().await
    }

    /// Send a `clone` request and adopt the granted session id,
    /// unconditionally replacing any previous one.
    async fn establish_session(&self) -> Result<(), NreplError> {
        let id = self.next_correlation_id();
        let request = message::clone_request(&id);
        let responses = self.send_and_wait("clone", &id, &request).await?;

        let session = responses
            .iter()
            .find_map(|r| r.new_session())
            .ok_or(NreplError::SessionEstablishmentFailure)?;

        info!(session, "nREPL session established");
        *lock(&self.inner.session) = Some(session.to_string());
        Ok(())
    }

    /// Evaluate `code` in the current session and return its joined
    /// output (`value` and `out` fields, in arrival order).
    ///
    /// Reconnects first if the connection is down, which transparently
    /// re-establishes the session.
    ///
    /// # Errors
    ///
    /// Returns `Eval` with the remote error text if the evaluation
    /// failed, `RequestTimeout` if no terminal response arrived in time,
    /// and `ConnectionLost` if the socket dropped mid-request.
    pub async fn eval(&self, code: &str) -> Result<String, NreplError> {
        self.ensure_connected().await?;

        let session = lock(&self.inner.session)
            .clone()
            .ok_or(NreplError::NoActiveSession)?;

        let id = self.next_correlation_id();
        let request = message::eval_request(&id, &session, code);
        let responses = self.send_and_wait("eval", &id, &request).await?;

        if let Some(error) = message::collect_error(&responses) {
            return Err(NreplError::Eval(error));
        }
        Ok(message::collect_output(&responses))
    }

    /// Evaluate `code` after switching the session into namespace `ns`
    /// with a side-channel `(in-ns ...)` eval on the same session.
    pub async fn eval_in_ns(&self, ns: &str, code: &str) -> Result<String, NreplError> {
        self.eval(&format!("(in-ns '{})", ns)).await?;
        self.eval(code).await
    }

    /// Read-only status snapshot for diagnostic reporting.
    pub fn status(&self) -> Status {
        Status {
            connected: self.inner.state() == ConnectionState::Connected,
            session: lock(&self.inner.session).clone(),
            last_error: lock(&self.inner.last_error).clone(),
        }
    }

    /// Close the connection and fail any in-flight requests.
    pub async fn close(&self) {
        let _guard = self.inner.reconnect.lock().await;
        if let Some(task) = lock(&self.inner.reader_task).take() {
            task.abort();
        }
        *self.inner.writer.lock().await = None;
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.fail_all_pending("connection closed").await;
    }

    /// Generate the next correlation id. Monotonic, so it cannot collide
    /// with any in-flight id.
    fn next_correlation_id(&self) -> String {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Register a pending entry, write the encoded request, and wait for
    /// the terminal response or the request deadline.
    async fn send_and_wait(
        &self,
        op: &'static str,
        id: &str,
        request: &Value,
    ) -> Result<Vec<Response>, NreplError> {
        let inner = &self.inner;
        let (done_tx, done_rx) = oneshot::channel();
        inner.pending.lock().await.insert(
            id.to_string(),
            Pending {
                responses: Vec::new(),
                done_tx,
            },
        );

        let bytes = encode(request);
        let write_result = {
            let mut writer = inner.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await,
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "socket is not connected",
                )),
            }
        };
        if let Err(err) = write_result {
            inner.pending.lock().await.remove(id);
            let reason = err.to_string();
            inner.record_error(&reason);
            inner.set_state(ConnectionState::Disconnected);
            return Err(NreplError::ConnectionLost(reason));
        }

        let deadline = *lock(&inner.request_timeout);
        match timeout(deadline, done_rx).await {
            Ok(Ok(result)) => result,
            // The read loop dropped the sender without resolving us;
            // treat it like a lost connection.
            Ok(Err(_)) => Err(NreplError::ConnectionLost(
                lock(&inner.last_error)
                    .clone()
                    .unwrap_or_else(|| "connection closed".to_string()),
            )),
            Err(_) => {
                // Remove the entry so a late terminal response is dropped
                // instead of resolving a caller that already gave up.
                inner.pending.lock().await.remove(id);
                warn!(op, id, "request timed out");
                Err(NreplError::RequestTimeout {
                    op,
                    id: id.to_string(),
                    secs: deadline.as_secs(),
                    request: request.clone(),
                })
            }
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Single authoritative transition site for the connection state.
    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        let prev = *state;
        if prev != next {
            debug!(from = ?prev, to = ?next, "connection state transition");
            *state = next;
        }
    }

    fn record_error(&self, text: &str) {
        *lock(&self.last_error) = Some(text.to_string());
    }

    /// Route one decoded inbound value to its pending request.
    ///
    /// Responses with an unknown or missing correlation id are dropped;
    /// that is a monitoring gap, not an error path.
    async fn route(&self, value: Value) {
        let Some(response) = Response::from_value(value) else {
            debug!("dropping non-dictionary inbound value");
            return;
        };
        let Some(id) = response.id().map(str::to_string) else {
            debug!("dropping response without correlation id");
            return;
        };

        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(&id) else {
            debug!(id = %id, "dropping response with unknown correlation id");
            return;
        };

        let done = response.is_done();
        entry.responses.push(response);
        if done {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.done_tx.send(Ok(entry.responses));
            }
        }
    }

    /// Handle a socket close or error observed by the read loop for
    /// `generation`. A stale loop (older generation) must not touch
    /// state owned by its replacement.
    async fn on_disconnect(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        warn!(reason, "nREPL connection lost");
        self.record_error(reason);
        self.set_state(ConnectionState::Disconnected);
        *self.writer.lock().await = None;
        self.fail_all_pending(reason).await;
    }

    /// Resolve every pending request with `ConnectionLost` so no caller
    /// hangs on a dead socket.
    async fn fail_all_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry
                .done_tx
                .send(Err(NreplError::ConnectionLost(reason.to_string())));
        }
    }
}

/// Inbound half of the connection: accumulate bytes, decode zero or more
/// complete responses per read, and route each by correlation id.
async fn read_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf, generation: u64) {
    let mut inbound: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                inner
                    .on_disconnect(generation, "connection closed by server")
                    .await;
                return;
            }
            Ok(n) => n,
            Err(err) => {
                inner.on_disconnect(generation, &err.to_string()).await;
                return;
            }
        };
        inbound.extend_from_slice(&chunk[..n]);

        // Drain every complete value; on the first failure keep the
        // unconsumed tail and wait for more bytes. The codec cannot tell
        // truncated input from malformed input, so "wait" is the only
        // safe interpretation here.
        while !inbound.is_empty() {
            match decode(&inbound) {
                Ok((value, consumed)) => {
                    inbound.drain(..consumed);
                    inner.route(value).await;
                }
                Err(_) => break,
            }
        }
    }
}
