//! Client side of an agent connection.
//!
//! One [`AgentConnection`] multiplexes any number of concurrent calls over a
//! single stream. Each call gets a fresh id; a reader task routes replies back
//! to the waiting caller by that id, so replies may arrive in any order.
//!
//! With a close timeout configured the connection closes itself once it has
//! been idle (no call in flight) for that long. Any call, including a ping,
//! counts as activity.

use crate::endpoint::{Endpoint, resolve_endpoint_blocking};
use crate::error::{AgentError, AgentResult};
use crate::protocol::{
    DecryptRequest, EncryptRequest, Frame, MAX_LINE_BYTES, Message, PingRequest, Request, Response,
};
use crate::settings::SettingsStore;
use crate::transport::{self, BoxedStream};
use futures_util::{SinkExt, StreamExt};
use keyward_crypto::{CertStore, EncryptedSymmetricKeyRef, KeyStore, SymmetricKeyRecord, parse_revision};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Idle period after which a connection closes itself by default.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest a call waits for its reply by default.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of the sealed symmetric keys a ciphertext may reference.
pub trait SymmetricKeyLoader: Send + Sync {
    /// All known key revisions. `force_refresh` bypasses any cache.
    fn load_symmetric_keys(&self, force_refresh: bool) -> anyhow::Result<Vec<SymmetricKeyRecord>>;
}

impl SymmetricKeyLoader for KeyStore {
    fn load_symmetric_keys(&self, force_refresh: bool) -> anyhow::Result<Vec<SymmetricKeyRecord>> {
        KeyStore::load_symmetric_keys(self, force_refresh)
    }
}

#[derive(Clone)]
pub struct ConnectOptions {
    /// Explicit endpoint; `None` resolves one from the settings file.
    pub endpoint: Option<Endpoint>,
    /// Idle keep-alive period. `None` keeps the connection open until closed.
    pub close_timeout: Option<Duration>,
    /// Per-call reply deadline. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    pub settings: SettingsStore,
    pub certs: CertStore,
    pub key_loader: Arc<dyn SymmetricKeyLoader>,
}

impl ConnectOptions {
    /// Defaults for a state directory: settings and the agent certificate are
    /// read from `state_dir`.
    pub fn new(state_dir: &Path, key_loader: Arc<dyn SymmetricKeyLoader>) -> Self {
        Self {
            endpoint: None,
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            settings: SettingsStore::in_state_dir(state_dir),
            certs: CertStore::new(state_dir),
            key_loader,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Option<Duration>) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

/// A live connection to the agent. Cheap to clone; clones share the stream.
#[derive(Clone)]
pub struct AgentConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: Endpoint,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<PendingCalls>,
    closed: CancellationToken,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
    keep_alive: Option<Arc<KeepAlive>>,
    call_timeout: Option<Duration>,
    key_loader: Arc<dyn SymmetricKeyLoader>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl AgentConnection {
    /// Resolve the endpoint and connect to it.
    pub async fn connect(options: ConnectOptions) -> AgentResult<Self> {
        let endpoint = resolve_endpoint_blocking(options.endpoint.clone(), &options.settings).await?;
        let stream = transport::connect(&endpoint, &options.certs).await?;
        tracing::debug!(endpoint = %endpoint, "connected to agent");
        Ok(Self::start(endpoint, stream, &options))
    }

    fn start(endpoint: Endpoint, stream: BoxedStream, options: &ConnectOptions) -> Self {
        let (r, w) = tokio::io::split(stream);
        let reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let pending = Arc::new(PendingCalls::default());

        tokio::spawn(read_loop(reader, pending.clone(), closed.clone()));
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));

        let keep_alive = options.close_timeout.map(|timeout| {
            let keep_alive = Arc::new(KeepAlive::new(timeout));
            tokio::spawn(idle_watchdog(keep_alive.clone(), closed.clone(), endpoint.clone()));
            keep_alive
        });

        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                next_id: AtomicU64::new(1),
                outbound: outbound_tx,
                pending,
                closed,
                writer: Mutex::new(Some(writer_task)),
                keep_alive,
                call_timeout: options.call_timeout,
                key_loader: options.key_loader.clone(),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// True once the connection has been closed by either side or gone idle.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves when the connection closes.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Close the connection. Calls still waiting fail with
    /// [`AgentError::ConnectionClosed`]. Closing twice is a no-op.
    pub async fn close(&self) -> AgentResult<()> {
        let Some(writer) = self.inner.writer.lock().await.take() else {
            return Ok(());
        };
        let was_open = !self.inner.closed.is_cancelled();
        self.inner.closed.cancel();
        let result = writer.await;
        tracing::debug!(endpoint = %self.inner.endpoint, "agent connection closed");

        // Teardown errors only matter if we were the ones ending a live stream.
        match result {
            Ok(Err(e)) if was_open => Err(AgentError::connection(format!(
                "failed to close connection: {e}"
            ))),
            Err(e) if was_open => Err(AgentError::connection(format!("writer task failed: {e}"))),
            _ => Ok(()),
        }
    }

    pub async fn ping(&self) -> AgentResult<()> {
        self.call(PingRequest).await
    }

    /// Decrypt a ciphertext of the form `<scheme>:<revision>:<payload>`.
    ///
    /// The revision is validated before anything else happens; the sealed key
    /// for it is looked up in the key list, refreshing the list once if the
    /// revision is unknown.
    pub async fn decrypt_value(&self, ciphertext: &str) -> AgentResult<serde_json::Value> {
        let revision = parse_revision(ciphertext).map_err(|e| AgentError::Validation {
            message: e.to_string(),
        })?;
        let symmetric_key = self.find_key_ref(revision).await?;
        self.call(DecryptRequest {
            ciphertext: ciphertext.to_string(),
            symmetric_key,
        })
        .await
    }

    /// Encrypt `value` under the given sealed symmetric key.
    pub async fn encrypt_value(
        &self,
        value: &serde_json::Value,
        symmetric_key: &EncryptedSymmetricKeyRef,
    ) -> AgentResult<String> {
        let reply = self
            .call(EncryptRequest {
                value: value.clone(),
                symmetric_key: symmetric_key.clone(),
            })
            .await?;
        Ok(reply.ciphertext)
    }

    /// Send a typed request and decode its reply payload.
    pub async fn call<M: Message>(&self, message: M) -> AgentResult<M::Reply> {
        match self.request(message.into()).await? {
            Response::Ok { data } => serde_json::from_value(data)
                .map_err(|e| AgentError::protocol(format!("unexpected {} reply: {e}", M::TYPE))),
            Response::Error { code, message } => Err(AgentError::Remote { code, message }),
        }
    }

    /// The loader may read files or unlock a store, so it runs on the blocking pool.
    async fn find_key_ref(&self, revision: u64) -> AgentResult<EncryptedSymmetricKeyRef> {
        for force_refresh in [false, true] {
            let loader = self.inner.key_loader.clone();
            let keys = tokio::task::spawn_blocking(move || loader.load_symmetric_keys(force_refresh))
                .await
                .map_err(|e| AgentError::KeyStore {
                    message: format!("key loader task failed: {e}"),
                })?
                .map_err(|e| AgentError::KeyStore {
                    message: format!("{e:#}"),
                })?;
            if let Some(record) = keys.into_iter().find(|r| r.revision == revision) {
                return Ok(record.key_ref);
            }
        }
        Err(AgentError::KeyNotFound { revision })
    }

    async fn request(&self, request: Request) -> AgentResult<Response> {
        let inner = &*self.inner;
        let _activity = CallGuard::begin(inner.keep_alive.as_deref());
        if inner.closed.is_cancelled() {
            return Err(AgentError::ConnectionClosed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.message_type();
        let line = serde_json::to_string(&Frame { id, body: request }).map_err(AgentError::protocol)?;
        if line.len() > MAX_LINE_BYTES {
            return Err(AgentError::protocol(format!(
                "{kind} request exceeds {MAX_LINE_BYTES} bytes"
            )));
        }

        let reply_rx = inner.pending.register(id);
        if inner.outbound.send(line).is_err() {
            inner.pending.remove(id);
            return Err(AgentError::ConnectionClosed);
        }

        let reply = async {
            tokio::select! {
                biased;
                reply = reply_rx => reply.map_err(|_| AgentError::ConnectionClosed),
                _ = inner.closed.cancelled() => Err(AgentError::ConnectionClosed),
            }
        };
        let result = match inner.call_timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .unwrap_or_else(|_| {
                    Err(AgentError::Timeout {
                        operation: kind.to_string(),
                        timeout_ms: duration_ms(limit),
                    })
                }),
            None => reply.await,
        };
        if result.is_err() {
            inner.pending.remove(id);
        }
        tracing::trace!(id, request = %kind, ok = result.is_ok(), "agent call finished");
        result
    }
}

// ---------------------------------------------------------------------------
// Reply routing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingCalls {
    calls: std::sync::Mutex<HashMap<u64, oneshot::Sender<Response>>>,
}

impl PendingCalls {
    fn register(&self, id: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn complete(&self, id: u64, response: Response) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe the connection as closed.
    fn fail_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_loop(
    mut reader: FramedRead<ReadHalf<BoxedStream>, LinesCodec>,
    pending: Arc<PendingCalls>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            line = reader.next() => match line {
                Some(Ok(line)) => route_reply(&pending, &line),
                Some(Err(e)) => {
                    tracing::debug!(err = %e, "agent connection read failed");
                    break;
                }
                None => {
                    tracing::debug!("agent closed the connection");
                    break;
                }
            },
        }
    }
    closed.cancel();
    pending.fail_all();
}

fn route_reply(pending: &PendingCalls, line: &str) {
    match serde_json::from_str::<Frame<Response>>(line) {
        Ok(frame) => {
            if !pending.complete(frame.id, frame.body) {
                tracing::debug!(id = frame.id, "reply for unknown or abandoned call");
            }
        }
        Err(e) => tracing::warn!(err = %e, "undecodable reply from agent"),
    }
}

async fn write_loop(
    mut writer: FramedWrite<WriteHalf<BoxedStream>, LinesCodec>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            line = outbound.recv() => {
                let Some(line) = line else { break };
                if let Err(e) = writer.send(line).await {
                    closed.cancel();
                    return Err(codec_error(e));
                }
            }
        }
    }
    SinkExt::<String>::close(&mut writer).await.map_err(codec_error)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn codec_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

struct KeepAlive {
    timeout: Duration,
    last_activity: std::sync::Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl KeepAlive {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: std::sync::Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn deadline(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            + self.timeout
    }
}

/// Marks a call in flight for the keep-alive timer and resets the timer on
/// both ends of the call.
struct CallGuard<'a>(Option<&'a KeepAlive>);

impl<'a> CallGuard<'a> {
    fn begin(keep_alive: Option<&'a KeepAlive>) -> Self {
        if let Some(k) = keep_alive {
            k.in_flight.fetch_add(1, Ordering::SeqCst);
            k.touch();
        }
        Self(keep_alive)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(k) = self.0 {
            k.touch();
            k.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

async fn idle_watchdog(keep_alive: Arc<KeepAlive>, closed: CancellationToken, endpoint: Endpoint) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = tokio::time::sleep_until(keep_alive.deadline()) => {}
        }
        if keep_alive.in_flight.load(Ordering::SeqCst) > 0 {
            // Never close under a waiting caller; check again a full period later.
            keep_alive.touch();
            continue;
        }
        if keep_alive.deadline() <= Instant::now() {
            tracing::debug!(endpoint = %endpoint, "closing idle agent connection");
            closed.cancel();
            return;
        }
    }
}
