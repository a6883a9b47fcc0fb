//! Agent server: answers ping, decrypt and encrypt requests on a loopback TLS
//! port or a Unix socket.
//!
//! Shutdown happens in two stages. [`AgentServer::close`] first stops the RPC
//! layer (every open connection is told to stop and is awaited), then stops
//! the listener and removes the socket file. Only after both finish does
//! `close` return.

use crate::endpoint::{Endpoint, resolve_endpoint_blocking};
use crate::error::{AgentError, AgentResult};
use crate::handler::{AgentState, handle_request};
use crate::protocol::{ErrorCode, Frame, MAX_LINE_BYTES, Request, Response};
use crate::settings::SettingsStore;
use crate::transport::{BoxedStream, load_cert, loopback, tls_acceptor};
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use keyward_crypto::paths::ensure_private_dir;
use keyward_crypto::{CertStore, KeyStore, PrivateKey};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Everything a server needs besides the optional private key override.
#[derive(Clone)]
pub struct ServerOptions {
    /// Explicit endpoint; `None` resolves one from the settings file.
    pub endpoint: Option<Endpoint>,
    pub settings: SettingsStore,
    pub certs: CertStore,
    pub keys: Arc<KeyStore>,
}

impl ServerOptions {
    /// Options that keep settings and certificates next to the key store.
    pub fn new(keys: Arc<KeyStore>) -> Self {
        let dir = keys.dir().to_path_buf();
        Self {
            endpoint: None,
            settings: SettingsStore::in_state_dir(&dir),
            certs: CertStore::new(&dir),
            keys,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

pub struct AgentServer {
    endpoint: Endpoint,
    /// Stops the RPC layer: every connection task watches this token.
    rpc_shutdown: CancellationToken,
    connections: TaskTracker,
    listener_shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<io::Result<()>>>>,
    accepted: Arc<AtomicU64>,
}

impl AgentServer {
    /// Bind the endpoint and start accepting connections.
    ///
    /// `private_key` overrides the key store's private key for every request.
    pub async fn start(options: ServerOptions, private_key: Option<PrivateKey>) -> AgentResult<Self> {
        let endpoint = resolve_endpoint_blocking(options.endpoint.clone(), &options.settings).await?;
        let listener = Listener::bind(&endpoint, &options.certs).await?;
        let endpoint = listener.local_endpoint().map_err(AgentError::connection)?;

        let rpc_shutdown = CancellationToken::new();
        let listener_shutdown = CancellationToken::new();
        let connections = TaskTracker::new();
        let accepted = Arc::new(AtomicU64::new(0));

        let ctx = ConnectionContext {
            state: AgentState::new(options.keys, private_key),
            shutdown: rpc_shutdown.clone(),
            tracker: connections.clone(),
            accepted: accepted.clone(),
        };
        let handle = tokio::spawn(accept_loop(listener, ctx, listener_shutdown.clone()));

        tracing::info!(endpoint = %endpoint, "agent listening");
        Ok(Self {
            endpoint,
            rpc_shutdown,
            connections,
            listener_shutdown,
            listener: Mutex::new(Some(handle)),
            accepted,
        })
    }

    /// The bound endpoint. For port `0` this carries the port actually assigned.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of connections accepted since start.
    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Stop the server. Safe to call more than once; later calls return `Ok`
    /// once the first has finished.
    pub async fn close(&self) -> AgentResult<()> {
        let mut listener = self.listener.lock().await;
        let Some(handle) = listener.take() else {
            return Ok(());
        };

        self.rpc_shutdown.cancel();
        self.connections.close();
        self.connections.wait().await;
        tracing::debug!(endpoint = %self.endpoint, "rpc layer stopped");

        self.listener_shutdown.cancel();
        let result = match handle.await {
            Ok(result) => {
                result.map_err(|e| AgentError::connection(format!("failed to close listener: {e}")))
            }
            Err(e) => Err(AgentError::connection(format!("listener task failed: {e}"))),
        };
        tracing::info!(endpoint = %self.endpoint, "agent server closed");
        result
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        self.rpc_shutdown.cancel();
        self.listener_shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

enum Listener {
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
    },
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

enum Accepted {
    Tls(TcpStream, TlsAcceptor),
    Unix(UnixStream),
}

impl Listener {
    async fn bind(endpoint: &Endpoint, certs: &CertStore) -> AgentResult<Self> {
        match endpoint {
            Endpoint::Port(port) => {
                let pair = load_cert(certs).await?;
                let acceptor = tls_acceptor(&pair).map_err(AgentError::config)?;
                let listener = TcpListener::bind(loopback(*port))
                    .await
                    .map_err(|e| AgentError::connection(format!("failed to bind {endpoint}: {e}")))?;
                Ok(Listener::Tls { listener, acceptor })
            }
            Endpoint::Socket(path) => {
                let listener = bind_socket(path).map_err(AgentError::connection)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tls { listener, .. } => Ok(Endpoint::Port(listener.local_addr()?.port())),
            Listener::Unix { path, .. } => Ok(Endpoint::Socket(path.clone())),
        }
    }

    async fn accept(&self) -> io::Result<Accepted> {
        match self {
            Listener::Tls { listener, acceptor } => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Accepted::Tls(stream, acceptor.clone()))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted::Unix(stream))
            }
        }
    }

    /// Drop the listening socket and remove the socket file, if any.
    fn close(self) -> io::Result<()> {
        match self {
            Listener::Tls { .. } => Ok(()),
            Listener::Unix { listener, path } => {
                drop(listener);
                match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }
}

impl Accepted {
    async fn into_stream(self) -> io::Result<BoxedStream> {
        match self {
            Accepted::Tls(stream, acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
            Accepted::Unix(stream) => Ok(Box::new(stream)),
        }
    }
}

/// Bind a Unix socket: stale file removed, socket `0600`. A missing parent
/// directory is created `0700`; an existing one keeps its mode.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    use anyhow::Context;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        ensure_private_dir(parent)?;
    }

    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(listener)
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct ConnectionContext {
    state: Arc<AgentState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accepted: Arc<AtomicU64>,
}

/// Pause after a failed accept, so a persistent error (EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn accept_loop(listener: Listener, ctx: ConnectionContext, stop: CancellationToken) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            conn = listener.accept() => match conn {
                Ok(conn) => {
                    if ctx.shutdown.is_cancelled() {
                        continue;
                    }
                    ctx.accepted.fetch_add(1, Ordering::Relaxed);
                    ctx.tracker.spawn(serve_connection(conn, ctx.clone()));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "accept error");
                    if !accept_backoff(&stop).await {
                        break;
                    }
                }
            },
        }
    }
    listener.close()
}

/// Wait out [`ACCEPT_BACKOFF`]. Returns `false` if `stop` fired meanwhile.
async fn accept_backoff(stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

async fn serve_connection(conn: Accepted, ctx: ConnectionContext) {
    let stream = tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        stream = conn.into_stream() => match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(err = %e, "TLS handshake failed");
                return;
            }
        },
    };
    if let Err(e) = handle_client(stream, &ctx).await {
        tracing::debug!(err = %e, "client disconnected");
    }
}

async fn handle_client(stream: BoxedStream, ctx: &ConnectionContext) -> Result<()> {
    let (r, w) = tokio::io::split(stream);
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let result: Result<()> = loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break Ok(()),
            line = reader.next() => {
                let Some(line) = line else { break Ok(()) };
                match line {
                    Ok(line) => dispatch(ctx, &line, &reply_tx),
                    Err(e) => break Err(e.into()),
                }
            }
            Some(reply) = reply_rx.recv() => {
                if let Err(e) = writer.send(reply).await {
                    break Err(e.into());
                }
            }
        }
    };

    let _ = SinkExt::<String>::close(&mut writer).await;
    result
}

/// Decode one request line and answer it on its own task, so a slow request
/// never holds up the others on the same connection. The task is tracked, so
/// [`AgentServer::close`] waits for it.
fn dispatch(ctx: &ConnectionContext, line: &str, replies: &mpsc::UnboundedSender<String>) {
    let frame: Frame<Request> = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            match frame_id(line) {
                Some(id) => send_reply(
                    replies,
                    id,
                    Response::error(ErrorCode::InvalidRequest, format!("invalid request: {e}")),
                ),
                None => tracing::warn!(err = %e, "dropping frame without a request id"),
            }
            return;
        }
    };

    let state = ctx.state.clone();
    let replies = replies.clone();
    ctx.tracker.spawn(async move {
        let Frame { id, body } = frame;
        let kind = body.message_type();
        let resp = handle_request(&state, body).await;
        tracing::debug!(id, request = %kind, ok = matches!(resp, Response::Ok { .. }), "request handled");
        send_reply(&replies, id, resp);
    });
}

fn frame_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

/// Queue a reply. A reply too large for one frame is swapped for an error to
/// the same caller; the connection and its other calls are unaffected.
fn send_reply(replies: &mpsc::UnboundedSender<String>, id: u64, body: Response) {
    let line = match serde_json::to_string(&Frame { id, body }) {
        Ok(line) if line.len() <= MAX_LINE_BYTES => line,
        Ok(line) => {
            tracing::warn!(id, bytes = line.len(), "reply too large for one frame");
            error_line(
                id,
                ErrorCode::HandlerFailed,
                format!("reply exceeds {MAX_LINE_BYTES} bytes"),
            )
        }
        Err(e) => error_line(id, ErrorCode::Internal, format!("failed to encode reply: {e}")),
    };
    // The connection may already be gone; the reply has nowhere to go then.
    let _ = replies.send(line);
}

fn error_line(id: u64, code: ErrorCode, message: String) -> String {
    serde_json::to_string(&Frame {
        id,
        body: Response::error(code, message),
    })
    .unwrap_or_else(|_| {
        format!(r#"{{"id":{id},"type":"error","code":"internal","message":"failed to encode reply"}}"#)
    })
}
