//! Shared harness: a key store in a temp dir with an agent server on top.

#![allow(dead_code)]

use anyhow::Result;
use keyward::{AgentServer, ConnectOptions, Endpoint, ServerOptions, SymmetricKeyLoader};
use keyward_crypto::{KeyStore, SymmetricKeyRecord};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zeroize::Zeroizing;

pub const PASSPHRASE: &str = "correct horse battery staple";

pub struct TestAgent {
    pub dir: TempDir,
    pub keys: Arc<KeyStore>,
    pub server: AgentServer,
}

impl TestAgent {
    /// Agent on a Unix socket inside the temp dir.
    pub async fn spawn_socket() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let socket = dir.path().join("agent.sock");
        Self::spawn_in(dir, Endpoint::Socket(socket)).await
    }

    /// Agent on an OS-assigned loopback TLS port.
    pub async fn spawn_tls() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        Self::spawn_in(dir, Endpoint::Port(0)).await
    }

    async fn spawn_in(dir: TempDir, endpoint: Endpoint) -> Result<Self> {
        let keys = Arc::new(KeyStore::open(
            dir.path(),
            Some(Zeroizing::new(PASSPHRASE.to_string())),
        ));
        keys.init()?;
        let server =
            AgentServer::start(ServerOptions::new(keys.clone()).with_endpoint(endpoint), None)
                .await?;
        Ok(Self { dir, keys, server })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.server.local_endpoint().clone()
    }

    /// Client options pointed at this agent, without an idle timeout.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(self.dir.path(), self.keys.clone())
            .with_endpoint(self.endpoint())
            .with_close_timeout(None)
    }

    /// A second key store over the same files, as another process would see it.
    pub fn reopen_keys(&self) -> Arc<KeyStore> {
        Arc::new(KeyStore::open(
            self.dir.path(),
            Some(Zeroizing::new(PASSPHRASE.to_string())),
        ))
    }
}

/// Key loader that records every call and delegates to a key store.
pub struct RecordingLoader {
    inner: Arc<KeyStore>,
    calls: Mutex<Vec<bool>>,
}

impl RecordingLoader {
    pub fn new(inner: Arc<KeyStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().unwrap().clone()
    }
}

impl SymmetricKeyLoader for RecordingLoader {
    fn load_symmetric_keys(&self, force_refresh: bool) -> Result<Vec<SymmetricKeyRecord>> {
        self.calls.lock().unwrap().push(force_refresh);
        self.inner.load_symmetric_keys(force_refresh)
    }
}

/// Key loader that parks the first lookup until released, so a test can act
/// while a client call is still in progress.
pub struct GatedLoader {
    inner: Arc<KeyStore>,
    entered: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

pub struct Gate {
    pub entered: tokio::sync::oneshot::Receiver<()>,
    pub release: std::sync::mpsc::Sender<()>,
}

impl GatedLoader {
    pub fn new(inner: Arc<KeyStore>) -> (Arc<Self>, Gate) {
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let loader = Arc::new(Self {
            inner,
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let gate = Gate {
            entered: entered_rx,
            release: release_tx,
        };
        (loader, gate)
    }
}

impl SymmetricKeyLoader for GatedLoader {
    fn load_symmetric_keys(&self, force_refresh: bool) -> Result<Vec<SymmetricKeyRecord>> {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            let _ = entered.send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.load_symmetric_keys(force_refresh)
    }
}
