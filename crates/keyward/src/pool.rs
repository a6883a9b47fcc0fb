//! Process-wide registry of agent connections, one per endpoint.
//!
//! Concurrent callers asking for the same endpoint share a single connection
//! attempt. A cached connection that has since closed (idle timeout, server
//! shutdown) is replaced on the next request.

use crate::client::{AgentConnection, ConnectOptions};
use crate::endpoint::{Endpoint, resolve_endpoint_blocking};
use crate::error::{AgentError, AgentResult};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

type ConnectFuture = Shared<BoxFuture<'static, AgentResult<AgentConnection>>>;

/// How many times a stale cached connection is replaced before giving up.
const MAX_CONNECT_ATTEMPTS: usize = 2;

pub struct AgentRegistry {
    options: ConnectOptions,
    enabled: AtomicBool,
    entries: Mutex<HashMap<Endpoint, ConnectFuture>>,
}

impl AgentRegistry {
    /// `options` is the template for every connection; its endpoint, if set,
    /// is what [`AgentRegistry::connection`] uses when no endpoint is given.
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            enabled: AtomicBool::new(true),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turn agent usage on or off. Existing connections are left alone.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Connection for `endpoint`, or for the resolved default endpoint.
    pub async fn connection(&self, endpoint: Option<Endpoint>) -> AgentResult<AgentConnection> {
        if !self.is_enabled() {
            return Err(AgentError::Disabled);
        }
        let endpoint = resolve_endpoint_blocking(
            endpoint.or_else(|| self.options.endpoint.clone()),
            &self.options.settings,
        )
        .await?;
        self.get_or_connect(endpoint).await
    }

    /// Return the open connection for `endpoint`, connecting if needed.
    pub async fn get_or_connect(&self, endpoint: Endpoint) -> AgentResult<AgentConnection> {
        if !self.is_enabled() {
            return Err(AgentError::Disabled);
        }

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            let entry = self.entry(&endpoint);
            match entry.clone().await {
                Ok(conn) if !conn.is_closed() => return Ok(conn),
                Ok(_) => {
                    tracing::debug!(endpoint = %endpoint, attempt, "cached agent connection is closed; reconnecting");
                    self.evict(&endpoint, &entry);
                }
                Err(e) => {
                    self.evict(&endpoint, &entry);
                    return Err(e);
                }
            }
        }
        Err(AgentError::ConnectionClosed)
    }

    /// Number of endpoints with a cached connection or attempt.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Close every cached connection and empty the registry. Failures are
    /// logged, never returned.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.lock().drain().collect();
        for (endpoint, entry) in entries {
            match entry.await {
                Ok(conn) => {
                    if let Err(e) = conn.close().await {
                        tracing::warn!(endpoint = %endpoint, err = %e, "failed to close agent connection");
                    }
                }
                Err(e) => tracing::debug!(endpoint = %endpoint, err = %e, "connection attempt had failed"),
            }
        }
    }

    fn entry(&self, endpoint: &Endpoint) -> ConnectFuture {
        self.lock()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                let options = ConnectOptions {
                    endpoint: Some(endpoint.clone()),
                    ..self.options.clone()
                };
                AgentConnection::connect(options).boxed().shared()
            })
            .clone()
    }

    /// Remove `entry` unless another caller already replaced it.
    fn evict(&self, endpoint: &Endpoint, entry: &ConnectFuture) {
        let mut entries = self.lock();
        if entries.get(endpoint).is_some_and(|current| current.ptr_eq(entry)) {
            entries.remove(endpoint);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Endpoint, ConnectFuture>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
