//! Byte streams between agent clients and the server.
//!
//! Port endpoints are TLS over loopback TCP using the agent's self-signed
//! certificate; the client trusts that certificate and nothing else. Socket
//! endpoints are plain Unix streams, protected by filesystem permissions.

use crate::endpoint::Endpoint;
use crate::error::{AgentError, AgentResult};
use anyhow::{Context, Result};
use keyward_crypto::{AGENT_SERVER_NAME, CertPair, CertStore};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Any bidirectional stream an agent connection can run over.
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentStream for T {}

pub type BoxedStream = Box<dyn AgentStream>;

/// Loopback address for a port endpoint.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Open a stream to the agent at `endpoint`.
pub async fn connect(endpoint: &Endpoint, certs: &CertStore) -> AgentResult<BoxedStream> {
    match endpoint {
        Endpoint::Port(port) => {
            let pair = load_cert(certs).await?;
            let config = client_tls_config(&pair).map_err(AgentError::config)?;
            let server_name = ServerName::try_from(AGENT_SERVER_NAME)
                .map_err(|e| AgentError::config(format!("invalid server name: {e}")))?;

            let tcp = TcpStream::connect(loopback(*port))
                .await
                .map_err(|e| AgentError::connection(format!("failed to connect to {endpoint}: {e}")))?;
            tcp.set_nodelay(true).map_err(AgentError::connection)?;
            let tls = TlsConnector::from(config)
                .connect(server_name, tcp)
                .await
                .map_err(|e| AgentError::connection(format!("TLS handshake with {endpoint} failed: {e}")))?;
            Ok(Box::new(tls))
        }
        Endpoint::Socket(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| AgentError::connection(format!("failed to connect to {endpoint}: {e}")))?;
            Ok(Box::new(stream))
        }
    }
}

/// Load or generate the agent certificate on the blocking pool.
pub(crate) async fn load_cert(certs: &CertStore) -> AgentResult<CertPair> {
    let certs = certs.clone();
    tokio::task::spawn_blocking(move || certs.load_or_create())
        .await
        .map_err(|e| AgentError::config(format!("certificate task failed: {e}")))?
        .map_err(AgentError::config)
}

/// TLS acceptor presenting the agent certificate.
pub fn tls_acceptor(pair: &CertPair) -> Result<TlsAcceptor> {
    let certs = parse_certs(pair)?;
    let mut key_reader = pair.key_pem.as_bytes();
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to read agent TLS key")?
        .context("no private key found in agent TLS key file")?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("unsupported TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid agent TLS certificate")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client config whose only trust root is the agent certificate.
pub fn client_tls_config(pair: &CertPair) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in parse_certs(pair)? {
        roots.add(cert).context("agent certificate rejected as trust root")?;
    }
    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("unsupported TLS protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn parse_certs(pair: &CertPair) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pair.cert_pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to read agent TLS certificate")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in agent certificate file");
    }
    Ok(certs)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}
