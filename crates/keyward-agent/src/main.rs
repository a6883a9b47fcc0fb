//! keyward-agent: holds the agent private key and answers encrypt/decrypt
//! requests for local clients.
//!
//! Security model:
//!   - The private key is stored encrypted under an Argon2id-derived key and
//!     only decrypted inside the running agent.
//!   - Unix socket endpoints are `0600` in a `0700` directory.
//!   - Port endpoints bind loopback only and speak TLS with a self-signed
//!     certificate that clients pin.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use keyward::{
    AgentConnection, AgentRegistry, AgentServer, ConnectOptions, Endpoint, ServerOptions,
    default_socket_path,
};
use keyward_crypto::KeyStore;
use keyward_crypto::paths::default_state_dir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "keyward-agent", about = "keyward secret agent")]
struct Cli {
    /// State directory (contains agent.key, keys.json, settings.json).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Use the Unix socket at this path instead of a TLS port.
    #[arg(long, global = true, conflicts_with_all = ["port", "unix"])]
    socket: Option<PathBuf>,
    /// Use the default Unix socket (`$KEYWARD_AGENT_SOCK`, else under
    /// `$XDG_RUNTIME_DIR` or `/tmp`).
    #[arg(long, global = true, conflicts_with = "port")]
    unix: bool,
    /// Loopback TLS port (default: from settings.json, else 42938).
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent in the foreground until interrupted.
    Serve,
    /// Create the agent key and the first symmetric key.
    Init,
    /// Add a new symmetric key revision.
    Rotate,
    /// List symmetric key revisions.
    Keys,
    /// Check that the agent is answering.
    Ping,
    /// Encrypt a JSON value.
    Encrypt {
        /// Value to encrypt, as JSON (quote strings: '"text"').
        value: String,
        /// Key revision to use (default: newest).
        #[arg(long)]
        revision: Option<u64>,
    },
    /// Decrypt a ciphertext and print the JSON value.
    Decrypt {
        /// Ciphertext of the form <scheme>:<revision>:<payload>.
        ciphertext: String,
    },
}

impl Cli {
    fn endpoint(&self) -> Option<Endpoint> {
        match (&self.socket, self.port) {
            (Some(path), _) => Some(Endpoint::Socket(path.clone())),
            (None, _) if self.unix => Some(Endpoint::Socket(default_socket_path())),
            (None, Some(port)) => Some(Endpoint::Port(port)),
            (None, None) => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyward_agent=info,keyward=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let endpoint = cli.endpoint();
    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };

    match cli.command {
        Command::Serve => serve(&state_dir, endpoint).await,
        Command::Init => init(&state_dir),
        Command::Rotate => rotate(&state_dir),
        Command::Keys => list_keys(&state_dir),
        Command::Ping => {
            with_connection(&state_dir, endpoint, |conn, _| async move {
                conn.ping().await?;
                println!("ok");
                Ok(())
            })
            .await
        }
        Command::Encrypt { value, revision } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("value must be valid JSON")?;
            with_connection(&state_dir, endpoint, |conn, keys| async move {
                let key_ref = match revision {
                    Some(revision) => keys
                        .load_symmetric_keys(false)?
                        .into_iter()
                        .find(|record| record.revision == revision)
                        .map(|record| record.key_ref)
                        .with_context(|| format!("no symmetric key with revision {revision}"))?,
                    None => keys.latest_key_ref()?,
                };
                println!("{}", conn.encrypt_value(&value, &key_ref).await?);
                Ok(())
            })
            .await
        }
        Command::Decrypt { ciphertext } => {
            with_connection(&state_dir, endpoint, |conn, _| async move {
                let value = conn.decrypt_value(&ciphertext).await?;
                println!("{}", serde_json::to_string_pretty(&value)?);
                Ok(())
            })
            .await
        }
    }
}

async fn serve(state_dir: &Path, endpoint: Option<Endpoint>) -> Result<()> {
    let keys = KeyStore::open(state_dir, None);
    if !keys.is_initialized() {
        eprintln!("Agent not set up. Run: keyward-agent init");
        std::process::exit(1);
    }
    let keys = Arc::new(KeyStore::open(state_dir, Some(read_passphrase(false)?)));
    // Unlock now so a wrong passphrase fails here rather than on the first request.
    keys.load_private_key_lazy()
        .context("failed to unlock agent key")?;

    let mut options = ServerOptions::new(keys);
    options.endpoint = endpoint;
    let server = AgentServer::start(options, None).await?;
    eprintln!("  Agent listening on {}", server.local_endpoint());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for SIGINT")?;
    tracing::info!(
        connections = server.accepted_connections(),
        "SIGINT received, shutting down"
    );
    server.close().await?;
    Ok(())
}

fn init(state_dir: &Path) -> Result<()> {
    let keys = KeyStore::open(state_dir, Some(read_passphrase(true)?));
    let private_key = keys.init()?;
    eprintln!("  Agent initialized in {}", state_dir.display());
    eprintln!("  Public key: {}", private_key.public_key_b64());
    Ok(())
}

fn rotate(state_dir: &Path) -> Result<()> {
    let record = KeyStore::open(state_dir, None).rotate()?;
    eprintln!("  Added symmetric key revision {}", record.revision);
    Ok(())
}

fn list_keys(state_dir: &Path) -> Result<()> {
    let keys = KeyStore::open(state_dir, None).load_symmetric_keys(false)?;
    for record in keys {
        println!("{}\t{}", record.revision, record.created_at_ms);
    }
    Ok(())
}

/// Run `f` against a pooled connection, then close everything the pool opened.
async fn with_connection<F, Fut>(state_dir: &Path, endpoint: Option<Endpoint>, f: F) -> Result<()>
where
    F: FnOnce(AgentConnection, Arc<KeyStore>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let keys = Arc::new(KeyStore::open(state_dir, None));
    let registry = AgentRegistry::new(ConnectOptions::new(state_dir, keys.clone()));
    let result = match registry.connection(endpoint).await {
        Ok(conn) => f(conn, keys).await,
        Err(e) => Err(e).context("failed to reach the agent (is `keyward-agent serve` running?)"),
    };
    registry.close_all().await;
    result
}

/// Read the agent passphrase from `$KEYWARD_PASSPHRASE`, else prompt.
fn read_passphrase(confirm: bool) -> Result<Zeroizing<String>> {
    if let Ok(passphrase) = std::env::var("KEYWARD_PASSPHRASE") {
        return Ok(Zeroizing::new(passphrase));
    }
    let passphrase = Zeroizing::new(
        rpassword::prompt_password("  Agent passphrase: ").context("failed to read passphrase")?,
    );
    if passphrase.is_empty() {
        bail!("passphrase must not be empty");
    }
    if confirm {
        let again = Zeroizing::new(
            rpassword::prompt_password("  Confirm passphrase: ")
                .context("failed to read passphrase")?,
        );
        if *again != *passphrase {
            bail!("passphrases do not match");
        }
    }
    Ok(passphrase)
}
