pub mod client;
pub mod endpoint;
pub mod error;
mod handler;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod settings;
pub mod transport;

pub use client::{AgentConnection, ConnectOptions, SymmetricKeyLoader};
pub use endpoint::{DEFAULT_PORT, Endpoint, default_socket_path, resolve_endpoint};
pub use error::{AgentError, AgentResult};
pub use pool::AgentRegistry;
pub use server::{AgentServer, ServerOptions};
pub use settings::{Settings, SettingsStore};
