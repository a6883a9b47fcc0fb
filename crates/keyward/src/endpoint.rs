//! Where the agent listens: a loopback TLS port or a Unix socket.

use crate::error::{AgentError, AgentResult};
use crate::settings::{SecretAgentSettings, SettingsStore};
use std::fmt;
use std::path::PathBuf;

/// Port used when neither the caller nor the settings file names one.
pub const DEFAULT_PORT: u16 = 42938;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TLS on `127.0.0.1:<port>`.
    Port(u16),
    /// Plain stream on a Unix domain socket.
    Socket(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Port(port) => write!(f, "127.0.0.1:{port}"),
            Endpoint::Socket(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Decide which endpoint to use.
///
/// An explicit override always wins and touches nothing on disk. Otherwise the
/// settings file is consulted: a configured port is used as-is, and a settings
/// file without one gets [`DEFAULT_PORT`] written back so later runs agree on
/// it. When no settings file exists the default is returned without creating
/// one.
pub fn resolve_endpoint(
    override_endpoint: Option<Endpoint>,
    settings: &SettingsStore,
) -> AgentResult<Endpoint> {
    if let Some(endpoint) = override_endpoint {
        return Ok(endpoint);
    }

    let Some(current) = settings.load().map_err(AgentError::config)? else {
        return Ok(Endpoint::Port(DEFAULT_PORT));
    };
    if let Some(port) = current.agent_port() {
        return Ok(Endpoint::Port(port));
    }

    settings
        .update(|s| {
            s.secret_agent
                .get_or_insert_with(SecretAgentSettings::default)
                .port = Some(DEFAULT_PORT);
        })
        .map_err(AgentError::config)?;
    tracing::info!(port = DEFAULT_PORT, path = %settings.path().display(), "persisted default agent port");
    Ok(Endpoint::Port(DEFAULT_PORT))
}

/// [`resolve_endpoint`] with the settings file I/O moved to the blocking pool.
pub(crate) async fn resolve_endpoint_blocking(
    override_endpoint: Option<Endpoint>,
    settings: &SettingsStore,
) -> AgentResult<Endpoint> {
    if let Some(endpoint) = override_endpoint {
        return Ok(endpoint);
    }
    let settings = settings.clone();
    tokio::task::spawn_blocking(move || resolve_endpoint(None, &settings))
        .await
        .map_err(|e| AgentError::config(format!("settings task failed: {e}")))?
}

/// Discover the default agent socket path.
///
/// Checks `$KEYWARD_AGENT_SOCK`, then falls back to
/// `$XDG_RUNTIME_DIR/keyward/agent.sock` or `/tmp/keyward-$UID/agent.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("KEYWARD_AGENT_SOCK") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("keyward").join("agent.sock");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/keyward-{uid}/agent.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::in_state_dir(dir.path());
        (dir, store)
    }

    #[test]
    fn override_port_wins_without_io() {
        let (_dir, settings) = store();
        std::fs::write(settings.path(), r#"{"secretAgent":{"port":5000}}"#).unwrap();
        let endpoint = resolve_endpoint(Some(Endpoint::Port(7000)), &settings).unwrap();
        assert_eq!(endpoint, Endpoint::Port(7000));
    }

    #[test]
    fn override_socket_wins() {
        let (_dir, settings) = store();
        let endpoint =
            resolve_endpoint(Some(Endpoint::Socket("/tmp/a.sock".into())), &settings).unwrap();
        assert_eq!(endpoint, Endpoint::Socket("/tmp/a.sock".into()));
        assert!(!settings.path().exists());
    }

    #[test]
    fn configured_port_is_used() {
        let (_dir, settings) = store();
        std::fs::write(settings.path(), r#"{"secretAgent":{"port":5000}}"#).unwrap();
        assert_eq!(resolve_endpoint(None, &settings).unwrap(), Endpoint::Port(5000));
    }

    #[test]
    fn settings_without_port_get_default_persisted() {
        let (_dir, settings) = store();
        std::fs::write(settings.path(), r#"{"theme":"dark"}"#).unwrap();

        assert_eq!(
            resolve_endpoint(None, &settings).unwrap(),
            Endpoint::Port(DEFAULT_PORT)
        );
        let saved = settings.load().unwrap().unwrap();
        assert_eq!(saved.agent_port(), Some(DEFAULT_PORT));
        assert_eq!(saved.other["theme"], "dark");
    }

    #[test]
    fn empty_agent_section_gets_default_persisted() {
        let (_dir, settings) = store();
        std::fs::write(settings.path(), r#"{"secretAgent":{}}"#).unwrap();
        resolve_endpoint(None, &settings).unwrap();
        assert_eq!(
            settings.load().unwrap().unwrap().agent_port(),
            Some(DEFAULT_PORT)
        );
    }

    #[test]
    fn no_settings_file_returns_default_without_writing() {
        let (_dir, settings) = store();
        assert_eq!(
            resolve_endpoint(None, &settings).unwrap(),
            Endpoint::Port(DEFAULT_PORT)
        );
        assert!(!settings.path().exists());
    }

    #[tokio::test]
    async fn blocking_resolve_persists_default_port() {
        let (_dir, settings) = store();
        std::fs::write(settings.path(), r#"{"secretAgent":{}}"#).unwrap();
        assert_eq!(
            resolve_endpoint_blocking(None, &settings).await.unwrap(),
            Endpoint::Port(DEFAULT_PORT)
        );
        assert_eq!(
            settings.load().unwrap().unwrap().agent_port(),
            Some(DEFAULT_PORT)
        );
    }

    #[test]
    fn default_socket_is_named_agent_sock() {
        assert!(default_socket_path().ends_with("agent.sock"));
    }

    #[test]
    fn unreadable_settings_is_config_error() {
        let (_dir, settings) = store();
        std::fs::write(settings.path(), "[1,2").unwrap();
        let err = resolve_endpoint(None, &settings).unwrap_err();
        assert!(matches!(err, AgentError::Config { .. }));
    }
}
