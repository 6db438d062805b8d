use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use fe_platform::{ExplorerError, FileExplorer};
use fe_ssh::{RemoteFileExplorer, SshOptions};

use crate::config::BackendConfig;

/// Credentials used to open a backend connection. The secret is never
/// printed, not even by `Debug`.
#[derive(Clone)]
pub struct Identity {
    pub username: String,
    secret: String,
}

impl Identity {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.secret.is_empty()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Builds an unconnected explorer for an identity
pub trait Connector: Send + Sync {
    fn create(&self, identity: &Identity) -> Result<Arc<dyn FileExplorer>, ExplorerError>;

    fn describe(&self) -> String;
}

/// Create and `init` an explorer. Nothing half-initialized escapes: on
/// failure the explorer is closed before the error is returned.
pub async fn connect(
    connector: &dyn Connector,
    identity: &Identity,
) -> Result<Arc<dyn FileExplorer>, ExplorerError> {
    if !identity.is_complete() {
        return Err(ExplorerError::AuthRejected(identity.username.clone()));
    }

    let explorer = connector.create(identity)?;
    match explorer.init().await {
        Ok(()) => {
            info!("backend connected for {} via {}", identity.username, connector.describe());
            Ok(explorer)
        }
        Err(e) => {
            warn!("backend connect failed for {}: {}", identity.username, e);
            if let Err(close_err) = explorer.close().await {
                warn!("closing failed explorer: {}", close_err);
            }
            Err(e)
        }
    }
}

pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

impl Connector for SshConnector {
    fn create(&self, identity: &Identity) -> Result<Arc<dyn FileExplorer>, ExplorerError> {
        Ok(Arc::new(RemoteFileExplorer::new(
            self.options.clone(),
            identity.username.clone(),
            identity.secret.clone(),
        )))
    }

    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.options.host, self.options.port)
    }
}

/// Local disk has no login of its own, so accounts come from configuration
#[cfg(unix)]
pub struct LocalConnector {
    root: PathBuf,
    users: HashMap<String, String>,
}

#[cfg(unix)]
impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>, users: HashMap<String, String>) -> Self {
        Self {
            root: root.into(),
            users,
        }
    }
}

#[cfg(unix)]
impl Connector for LocalConnector {
    fn create(&self, identity: &Identity) -> Result<Arc<dyn FileExplorer>, ExplorerError> {
        match self.users.get(&identity.username) {
            Some(secret) if *secret == identity.secret => Ok(Arc::new(
                fe_local::LocalFileExplorer::new(self.root.clone()),
            )),
            _ => Err(ExplorerError::AuthRejected(identity.username.clone())),
        }
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// Pick the backend named in the configuration
pub fn connector_from_config(config: &BackendConfig) -> Result<Arc<dyn Connector>> {
    match config {
        BackendConfig::Ssh {
            host,
            port,
            host_key_fingerprint,
            connect_timeout_secs,
            keepalive_interval_secs,
        } => {
            if host.is_empty() {
                anyhow::bail!("ssh backend requires a host");
            }
            let mut options = SshOptions::new(host.clone(), *port);
            options.host_key_fingerprint = host_key_fingerprint.clone();
            options.connect_timeout = Duration::from_secs(*connect_timeout_secs);
            options.keepalive_interval = Duration::from_secs(*keepalive_interval_secs);
            Ok(Arc::new(SshConnector::new(options)))
        }
        #[cfg(unix)]
        BackendConfig::Local { root, users } => {
            if !root.is_dir() {
                anyhow::bail!("local backend root {} is not a directory", root.display());
            }
            if users.is_empty() {
                warn!("local backend has no users configured, every login will be rejected");
            }
            Ok(Arc::new(LocalConnector::new(root.clone(), users.clone())))
        }
        #[cfg(not(unix))]
        BackendConfig::Local { .. } => {
            anyhow::bail!("local backend not supported on this platform")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_debug_redacts_secret() {
        let id = Identity::new("alice", "hunter2");
        let printed = format!("{:?}", id);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_connector_checks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let users = HashMap::from([("alice".to_string(), "pw".to_string())]);
        let connector = LocalConnector::new(dir.path(), users);

        let explorer = connect(&connector, &Identity::new("alice", "pw")).await.unwrap();
        assert!(explorer.is_ready());
        explorer.close().await.unwrap();

        let err = connect(&connector, &Identity::new("alice", "wrong")).await.err();
        assert!(matches!(err, Some(ExplorerError::AuthRejected(_))));
        let err = connect(&connector, &Identity::new("", "")).await.err();
        assert!(matches!(err, Some(ExplorerError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_unreachable_ssh_backend() {
        let mut options = SshOptions::new("127.0.0.1", 1);
        options.connect_timeout = Duration::from_secs(2);
        let connector = SshConnector::new(options);
        let err = connect(&connector, &Identity::new("bob", "pw")).await.err();
        assert!(matches!(err, Some(ExplorerError::Connect(_))));
    }
}
