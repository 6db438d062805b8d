use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use russh::client;
use russh::Disconnect;
use russh_keys::key;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use fe_platform::filesystem::sort_entries;
use fe_platform::format::{
    base_name, decode_latin1_lines, format_unix_time, join_path, permission_string,
};
use fe_platform::{DirectoryEntry, EntryKind, ExplorerError, FileExplorer, Result, MAX_CONTENT_SIZE};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// Where and how to reach the SSH server
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Expected server key fingerprint (SHA-256, as printed by russh).
    /// Any key is accepted when unset.
    pub host_key_fingerprint: Option<String>,
}

impl SshOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            host_key_fingerprint: None,
        }
    }
}

struct ClientHandler {
    host: String,
    expected_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected_fingerprint {
            Some(expected) if *expected == fingerprint => Ok(true),
            Some(expected) => {
                warn!(
                    "host key mismatch for {}: expected {}, got {}",
                    self.host, expected, fingerprint
                );
                Ok(false)
            }
            None => {
                debug!("accepting host key {} for {}", fingerprint, self.host);
                Ok(true)
            }
        }
    }
}

struct Connection {
    handle: client::Handle<ClientHandler>,
    sftp: SftpSession,
}

/// File explorer over SFTP on an authenticated SSH session.
///
/// The password is held only until `init` consumes it.
pub struct RemoteFileExplorer {
    options: SshOptions,
    username: String,
    password: Mutex<Option<String>>,
    /// Written only by `init` and `close`; operations take the read side
    conn: RwLock<Option<Arc<Connection>>>,
}

impl RemoteFileExplorer {
    pub fn new(options: SshOptions, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            options,
            username: username.into(),
            password: Mutex::new(Some(password.into())),
            conn: RwLock::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        self.conn.read().await.clone().ok_or(ExplorerError::NotReady)
    }

    async fn open(&self, password: String) -> Result<Connection> {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.options.keepalive_interval),
            ..Default::default()
        };
        let handler = ClientHandler {
            host: self.options.host.clone(),
            expected_fingerprint: self.options.host_key_fingerprint.clone(),
        };
        let addr = (self.options.host.as_str(), self.options.port);

        let mut handle = tokio::time::timeout(
            self.options.connect_timeout,
            client::connect(Arc::new(config), addr, handler),
        )
        .await
        .map_err(|_| {
            ExplorerError::Connect(format!(
                "timed out connecting to {}:{}",
                self.options.host, self.options.port
            ))
        })?
        .map_err(|e| {
            ExplorerError::Connect(format!(
                "{}:{}: {}",
                self.options.host, self.options.port, e
            ))
        })?;

        let authenticated = handle
            .authenticate_password(self.username.clone(), password)
            .await
            .map_err(|e| ExplorerError::Connect(e.to_string()))?;
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(ExplorerError::AuthRejected(self.username.clone()));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExplorerError::Connect(format!("failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ExplorerError::Connect(format!("sftp subsystem unavailable: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ExplorerError::Connect(format!("sftp subsystem unavailable: {}", e)))?;

        Ok(Connection { handle, sftp })
    }
}

#[async_trait]
impl FileExplorer for RemoteFileExplorer {
    async fn init(&self) -> Result<()> {
        let mut conn = self.conn.write().await;
        if conn.is_some() {
            return Ok(());
        }
        let password = self.password.lock().await.take().ok_or(ExplorerError::NotReady)?;

        info!(
            "opening ssh session to {}:{} as {}",
            self.options.host, self.options.port, self.username
        );
        let connection = self.open(password).await?;
        *conn = Some(Arc::new(connection));
        info!("sftp session ready on {}", self.options.host);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        slot_ready(&self.conn, |c| !c.handle.is_closed())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let conn = self.connection().await?;
        let dir = remote_path(path);
        let read_dir = conn
            .sftp
            .read_dir(dir)
            .await
            .map_err(|e| map_sftp_error("list", path, e))?;

        let mut result = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let meta = entry.metadata();
            let is_dir = meta.is_dir();
            let mut mode = meta.permissions.unwrap_or(0);
            if is_dir && mode & S_IFMT == 0 {
                mode |= S_IFDIR;
            }
            result.push(DirectoryEntry {
                name,
                permissions: permission_string(mode),
                size: meta.size.unwrap_or(0).to_string(),
                date: meta.mtime.map(|t| format_unix_time(t as i64)).unwrap_or_default(),
                kind: if is_dir { EntryKind::Dir } else { EntryKind::File },
            });
        }

        sort_entries(&mut result);
        Ok(result)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let conn = self.connection().await?;
        conn.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error("mkdir", path, e))?;
        set_mode(&conn.sftp, path, 0o700, "mkdir").await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let conn = self.connection().await?;
        conn.sftp
            .rename(old_path, new_path)
            .await
            .map_err(|e| map_sftp_error("rename", old_path, e))
    }

    async fn remove_item(&self, path: &str) -> Result<()> {
        let conn = self.connection().await?;
        remove_tree(&conn.sftp, path).await
    }

    async fn copy_item(&self, source: &str, target: &str) -> Result<()> {
        let conn = self.connection().await?;
        copy_tree(&conn.sftp, source, target).await
    }

    async fn chmod_item(&self, path: &str, mode: u32, recursive: bool) -> Result<()> {
        let conn = self.connection().await?;
        if recursive {
            chmod_tree(&conn.sftp, path, mode).await
        } else {
            set_mode(&conn.sftp, path, mode, "chmod").await
        }
    }

    async fn upload_file(
        &self,
        destination: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        file_name: &str,
    ) -> Result<()> {
        let name = base_name(file_name);
        if name.is_empty() || name == "." || name == ".." {
            return Err(ExplorerError::InvalidArgument(format!(
                "invalid upload file name {:?}",
                file_name
            )));
        }
        let conn = self.connection().await?;
        let target = join_path(destination, name);

        let mut file = conn
            .sftp
            .open_with_flags(
                target.as_str(),
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error("upload", &target, e))?;
        let written = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| ExplorerError::io("upload", target.as_str(), e))?;
        file.flush()
            .await
            .map_err(|e| ExplorerError::io("upload", target.as_str(), e))?;

        info!("upload complete: {} ({} bytes)", target, written);
        Ok(())
    }

    async fn get_content(&self, path: &str) -> Result<String> {
        let conn = self.connection().await?;
        let meta = conn
            .sftp
            .metadata(path)
            .await
            .map_err(|e| map_sftp_error("getContent", path, e))?;
        let size = meta.size.unwrap_or(0);
        if size > MAX_CONTENT_SIZE {
            return Err(ExplorerError::TooLarge {
                path: path.to_string(),
                size,
            });
        }

        let file = conn
            .sftp
            .open(path)
            .await
            .map_err(|e| map_sftp_error("getContent", path, e))?;
        // Bounded even if the file grew after the size check
        let mut data = Vec::with_capacity(size as usize);
        file.take(MAX_CONTENT_SIZE + 1)
            .read_to_end(&mut data)
            .await
            .map_err(|e| ExplorerError::io("getContent", path, e))?;
        if data.len() as u64 > MAX_CONTENT_SIZE {
            return Err(ExplorerError::TooLarge {
                path: path.to_string(),
                size: data.len() as u64,
            });
        }
        Ok(decode_latin1_lines(&data))
    }

    async fn edit(&self, path: &str, content: &str) -> Result<()> {
        let conn = self.connection().await?;
        let mut file = conn
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await
            .map_err(|e| map_sftp_error("edit", path, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ExplorerError::io("edit", path, e))?;
        file.flush()
            .await
            .map_err(|e| ExplorerError::io("edit", path, e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.password.lock().await.take();
        let conn = match self.conn.write().await.take() {
            Some(c) => c,
            None => return Ok(()),
        };

        if let Err(e) = conn.sftp.close().await {
            debug!("sftp close on {}: {}", self.options.host, e);
        }
        if let Err(e) = conn
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("ssh disconnect from {}: {}", self.options.host, e);
        }
        info!("ssh session to {} closed", self.options.host);
        Ok(())
    }
}

/// Concurrent readers never make a slot look unready. Only a held write
/// side (init or close in flight), an empty slot or a dead value does.
fn slot_ready<T>(slot: &RwLock<Option<T>>, alive: impl Fn(&T) -> bool) -> bool {
    match slot.try_read() {
        Ok(guard) => guard.as_ref().is_some_and(alive),
        Err(_) => false,
    }
}

fn remote_path(path: &str) -> &str {
    if path.is_empty() {
        "."
    } else {
        path
    }
}

/// Recursive delete. Symlinks are removed, never followed.
fn remove_tree<'a>(sftp: &'a SftpSession, path: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let meta = sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error("delete", path, e))?;

        if meta.is_dir() {
            for name in child_names(sftp, path).await? {
                remove_tree(sftp, &join_path(path, &name)).await?;
            }
            sftp.remove_dir(path)
                .await
                .map_err(|e| map_sftp_error("delete", path, e))
        } else {
            sftp.remove_file(path)
                .await
                .map_err(|e| map_sftp_error("delete", path, e))
        }
    })
}

/// SFTP has no server-side copy, so file bytes travel through this process
fn copy_tree<'a>(sftp: &'a SftpSession, source: &'a str, target: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let meta = sftp
            .metadata(source)
            .await
            .map_err(|e| map_sftp_error("copy", source, e))?;

        if meta.is_dir() {
            sftp.create_dir(target)
                .await
                .map_err(|e| map_sftp_error("copy", target, e))?;
            for name in child_names(sftp, source).await? {
                copy_tree(sftp, &join_path(source, &name), &join_path(target, &name)).await?;
            }
        } else {
            let mut from = sftp
                .open(source)
                .await
                .map_err(|e| map_sftp_error("copy", source, e))?;
            let mut to = sftp
                .create(target)
                .await
                .map_err(|e| map_sftp_error("copy", target, e))?;
            tokio::io::copy(&mut from, &mut to)
                .await
                .map_err(|e| ExplorerError::io("copy", source, e))?;
            to.flush()
                .await
                .map_err(|e| ExplorerError::io("copy", target, e))?;
        }

        if let Some(mode) = meta.permissions {
            set_mode(sftp, target, mode & 0o7777, "copy").await?;
        }
        Ok(())
    })
}

/// Children first, so a restrictive mode on a directory does not stop the walk
fn chmod_tree<'a>(sftp: &'a SftpSession, path: &'a str, mode: u32) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let meta = sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| map_sftp_error("chmod", path, e))?;
        if meta.is_symlink() {
            return Ok(());
        }
        if meta.is_dir() {
            for name in child_names(sftp, path).await? {
                chmod_tree(sftp, &join_path(path, &name), mode).await?;
            }
        }
        set_mode(sftp, path, mode, "chmod").await
    })
}

async fn child_names(sftp: &SftpSession, path: &str) -> Result<Vec<String>> {
    let read_dir = sftp
        .read_dir(path)
        .await
        .map_err(|e| map_sftp_error("list", path, e))?;
    Ok(read_dir
        .map(|entry| entry.file_name())
        .filter(|name| name != "." && name != "..")
        .collect())
}

async fn set_mode(sftp: &SftpSession, path: &str, mode: u32, op: &'static str) -> Result<()> {
    let mut attrs = FileAttributes::empty();
    attrs.permissions = Some(mode);
    sftp.set_metadata(path, attrs)
        .await
        .map_err(|e| map_sftp_error(op, path, e))
}

fn map_sftp_error(op: &'static str, path: &str, err: SftpErrorInner) -> ExplorerError {
    match err {
        SftpErrorInner::Status(status) => {
            map_status(op, path, status.status_code, status.error_message)
        }
        SftpErrorInner::Timeout => ExplorerError::Disconnected("sftp request timed out".to_string()),
        SftpErrorInner::IO(message) => ExplorerError::Disconnected(message),
        other => ExplorerError::Remote {
            op,
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}

fn map_status(op: &'static str, path: &str, code: StatusCode, message: String) -> ExplorerError {
    match code {
        StatusCode::NoSuchFile => ExplorerError::NotFound(path.to_string()),
        StatusCode::NoConnection | StatusCode::ConnectionLost => ExplorerError::Disconnected(message),
        _ => ExplorerError::Remote {
            op,
            path: path.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = map_status("list", "/nope", StatusCode::NoSuchFile, "no such file".into());
        assert!(matches!(err, ExplorerError::NotFound(ref p) if p == "/nope"));
        assert!(!err.is_connection_failure());

        let err = map_status("list", "/x", StatusCode::ConnectionLost, "lost".into());
        assert!(err.is_connection_failure());

        let err = map_status("chmod", "/x", StatusCode::PermissionDenied, "denied".into());
        assert_eq!(err.to_string(), "chmod /x: denied");
    }

    #[test]
    fn test_remote_path_defaults_to_home() {
        assert_eq!(remote_path(""), ".");
        assert_eq!(remote_path("/var/log"), "/var/log");
    }

    #[tokio::test]
    async fn test_slot_ready_ignores_concurrent_readers() {
        let slot = RwLock::new(Some(true));
        {
            let _in_flight = slot.read().await;
            let _another = slot.read().await;
            assert!(slot_ready(&slot, |alive| *alive));
        }

        let writer = slot.write().await;
        assert!(!slot_ready(&slot, |alive| *alive));
        drop(writer);

        *slot.write().await = Some(false);
        assert!(!slot_ready(&slot, |alive| *alive));
        *slot.write().await = None;
        assert!(!slot_ready(&slot, |alive| *alive));
    }

    #[tokio::test]
    async fn test_not_ready_before_init() {
        let fe = RemoteFileExplorer::new(SshOptions::new("127.0.0.1", 22), "user", "secret");
        assert!(!fe.is_ready());
        assert!(matches!(fe.list_dir("/").await, Err(ExplorerError::NotReady)));
        assert!(matches!(fe.get_content("/etc/hosts").await, Err(ExplorerError::NotReady)));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_idempotent() {
        let fe = RemoteFileExplorer::new(SshOptions::new("127.0.0.1", 22), "user", "secret");
        fe.close().await.unwrap();
        fe.close().await.unwrap();
        // Credentials are dropped on close, so a later init cannot reconnect
        assert!(matches!(fe.init().await, Err(ExplorerError::NotReady)));
    }

    #[tokio::test]
    async fn test_init_unreachable_host_fails_with_connect() {
        let mut options = SshOptions::new("127.0.0.1", 1);
        options.connect_timeout = Duration::from_secs(2);
        let fe = RemoteFileExplorer::new(options, "user", "secret");
        match fe.init().await {
            Err(ExplorerError::Connect(_)) => {}
            other => panic!("expected Connect error, got {:?}", other.map(|_| ())),
        }
        assert!(!fe.is_ready());
        fe.close().await.unwrap();
    }
}
