use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

use fe_platform::filesystem::sort_entries;
use fe_platform::format::{base_name, decode_latin1_lines, format_system_time, permission_string};
use fe_platform::{DirectoryEntry, EntryKind, ExplorerError, FileExplorer, Result, MAX_CONTENT_SIZE};

const STATE_NEW: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// File explorer over the local disk. Request paths are resolved below
/// `root` and can never climb above it, neither through `..` nor through a
/// symlink pointing outside.
pub struct LocalFileExplorer {
    root: PathBuf,
    /// `root` with symlinks resolved, set by `init`
    real_root: OnceLock<PathBuf>,
    state: AtomicU8,
}

impl LocalFileExplorer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            real_root: OnceLock::new(),
            state: AtomicU8::new(STATE_NEW),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == STATE_READY {
            Ok(())
        } else {
            Err(ExplorerError::NotReady)
        }
    }

    /// Map a request path onto the disk. `..` stops at the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        self.ensure_ready()?;
        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                _ => {}
            }
        }
        self.confine(path, resolved)
    }

    /// Reject paths whose deepest existing ancestor really lives outside the
    /// root. Symlinks that stay inside the root are fine.
    fn confine(&self, path: &str, resolved: PathBuf) -> Result<PathBuf> {
        let real_root = self.real_root.get().ok_or(ExplorerError::NotReady)?;
        let mut existing = resolved.as_path();
        loop {
            match fs::canonicalize(existing) {
                Ok(real) if real.starts_with(real_root) => return Ok(resolved),
                Ok(_) => {
                    return Err(ExplorerError::InvalidArgument(format!(
                        "{} points outside the root directory",
                        path
                    )))
                }
                // Exists but cannot be resolved: a dangling symlink
                Err(_) if fs::symlink_metadata(existing).is_ok() => {
                    return Err(ExplorerError::InvalidArgument(format!(
                        "{} is a dangling link",
                        path
                    )))
                }
                Err(_) => match existing.parent() {
                    Some(parent) if existing != self.root.as_path() => existing = parent,
                    _ => return Ok(resolved),
                },
            }
        }
    }

    fn to_directory_entry(name: String, meta: &fs::Metadata) -> DirectoryEntry {
        let date = meta.modified().map(format_system_time).unwrap_or_default();
        DirectoryEntry {
            name,
            permissions: permission_string(meta.mode()),
            size: meta.len().to_string(),
            date,
            kind: if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
        }
    }
}

#[async_trait]
impl FileExplorer for LocalFileExplorer {
    async fn init(&self) -> Result<()> {
        if self.real_root.get().is_none() {
            let real = tokio::fs::canonicalize(&self.root)
                .await
                .map_err(|e| ExplorerError::Connect(format!("{}: {}", self.root.display(), e)))?;
            let _ = self.real_root.set(real);
        }
        match self.state.compare_exchange(
            STATE_NEW,
            STATE_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) | Err(STATE_READY) => {
                debug!("local explorer ready at {}", self.root.display());
                Ok(())
            }
            Err(_) => Err(ExplorerError::NotReady),
        }
    }

    fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let dir = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ExplorerError::io("list", path, e))?;

        let mut result = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(e)) => e,
                Ok(None) => break,
                Err(e) => return Err(ExplorerError::io("list", path, e)),
            };
            // DirEntry::metadata does not follow symlinks
            match entry.metadata().await {
                Ok(meta) => {
                    let name = entry.file_name().to_string_lossy().to_string();
                    result.push(Self::to_directory_entry(name, &meta));
                }
                Err(e) => {
                    warn!("skipping {}: {}", entry.path().display(), e);
                }
            }
        }

        sort_entries(&mut result);
        Ok(result)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        tokio::fs::DirBuilder::new()
            .mode(0o700)
            .create(&dir)
            .await
            .map_err(|e| ExplorerError::io("mkdir", path, e))
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let from = self.resolve(old_path)?;
        let to = self.resolve(new_path)?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| ExplorerError::io("rename", old_path, e))
    }

    async fn remove_item(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(ExplorerError::InvalidArgument(
                "refusing to delete the root directory".to_string(),
            ));
        }
        let meta = tokio::fs::symlink_metadata(&target)
            .await
            .map_err(|e| ExplorerError::io("delete", path, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        result.map_err(|e| ExplorerError::io("delete", path, e))
    }

    async fn copy_item(&self, source: &str, target: &str) -> Result<()> {
        let from = self.resolve(source)?;
        let to = self.resolve(target)?;
        run_blocking("copy", source, move || copy_tree(&from, &to)).await
    }

    async fn chmod_item(&self, path: &str, mode: u32, recursive: bool) -> Result<()> {
        let target = self.resolve(path)?;
        run_blocking("chmod", path, move || {
            if recursive {
                chmod_tree(&target, mode)
            } else {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
            }
        })
        .await
    }

    async fn upload_file(
        &self,
        destination: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        file_name: &str,
    ) -> Result<()> {
        let name = base_name(file_name);
        if name.is_empty() || name == ".." || name == "." {
            return Err(ExplorerError::InvalidArgument(format!(
                "invalid upload file name {:?}",
                file_name
            )));
        }
        let target = self.resolve(destination)?.join(name);
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| ExplorerError::io("upload", name, e))?;
        let written = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| ExplorerError::io("upload", name, e))?;
        file.flush()
            .await
            .map_err(|e| ExplorerError::io("upload", name, e))?;

        info!("upload complete: {} ({} bytes)", target.display(), written);
        Ok(())
    }

    async fn get_content(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|e| ExplorerError::io("getContent", path, e))?;
        if meta.len() > MAX_CONTENT_SIZE {
            return Err(ExplorerError::TooLarge {
                path: path.to_string(),
                size: meta.len(),
            });
        }
        let data = tokio::fs::read(&target)
            .await
            .map_err(|e| ExplorerError::io("getContent", path, e))?;
        Ok(decode_latin1_lines(&data))
    }

    async fn edit(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|e| ExplorerError::io("edit", path, e))
    }

    async fn close(&self) -> Result<()> {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_READY {
            debug!("local explorer closed at {}", self.root.display());
        }
        Ok(())
    }
}

async fn run_blocking<F>(op: &'static str, path: &str, f: F) -> Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| ExplorerError::io(op, path, e)),
        Err(e) => Err(ExplorerError::io(op, path, io::Error::new(io::ErrorKind::Other, e))),
    }
}

/// Copy a file, or a directory tree whose destination must not exist yet
fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if !meta.is_dir() {
        fs::copy(source, dest)?;
        return Ok(());
    }

    if fs::symlink_metadata(dest).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "destination already exists",
        ));
    }
    fs::create_dir(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
    }
    fs::set_permissions(dest, meta.permissions())
}

/// Children first, so a restrictive mode on a directory does not stop the walk
fn chmod_tree(path: &Path, mode: u32) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            chmod_tree(&entry?.path(), mode)?;
        }
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
