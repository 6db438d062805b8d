use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::warn;

use crate::error::{ExplorerError, Result};
use crate::format::{base_name, join_path, parse_mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One row of a directory listing. Field names on the wire follow the
/// file-manager front end (`rights`, `size`, `date`, `type`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "rights")]
    pub permissions: String,
    /// Decimal byte count
    pub size: String,
    /// `YYYY-MM-DD HH:MM:SS`, backend local time
    pub date: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// Sort entries: directories first, then case-insensitive by name
pub fn sort_entries(entries: &mut [DirectoryEntry]) {
    entries.sort_by(|a, b| {
        (b.kind == EntryKind::Dir)
            .cmp(&(a.kind == EntryKind::Dir))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// Backend-agnostic directory and file operations.
///
/// Every method except `init` and `close` fails with
/// [`ExplorerError::NotReady`] until `init` has succeeded, and again once
/// `close` has run. Paths are `/`-separated request paths; how they map onto
/// the backend is up to the implementation.
///
/// Bulk operations (`move_items`, `copy_items`, `delete`, `chmod`) attempt
/// every item even after a failure. Each failure is logged and the last one
/// is returned, so an error does not say which items were affected.
#[async_trait]
pub trait FileExplorer: Send + Sync {
    /// Establish the connection. Must succeed before any other call.
    async fn init(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    async fn list_dir(&self, path: &str) -> Result<Vec<DirectoryEntry>>;

    /// Create a directory with mode 0700. The parent must exist.
    async fn mkdir(&self, path: &str) -> Result<()>;

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Recursively remove a single file or directory
    async fn remove_item(&self, path: &str) -> Result<()>;

    /// Copy a single file or directory tree to `target`
    async fn copy_item(&self, source: &str, target: &str) -> Result<()>;

    /// Apply `mode` to a single item, and to its whole subtree if `recursive`
    async fn chmod_item(&self, path: &str, mode: u32, recursive: bool) -> Result<()>;

    /// Stream `reader` into `destination/file_name`, creating or truncating it
    async fn upload_file(
        &self,
        destination: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        file_name: &str,
    ) -> Result<()>;

    /// Text content of a file of at most [`crate::MAX_CONTENT_SIZE`] bytes,
    /// decoded as ISO-8859-1
    async fn get_content(&self, path: &str) -> Result<String>;

    /// Overwrite a file with `content`
    async fn edit(&self, path: &str, content: &str) -> Result<()>;

    /// Release the connection. Safe to call repeatedly and on an explorer
    /// whose `init` failed.
    async fn close(&self) -> Result<()>;

    /// Rename each item into `destination`, keeping its name
    async fn move_items(&self, items: &[String], destination: &str) -> Result<()> {
        let mut outcome = BulkOutcome::new("move");
        for item in items {
            let target = join_path(destination, base_name(item));
            outcome.record(item, self.rename(item, &target).await);
        }
        outcome.finish()
    }

    /// Copy items into `destination`. A single item is written as
    /// `single_filename` when one is given.
    async fn copy_items(
        &self,
        items: &[String],
        destination: &str,
        single_filename: &str,
    ) -> Result<()> {
        if items.len() > 1 && !single_filename.is_empty() {
            return Err(ExplorerError::InvalidArgument(format!(
                "cannot copy {} items to the single name {:?}",
                items.len(),
                single_filename
            )));
        }

        let mut outcome = BulkOutcome::new("copy");
        for item in items {
            let name = if single_filename.is_empty() {
                base_name(item)
            } else {
                single_filename
            };
            let target = join_path(destination, name);
            outcome.record(item, self.copy_item(item, &target).await);
        }
        outcome.finish()
    }

    async fn delete(&self, items: &[String]) -> Result<()> {
        let mut outcome = BulkOutcome::new("delete");
        for item in items {
            outcome.record(item, self.remove_item(item).await);
        }
        outcome.finish()
    }

    /// `perms_code` is octal. Nothing is touched if it does not parse.
    async fn chmod(&self, items: &[String], perms_code: &str, recursive: bool) -> Result<()> {
        let mode = parse_mode(perms_code)?;
        let mut outcome = BulkOutcome::new("chmod");
        for item in items {
            outcome.record(item, self.chmod_item(item, mode, recursive).await);
        }
        outcome.finish()
    }
}

/// Continue-on-error accumulator for bulk operations
pub struct BulkOutcome {
    op: &'static str,
    failed: usize,
    last_error: Option<ExplorerError>,
}

impl BulkOutcome {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            failed: 0,
            last_error: None,
        }
    }

    pub fn record(&mut self, item: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!("{} failed for {}: {}", self.op, item, e);
            self.failed += 1;
            self.last_error = Some(e);
        }
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn finish(self) -> Result<()> {
        match self.last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            permissions: String::new(),
            size: "0".to_string(),
            date: String::new(),
            kind,
        }
    }

    #[test]
    fn test_sort_dirs_first() {
        let mut entries = vec![
            entry("b.txt", EntryKind::File),
            entry("Zeta", EntryKind::Dir),
            entry("A.txt", EntryKind::File),
            entry("alpha", EntryKind::Dir),
        ];
        sort_entries(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["alpha", "Zeta", "A.txt", "b.txt"]);
    }

    #[test]
    fn test_entry_wire_names() {
        let json = serde_json::to_value(entry("x", EntryKind::Dir)).unwrap();
        assert_eq!(json["type"], "dir");
        assert!(json.get("rights").is_some());
        assert!(json.get("size").is_some());
        assert!(json.get("date").is_some());
    }

    #[test]
    fn test_bulk_outcome_keeps_last_error() {
        let mut outcome = BulkOutcome::new("delete");
        outcome.record("a", Err(ExplorerError::NotFound("a".into())));
        outcome.record("b", Ok(()));
        outcome.record("c", Err(ExplorerError::NotFound("c".into())));
        assert_eq!(outcome.failed(), 2);
        match outcome.finish() {
            Err(ExplorerError::NotFound(p)) => assert_eq!(p, "c"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bulk_outcome_success() {
        let mut outcome = BulkOutcome::new("move");
        outcome.record("a", Ok(()));
        assert!(outcome.finish().is_ok());
    }
}
