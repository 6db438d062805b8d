// Backend-independent file explorer contract

pub mod error;
pub mod filesystem;
pub mod format;

pub use error::{ExplorerError, Result, MAX_CONTENT_SIZE};
pub use filesystem::{BulkOutcome, DirectoryEntry, EntryKind, FileExplorer};
