// SSH/SFTP backend

pub mod filesystem;

pub use filesystem::{RemoteFileExplorer, SshOptions};
