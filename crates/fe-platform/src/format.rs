// Rendering helpers shared by every explorer backend

use std::time::SystemTime;

use chrono::{DateTime, Local, TimeZone};

use crate::error::{ExplorerError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

/// Render a raw `st_mode` as an `ls -l` style string, e.g. `drwxr-xr-x`
pub fn permission_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFSOCK => 's',
        S_IFBLK => 'b',
        S_IFCHR => 'c',
        S_IFIFO => 'p',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);

    // (read, write, exec, special bit, special char when exec set / unset)
    let triads = [
        (0o400, 0o200, 0o100, 0o4000, ('s', 'S')),
        (0o040, 0o020, 0o010, 0o2000, ('s', 'S')),
        (0o004, 0o002, 0o001, 0o1000, ('t', 'T')),
    ];
    for (r, w, x, special, (set, unset)) in triads {
        out.push(if mode & r != 0 { 'r' } else { '-' });
        out.push(if mode & w != 0 { 'w' } else { '-' });
        out.push(match (mode & x != 0, mode & special != 0) {
            (true, true) => set,
            (false, true) => unset,
            (true, false) => 'x',
            (false, false) => '-',
        });
    }
    out
}

/// `YYYY-MM-DD HH:MM:SS` in the server's local time
pub fn format_system_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_unix_time(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(t) => t.format(TIMESTAMP_FORMAT).to_string(),
        None => String::new(),
    }
}

/// Parse an octal permission code such as `"755"` or `"0644"`
pub fn parse_mode(code: &str) -> Result<u32> {
    let trimmed = code.trim();
    match u32::from_str_radix(trimmed, 8) {
        Ok(mode) if !trimmed.is_empty() && mode <= 0o7777 => Ok(mode),
        _ => Err(ExplorerError::InvalidMode(code.to_string())),
    }
}

/// Decode ISO-8859-1 bytes and normalize line endings to `\n`.
/// A trailing newline is not preserved.
pub fn decode_latin1_lines(bytes: &[u8]) -> String {
    let text: String = bytes.iter().map(|&b| b as char).collect();
    text.lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Join a request path and a child name with `/`
pub fn join_path(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last path component of a request path, ignoring trailing slashes
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_string() {
        assert_eq!(permission_string(0o040755), "drwxr-xr-x");
        assert_eq!(permission_string(0o100644), "-rw-r--r--");
        assert_eq!(permission_string(0o120777), "lrwxrwxrwx");
        assert_eq!(permission_string(0o104755), "-rwsr-xr-x");
        assert_eq!(permission_string(0o041777), "drwxrwxrwt");
        assert_eq!(permission_string(0o100000), "----------");
    }

    #[test]
    fn test_parse_mode_is_octal() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert!(matches!(parse_mode("abc"), Err(ExplorerError::InvalidMode(_))));
        assert!(matches!(parse_mode("789"), Err(ExplorerError::InvalidMode(_))));
        assert!(matches!(parse_mode(""), Err(ExplorerError::InvalidMode(_))));
        assert!(matches!(parse_mode("17777"), Err(ExplorerError::InvalidMode(_))));
    }

    #[test]
    fn test_decode_latin1_lines() {
        assert_eq!(decode_latin1_lines(b"a\r\nb\nc\n"), "a\nb\nc");
        assert_eq!(decode_latin1_lines(&[0x63, 0x61, 0x66, 0xe9]), "caf\u{e9}");
        assert_eq!(decode_latin1_lines(b""), "");
        assert_eq!(decode_latin1_lines(b"a\r\nb\r"), "a\nb");
    }

    #[test]
    fn test_format_unix_time_shape() {
        let s = format_unix_time(0);
        assert_eq!(s.len(), 19);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[13..14], ":");
    }

    #[test]
    fn test_join_and_base_name() {
        assert_eq!(join_path("/tmp", "a.txt"), "/tmp/a.txt");
        assert_eq!(join_path("/tmp/", "/a.txt"), "/tmp/a.txt");
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(base_name("/tmp/dir/"), "dir");
        assert_eq!(base_name("file"), "file");
    }
}
