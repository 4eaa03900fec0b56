//! Incremental reader for the node's SSH auth log.
//!
//! Polled once per heartbeat cycle: only complete lines appended since the
//! previous poll are parsed. A file that shrinks (rotation, truncation) is
//! re-read from the start.

use chrono::{DateTime, Local};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, warn};
use vigie_proto::{parse_auth_line, LoginEvent};

pub struct AuthLogTailer {
    path: PathBuf,
    /// `None` until the first poll, which skips existing history.
    offset: Option<u64>,
}

impl AuthLogTailer {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: None }
    }

    pub fn poll(&mut self) -> Vec<LoginEvent> {
        match self.read_new_lines() {
            Ok(lines) => lines.iter().filter_map(|l| to_login_event(l, Local::now())).collect(),
            Err(e) => {
                debug!("auth log {} unreadable: {e}", self.path.display());
                Vec::new()
            }
        }
    }

    fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = std::fs::File::open(&self.path)?;
        let len = file.metadata()?.len();

        let start = match self.offset {
            None => {
                self.offset = Some(len);
                return Ok(Vec::new());
            }
            Some(offset) if len < offset => {
                warn!("auth log {} shrank, reading from start", self.path.display());
                0
            }
            Some(offset) => offset,
        };
        if len == start {
            self.offset = Some(start);
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.take(len - start).read_to_end(&mut buf)?;

        // a trailing partial line is left for the next poll
        let complete = buf.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
        self.offset = Some(start + complete as u64);
        Ok(String::from_utf8_lossy(&buf[..complete]).lines().map(str::to_owned).collect())
    }
}

fn to_login_event(line: &str, now: DateTime<Local>) -> Option<LoginEvent> {
    let accept = parse_auth_line(line)?;
    Some(LoginEvent {
        user: accept.user,
        ip: accept.ip,
        method: accept.method,
        timestamp: now.timestamp(),
        node_time_str: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        tz_label: now.format("%Z").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vigie_proto::LoginMethod;

    const ACCEPT: &str = "Mar  3 10:00:01 vps sshd[811]: Accepted password for deploy from 198.51.100.20 port 40022 ssh2";

    fn append(path: &std::path::Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_history_skipped_then_new_lines_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, &format!("{ACCEPT}\n"));

        let mut tailer = AuthLogTailer::new(path.clone());
        assert!(tailer.poll().is_empty());

        append(&path, &format!("noise line\n{ACCEPT}\n"));
        let events = tailer.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user, "deploy");
        assert_eq!(events[0].method, LoginMethod::Password);
        assert!(tailer.poll().is_empty());
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "");
        let mut tailer = AuthLogTailer::new(path.clone());
        tailer.poll();

        let (head, tail) = ACCEPT.split_at(30);
        append(&path, head);
        assert!(tailer.poll().is_empty());
        append(&path, &format!("{tail}\n"));
        assert_eq!(tailer.poll().len(), 1);
    }

    #[test]
    fn test_truncation_rereads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, &"x".repeat(500));
        let mut tailer = AuthLogTailer::new(path.clone());
        tailer.poll();

        std::fs::write(&path, format!("{ACCEPT}\n")).unwrap();
        assert_eq!(tailer.poll().len(), 1);
    }

    #[test]
    fn test_missing_file_is_quiet() {
        let mut tailer = AuthLogTailer::new(PathBuf::from("/nonexistent/auth.log"));
        assert!(tailer.poll().is_empty());
    }
}
