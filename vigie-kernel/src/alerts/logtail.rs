//! Collecteurs `tail -F` sur l'hôte du kernel (auth.log, fail2ban.log).
//!
//! Chaque `tail` tourne dans son propre groupe de processus : à l'arrêt le
//! groupe reçoit SIGTERM, puis SIGKILL s'il n'est pas sorti sous 2s.

use super::logs::{LogForwarder, ParsedLogEvent};
use crate::state::unix_now;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vigie_proto::{parse_auth_line, parse_ban_line};

pub const STOP_GRACE: Duration = Duration::from_secs(2);
const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailKind {
    Auth,
    Ban,
}

impl TailKind {
    fn as_str(&self) -> &'static str {
        match self {
            TailKind::Auth => "auth",
            TailKind::Ban => "ban",
        }
    }
}

/// Les événements de l'hôte du kernel n'ont pas de token de nœud.
pub fn parse_line(kind: TailKind, line: &str, timestamp: i64) -> Option<ParsedLogEvent> {
    match kind {
        TailKind::Auth => parse_auth_line(line).map(|accept| ParsedLogEvent::Login {
            node_token: None,
            node_name: None,
            accept,
            timestamp,
        }),
        TailKind::Ban => parse_ban_line(line).map(|ban| ParsedLogEvent::Ban {
            node_token: None,
            node_name: None,
            ban,
            timestamp,
        }),
    }
}

pub struct LogTail {
    kind: TailKind,
    path: PathBuf,
    forwarder: Arc<LogForwarder>,
}

impl LogTail {
    pub fn new(kind: TailKind, path: PathBuf, forwarder: Arc<LogForwarder>) -> Self {
        Self { kind, path, forwarder }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new("tail")
            .arg("-F")
            .arg("-n")
            .arg("0")
            .arg(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let mut child = match self.spawn_child() {
                Ok(child) => child,
                Err(e) => {
                    warn!("{} tail on {} failed to start: {e}", self.kind.as_str(), self.path.display());
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_DELAY) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };
            info!("{} tail started on {}", self.kind.as_str(), self.path.display());

            let Some(stdout) = child.stdout.take() else {
                terminate(&mut child).await;
                return;
            };
            let mut lines = BufReader::new(stdout).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_line(self.kind, &line, unix_now()) {
                                self.forwarder.forward(event, Instant::now());
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                    _ = shutdown.changed() => {
                        terminate(&mut child).await;
                        return;
                    }
                }
            }

            warn!("{} tail exited, restarting in {}s", self.kind.as_str(), RESTART_DELAY.as_secs());
            let _ = child.wait().await;
            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

/// SIGTERM au groupe, attente bornée, puis SIGKILL.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!("SIGTERM to tail group {pid} failed: {e}");
    }
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => debug!("tail group {pid} stopped"),
        Err(_) => {
            warn!("tail group {pid} ignored SIGTERM, killing");
            let _ = killpg(group, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusEvent, EventBus};
    use std::io::Write;

    #[test]
    fn test_parse_line_by_kind() {
        let auth = "sshd[1]: Accepted password for admin from 192.0.2.7 port 22 ssh2";
        let ban = "2024-01-01 fail2ban.actions [812]: NOTICE [sshd] Ban 198.51.100.4";
        assert!(matches!(parse_line(TailKind::Auth, auth, 5), Some(ParsedLogEvent::Login { timestamp: 5, .. })));
        assert!(parse_line(TailKind::Auth, ban, 5).is_none());
        match parse_line(TailKind::Ban, ban, 6) {
            Some(ParsedLogEvent::Ban { ban, node_token, .. }) => {
                assert_eq!(ban.jail, "sshd");
                assert!(node_token.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tail_forwards_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(&path, "").unwrap();

        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let forwarder = Arc::new(LogForwarder::new(bus.clone()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(LogTail::new(TailKind::Auth, path.clone(), forwarder).run(rx));

        let mut received = None;
        for i in 0..40 {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "sshd[9]: Accepted publickey for user{i} from 203.0.113.{i} port 1 ssh2").unwrap();
            if let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(250), sub.recv_event()).await {
                received = Some(ev);
                break;
            }
        }
        assert!(matches!(received, Some(BusEvent::Login { .. })));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
