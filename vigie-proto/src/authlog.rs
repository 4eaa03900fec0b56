//! Log line parsing for sshd accepts and fail2ban bans.
//!
//! Both the agent (tailing the node's auth log) and the kernel (optional
//! tails on its own host) feed raw lines through here.

use crate::wire::LoginMethod;
use serde::{Deserialize, Serialize};

/// Successful authentication extracted from an sshd line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAccept {
    pub user: String,
    pub ip: String,
    pub method: LoginMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEvent {
    pub jail: String,
    pub ip: String,
}

/// Parses `... sshd[123]: Accepted publickey for root from 203.0.113.9 port 51234 ssh2`.
pub fn parse_auth_line(line: &str) -> Option<AuthAccept> {
    let rest = &line[line.find("Accepted ")? + "Accepted ".len()..];
    let mut words = rest.split_whitespace();

    let method = match words.next()? {
        "password" | "keyboard-interactive/pam" => LoginMethod::Password,
        "publickey" => LoginMethod::Publickey,
        _ => return None,
    };
    if words.next()? != "for" {
        return None;
    }
    // "for invalid user bob from" never reaches "Accepted", but usernames
    // are single tokens so the next word is the user.
    let user = words.next()?.to_string();
    if words.next()? != "from" {
        return None;
    }
    let ip = words.next()?.to_string();

    Some(AuthAccept { user, ip, method })
}

/// Parses `... fail2ban.actions [812]: NOTICE [sshd] Ban 198.51.100.4`.
/// Unban and "already banned" lines are ignored.
pub fn parse_ban_line(line: &str) -> Option<BanEvent> {
    if !line.contains("fail2ban.actions") {
        return None;
    }
    let open = line.rfind('[')?;
    let close = open + line[open..].find(']')?;
    let jail = line[open + 1..close].trim().to_string();

    let mut words = line[close + 1..].split_whitespace();
    if words.next()? != "Ban" {
        return None;
    }
    let ip = words.next()?.to_string();
    if jail.is_empty() || ip.is_empty() {
        return None;
    }
    Some(BanEvent { jail, ip })
}
