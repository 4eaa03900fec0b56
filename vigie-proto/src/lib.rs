//! Vigie protocol - what travels between a node agent and the kernel
//!
//! - Heartbeat request/response bodies (`POST /heartbeat`)
//! - Closed set of task kinds dispatched to nodes
//! - i18n-tagged result payloads (rendering stays on the kernel side)
//! - HMAC-SHA256 body signatures keyed by the node token
//! - Parsing of sshd / fail2ban log lines, used by both sides

pub mod authlog;
pub mod signing;
pub mod task;
pub mod wire;

pub use authlog::{parse_auth_line, parse_ban_line, BanEvent};
pub use signing::{sign_body, verify_body};
pub use task::TaskKind;
pub use wire::*;

/// Header carrying the hex HMAC of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Maximum accepted distance between a heartbeat timestamp and the kernel clock.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Rolling metric history kept per node.
pub const HISTORY_CAP: usize = 60;

/// Node tokens are 128 random bits rendered as lowercase hex.
pub const TOKEN_HEX_LEN: usize = 32;

/// Returns true if `s` looks like a node token (32 hex chars).
pub fn is_token_shaped(s: &str) -> bool {
    s.len() == TOKEN_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Short, log-safe prefix of a token.
pub fn token_prefix(token: &str) -> &str {
    token.get(..6).unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        assert!(is_token_shaped("0123456789abcdef0123456789abcdef"));
        assert!(!is_token_shaped("0123456789abcdef"));
        assert!(!is_token_shaped("0123456789abcdef0123456789abcdez"));
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdef0123"), "abcdef");
        assert_eq!(token_prefix("abc"), "abc");
    }
}
