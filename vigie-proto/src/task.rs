use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Commands the kernel can hand to a node on a heartbeat response.
///
/// The set is closed: an unknown command in a heartbeat body makes the
/// whole body malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Selftest,
    Uptime,
    Traffic,
    Top,
    Speedtest,
    Reboot,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Selftest,
        TaskKind::Uptime,
        TaskKind::Traffic,
        TaskKind::Top,
        TaskKind::Speedtest,
        TaskKind::Reboot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Selftest => "selftest",
            TaskKind::Uptime => "uptime",
            TaskKind::Traffic => "traffic",
            TaskKind::Top => "top",
            TaskKind::Speedtest => "speedtest",
            TaskKind::Reboot => "reboot",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        for kind in TaskKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("shutdown".parse::<TaskKind>().is_err());
    }
}
