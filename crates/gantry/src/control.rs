//! Control-channel protocol: the frames exchanged between `gantry-manager`,
//! server processes, and `gantry-ctl`.
//!
//! Control frames use the same packet framing as data listeners; the command
//! tag selects the operation and the payload is a JSON document.

use serde_json::json;

/// Well-known default path of the manager control socket.
pub const DEFAULT_MANAGER_SOCKET: &str = "/var/run/gantry-manager.sock";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Server processes announce themselves after connecting.
    Hello,
    /// Ask for a status snapshot.
    Status,
    /// Reload the script on every connected server.
    Reload,
    /// Reopen log files (after rotation).
    ReopenLogs,
    /// Graceful shutdown.
    Shutdown,
}

impl Command {
    pub fn tag(self) -> u32 {
        match self {
            Self::Hello => 1,
            Self::Status => 2,
            Self::Reload => 3,
            Self::ReopenLogs => 4,
            Self::Shutdown => 5,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Hello),
            2 => Some(Self::Status),
            3 => Some(Self::Reload),
            4 => Some(Self::ReopenLogs),
            5 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// Payload a server sends with `Hello`.
pub fn hello_payload(app_name: &str, pid: u32) -> Vec<u8> {
    json!({ "app": app_name, "pid": pid }).to_string().into_bytes()
}

/// Generic ack payload for commands without a structured reply.
pub fn ack_payload(command: &str) -> Vec<u8> {
    json!({ "ok": true, "command": command }).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for cmd in [
            Command::Hello,
            Command::Status,
            Command::Reload,
            Command::ReopenLogs,
            Command::Shutdown,
        ] {
            assert_eq!(Command::from_tag(cmd.tag()), Some(cmd));
        }
        assert_eq!(Command::from_tag(0), None);
        assert_eq!(Command::from_tag(99), None);
    }
}
