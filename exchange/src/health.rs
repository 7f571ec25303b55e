use serde::{Deserialize, Serialize};

/// Connection state of the live market stream.
///
/// `stopped → connecting → live`, with `desynced → reconnecting → live`
/// on sequence gaps, `reconnecting` on transient faults, and `error` as the
/// terminal state for fatal exchange rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Stopped,
    Connecting,
    Live,
    Desynced,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Desynced => "desynced",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// Encoding used by the shared atomic gauge.
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Stopped => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Live => 2,
            ConnectionState::Desynced => 3,
            ConnectionState::Reconnecting => 4,
            ConnectionState::Error => 5,
        }
    }

    pub fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Live,
            3 => ConnectionState::Desynced,
            4 => ConnectionState::Reconnecting,
            5 => ConnectionState::Error,
            _ => ConnectionState::Stopped,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
