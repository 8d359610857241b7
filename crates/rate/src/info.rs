//! Server-advertised rate-class parameters.

use snac::CmdType;
use std::fmt;

/// Server-assigned rate class number.
///
/// Classes are numbered from 1 in rate-parameter snapshots; the number is
/// meaningful only within its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateClassId(pub u16);

impl fmt::Display for RateClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The server's belief about a class at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RateState {
    /// Sends are flowing normally.
    Normal,
    /// The server is currently dropping or rejecting this class's commands.
    Limited,
}

/// One rate class as described by a server snapshot.
///
/// All averages and the window are in milliseconds, held as `u64` because
/// threshold arithmetic multiplies them by the window size. The
/// thresholds are ordered `disconnect_avg <= limited_avg <= warn_avg <=
/// clear_avg` on real servers, but nothing here assumes it. `warn_avg` and
/// `disconnect_avg` ride along for diagnostics; the scheduler's own
/// decisions use only the clear/limited pair.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateClassInfo {
    /// Server-assigned class number.
    pub id: RateClassId,
    /// Number of commands the running average is smoothed over.
    pub window_size: u64,
    /// Average above which a limited class recovers.
    pub clear_avg: u64,
    /// Average below which the server sends warnings.
    pub warn_avg: u64,
    /// Average below which the server rate-limits the class.
    pub limited_avg: u64,
    /// Average below which the server may drop the connection.
    pub disconnect_avg: u64,
    /// Server-observed running average at snapshot time.
    pub current_avg: u64,
    /// Ceiling for the running average.
    pub max: u64,
    /// The server's belief about the class when the snapshot was taken.
    pub server_state: RateState,
    /// Commands that count against this class. An empty list marks the
    /// connection's default class, which absorbs every command not claimed
    /// by another class.
    pub commands: Vec<CmdType>,
}

impl RateClassInfo {
    /// Whether this is the connection's default/fallback class.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snac::family;

    #[test]
    fn empty_command_list_marks_the_default_class() {
        let default = RateClassInfo {
            id: RateClassId(1),
            window_size: 80,
            clear_avg: 2500,
            warn_avg: 3000,
            limited_avg: 2000,
            disconnect_avg: 1500,
            current_avg: 6000,
            max: 6000,
            server_state: RateState::Normal,
            commands: Vec::new(),
        };
        assert!(default.is_default());

        let mut specific = default;
        specific.commands = vec![CmdType::new(family::ICBM, 0x0006)];
        assert!(!specific.is_default());
    }

    #[test]
    fn class_id_displays_as_bare_number() {
        assert_eq!(RateClassId(3).to_string(), "3");
    }
}
