//! SNAC command identity.

use std::fmt;

/// Identifies a kind of SNAC command by its `(family, subtype)` pair.
///
/// OSCAR groups commands into numbered families ("foodgroups"); within a
/// family each command carries a subtype. Rate limiting is keyed on this
/// pair: the server's rate-class snapshot lists the `CmdType`s that belong to
/// each class. Two values compare equal exactly when both numbers match,
/// which makes the type usable directly as a routing-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CmdType {
    family: u16,
    subtype: u16,
}

impl CmdType {
    /// Creates a command type from a family and a subtype number.
    #[must_use]
    pub const fn new(family: u16, subtype: u16) -> Self {
        Self { family, subtype }
    }

    /// Returns the family ("foodgroup") number.
    #[must_use]
    pub const fn family(self) -> u16 {
        self.family
    }

    /// Returns the subtype number within the family.
    #[must_use]
    pub const fn subtype(self) -> u16 {
        self.subtype
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}/0x{:04x}", self.family, self.subtype)
    }
}

/// Well-known OSCAR family ("foodgroup") numbers.
///
/// The scheduler treats family numbers as opaque; these constants exist for
/// callers and tests that build `CmdType`s by hand.
pub mod family {
    /// Generic service controls; rate parameters live here.
    pub const OSERVICE: u16 = 0x0001;
    /// Location services (user info, away messages).
    pub const LOCATE: u16 = 0x0002;
    /// Buddy list management.
    pub const BUDDY: u16 = 0x0003;
    /// Instant messaging (ICBM).
    pub const ICBM: u16 = 0x0004;
    /// Invitation services.
    pub const INVITE: u16 = 0x0006;
    /// Administrative account functions.
    pub const ADMIN: u16 = 0x0007;
    /// Privacy management.
    pub const PRIVACY: u16 = 0x0009;
    /// Usage statistics reports.
    pub const STATS: u16 = 0x000b;
    /// Chat room navigation.
    pub const CHAT_NAV: u16 = 0x000d;
    /// Chat rooms.
    pub const CHAT: u16 = 0x000e;
    /// Server-stored buddy lists (feedbag/SSI).
    pub const SSI: u16 = 0x0013;
    /// ICQ-specific extensions.
    pub const ICQ: u16 = 0x0015;
    /// Authorization and registration (BUCP).
    pub const AUTH: u16 = 0x0017;
}

/// OSERVICE subtypes involved in rate-limit negotiation.
pub mod oservice {
    /// Client requests the current rate parameters.
    pub const RATE_PARAMS_REQUEST: u16 = 0x0006;
    /// Server replies with the full rate-class snapshot.
    pub const RATE_PARAMS_REPLY: u16 = 0x0007;
    /// Client acknowledges the classes it will honor.
    pub const RATE_PARAMS_ACK: u16 = 0x0008;
    /// Server pushes a rate-change notification.
    pub const RATE_CHANGE: u16 = 0x000a;
}
