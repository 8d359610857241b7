//! Rate-change notification codes.

/// Code carried by a server "rate changed" notification.
///
/// Only `Limited` and `LimitCleared` move a class's limited flag; every
/// other code is informational. Servers have grown codes over the years, so
/// unrecognized values pass through as [`RateChangeCode::Other`] rather than
/// failing the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RateChangeCode {
    /// The class's parameters changed.
    ParamsChanged,
    /// The class is approaching its limit.
    Warning,
    /// The server has started rate-limiting the class.
    Limited,
    /// The server has stopped rate-limiting the class.
    LimitCleared,
    /// A code this implementation does not recognize.
    Other(u16),
}

impl RateChangeCode {
    /// Maps a wire code to its meaning.
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        match code {
            1 => Self::ParamsChanged,
            2 => Self::Warning,
            3 => Self::Limited,
            4 => Self::LimitCleared,
            other => Self::Other(other),
        }
    }

    /// The wire value for this code.
    #[must_use]
    pub fn as_raw(self) -> u16 {
        match self {
            Self::ParamsChanged => 1,
            Self::Warning => 2,
            Self::Limited => 3,
            Self::LimitCleared => 4,
            Self::Other(code) => code,
        }
    }

    /// Whether the code leaves the limited flag alone.
    #[must_use]
    pub fn is_informational(self) -> bool {
        !matches!(self, Self::Limited | Self::LimitCleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_variants() {
        assert_eq!(RateChangeCode::from_raw(1), RateChangeCode::ParamsChanged);
        assert_eq!(RateChangeCode::from_raw(2), RateChangeCode::Warning);
        assert_eq!(RateChangeCode::from_raw(3), RateChangeCode::Limited);
        assert_eq!(RateChangeCode::from_raw(4), RateChangeCode::LimitCleared);
    }

    #[test]
    fn unknown_codes_are_preserved_not_rejected() {
        let code = RateChangeCode::from_raw(9);
        assert_eq!(code, RateChangeCode::Other(9));
        assert_eq!(code.as_raw(), 9);
        assert!(code.is_informational());
    }

    #[test]
    fn only_limit_codes_move_the_flag() {
        assert!(RateChangeCode::ParamsChanged.is_informational());
        assert!(RateChangeCode::Warning.is_informational());
        assert!(!RateChangeCode::Limited.is_informational());
        assert!(!RateChangeCode::LimitCleared.is_informational());
    }
}
