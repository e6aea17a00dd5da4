//! Balance health classification and billing arithmetic.

use serde::{Deserialize, Serialize};

/// Derived classification of a user's balance; drives all enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Normal,
    Warning,
    Limited,
    Blocked,
}

impl UserStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Limited => "limited",
            Self::Blocked => "blocked",
        }
    }

    /// Parse a stored status string. Unknown values read as `normal`.
    pub fn parse(s: &str) -> Self {
        match s {
            "warning" => Self::Warning,
            "limited" => Self::Limited,
            "blocked" => Self::Blocked,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status table: negative -> blocked, then the limited / warning thresholds.
/// Callers guarantee `warning_threshold >= limited_threshold >= 0`.
pub fn status_for_balance(balance: f64, warning_threshold: f64, limited_threshold: f64) -> UserStatus {
    if balance < 0.0 {
        UserStatus::Blocked
    } else if balance <= limited_threshold {
        UserStatus::Limited
    } else if balance <= warning_threshold {
        UserStatus::Warning
    } else {
        UserStatus::Normal
    }
}

/// Half-up rounding to 4 decimal places. Costs are non-negative.
pub fn round4(v: f64) -> f64 {
    (v * 10000.0 + 0.5).floor() / 10000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table() {
        assert_eq!(status_for_balance(-0.01, 20.0, 5.0), UserStatus::Blocked);
        assert_eq!(status_for_balance(0.0, 20.0, 5.0), UserStatus::Limited);
        assert_eq!(status_for_balance(5.0, 20.0, 5.0), UserStatus::Limited);
        assert_eq!(status_for_balance(5.01, 20.0, 5.0), UserStatus::Warning);
        assert_eq!(status_for_balance(20.0, 20.0, 5.0), UserStatus::Warning);
        assert_eq!(status_for_balance(20.01, 20.0, 5.0), UserStatus::Normal);
    }

    #[test]
    fn round4_is_half_up() {
        assert_eq!(round4(0.00005), 0.0001);
        assert_eq!(round4(0.00004), 0.0);
        assert_eq!(round4(2.0), 2.0);
        assert_eq!(round4(0.1), 0.1);
        assert_eq!(round4(1.23455), 1.2346);
    }

    #[test]
    fn parse_round_trips() {
        for status in [
            UserStatus::Normal,
            UserStatus::Warning,
            UserStatus::Limited,
            UserStatus::Blocked,
        ] {
            assert_eq!(UserStatus::parse(status.as_str()), status);
        }
        assert_eq!(UserStatus::parse("garbage"), UserStatus::Normal);
    }
}
