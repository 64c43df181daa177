//! Coarse grouping of error codes by their thousands digit

use std::fmt;

use serde::{Deserialize, Serialize};

use super::codes::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    General,
    /// Clustering and sequencing
    Planning,
    /// Route and stop state machine
    Dispatch,
    /// Device sync protocol
    Sync,
    /// Distance matrix provider
    Provider,
    /// Device-side offline queue
    Offline,
    /// Storage and internal faults, anything outside the known ranges
    System,
}

impl ErrorCategory {
    pub fn from_code(code: u16) -> Self {
        match code / 1000 {
            0 => Self::General,
            1 => Self::Planning,
            2 => Self::Dispatch,
            3 => Self::Sync,
            4 => Self::Provider,
            5 => Self::Offline,
            _ => Self::System,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Planning => "planning",
            Self::Dispatch => "dispatch",
            Self::Sync => "sync",
            Self::Provider => "provider",
            Self::Offline => "offline",
            Self::System => "system",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        let cases = [
            (0, ErrorCategory::General),
            (999, ErrorCategory::General),
            (1002, ErrorCategory::Planning),
            (2999, ErrorCategory::Dispatch),
            (3000, ErrorCategory::Sync),
            (4001, ErrorCategory::Provider),
            (5003, ErrorCategory::Offline),
            (6000, ErrorCategory::System),
            (9002, ErrorCategory::System),
        ];
        for (code, expected) in cases {
            assert_eq!(ErrorCategory::from_code(code), expected, "code {code}");
        }
    }

    #[test]
    fn test_codes_land_in_their_category() {
        assert_eq!(ErrorCode::InfeasibleAssignment.category(), ErrorCategory::Planning);
        assert_eq!(ErrorCode::StopNotFound.category(), ErrorCategory::Dispatch);
        assert_eq!(ErrorCode::NotSubscribed.category(), ErrorCategory::Sync);
        assert_eq!(ErrorCode::OfflineReplayExhausted.category(), ErrorCategory::Offline);
        assert_eq!(ErrorCode::DatabaseError.category(), ErrorCategory::System);
    }

    #[test]
    fn test_wire_name_matches_display() {
        let json = serde_json::to_string(&ErrorCategory::Offline).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorCategory::Offline));
        let back: ErrorCategory = serde_json::from_str("\"sync\"").unwrap();
        assert_eq!(back, ErrorCategory::Sync);
    }
}
