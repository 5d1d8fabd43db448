//! Gateway protocol versioning.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use temlink_core::DomainError;

/// Version of the gateway wire protocol, `major.minor`.
///
/// Peers are compatible when their major versions match; minor bumps only
/// add message types or optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::ParseError {
            field: "protocol_version".to_string(),
            reason: format!("expected 'major.minor', got '{s}'"),
        };
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!("1.3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(1, 3));
        assert!("1".parse::<ProtocolVersion>().is_err());
        assert!("1.0.0".parse::<ProtocolVersion>().is_err());
        assert!("one.two".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_major_must_match() {
        assert!(ProtocolVersion::new(1, 4).is_compatible_with(&ProtocolVersion::CURRENT));
        assert!(!ProtocolVersion::new(2, 0).is_compatible_with(&ProtocolVersion::CURRENT));
        assert_eq!(ProtocolVersion::CURRENT.to_string(), "1.0");
    }
}
