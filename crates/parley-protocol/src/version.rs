//! Protocol versioning.
//!
//! Clients may name the major version they speak with `?version=` when
//! opening the socket. Only the major number has to match.

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version advertised in the `connected` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Whether a client asking for `requested_major` can be served.
    /// A client that names no version is accepted.
    #[must_use]
    pub fn accepts(&self, requested_major: Option<u8>) -> bool {
        requested_major.map_or(true, |major| major == self.major)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_matching_major_only() {
        assert!(PROTOCOL_VERSION.accepts(None));
        assert!(PROTOCOL_VERSION.accepts(Some(PROTOCOL_VERSION.major)));
        assert!(!PROTOCOL_VERSION.accepts(Some(PROTOCOL_VERSION.major + 1)));
    }

    #[test]
    fn test_advertised_as_major_dot_minor() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
