//! Client keys used to bucket all admission state.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Bucket used for requests whose address could not be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Identifier (normally the source address) that bans, rate windows and
/// login lockouts are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    /// Build a key from a raw address string.
    ///
    /// Surrounding whitespace is trimmed; empty input lands in the shared
    /// [`UNKNOWN_CLIENT`] bucket rather than being rejected.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            Self::unknown()
        } else {
            Self(trimmed.to_string())
        }
    }

    /// The shared bucket for clients without a usable address.
    #[must_use]
    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    /// Whether this is the shared unknown bucket.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CLIENT
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl From<&str> for ClientKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ClientKey {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl AsRef<str> for ClientKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
