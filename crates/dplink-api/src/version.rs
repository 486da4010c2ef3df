// ── Protocol versions ──
//
// Devices implement one of several incompatible revisions of the local
// protocol and do not announce which. Sessions negotiate by trying
// candidates in a fixed order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One revision of the local device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V3_1,
    V3_2,
    V3_3,
    V3_4,
    V3_5,
    /// 3.3 framing with the 3.2 device-type quirks; needs auto-detection
    /// enabled in the transport.
    V3_22,
}

impl ProtocolVersion {
    /// Default negotiation order: most common first, exotic last.
    pub const DEFAULT_CANDIDATES: [Self; 6] = [
        Self::V3_3,
        Self::V3_1,
        Self::V3_2,
        Self::V3_4,
        Self::V3_5,
        Self::V3_22,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V3_1 => "3.1",
            Self::V3_2 => "3.2",
            Self::V3_3 => "3.3",
            Self::V3_4 => "3.4",
            Self::V3_5 => "3.5",
            Self::V3_22 => "3.22",
        }
    }

    /// Whether the transport should run its own device-type detection
    /// when talking this revision.
    pub fn needs_type_detection(self) -> bool {
        matches!(self, Self::V3_22)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "3.1" => Ok(Self::V3_1),
            "3.2" => Ok(Self::V3_2),
            "3.3" => Ok(Self::V3_3),
            "3.4" => Ok(Self::V3_4),
            "3.5" => Ok(Self::V3_5),
            "3.22" => Ok(Self::V3_22),
            other => Err(crate::Error::ProtocolMismatch {
                message: format!("unknown protocol version '{other}'"),
            }),
        }
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = VersionText::deserialize(deserializer)?;
        raw.0.parse().map_err(serde::de::Error::custom)
    }
}

/// Accepts `3.3` as well as `"3.3"` in config files.
struct VersionText(String);

impl<'de> Deserialize<'de> for VersionText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self(n.to_string()),
            Raw::Text(s) => Self(s),
        })
    }
}

// ── VersionSelector ─────────────────────────────────────────────────

/// How a session picks its protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSelector {
    /// Negotiate over the candidate list.
    #[default]
    Auto,
    /// Always use this version; never rotate.
    Pinned(ProtocolVersion),
}

impl VersionSelector {
    pub fn is_auto(self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Pinned(v) => v.fmt(f),
        }
    }
}

impl FromStr for VersionSelector {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.parse().map(Self::Pinned)
        }
    }
}

impl Serialize for VersionSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = VersionText::deserialize(deserializer)?;
        raw.0.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for v in ProtocolVersion::DEFAULT_CANDIDATES {
            assert_eq!(v.to_string().parse::<ProtocolVersion>().unwrap(), v);
        }
        assert!("3.9".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn selector_parses_auto_case_insensitively() {
        assert_eq!("AUTO".parse::<VersionSelector>().unwrap(), VersionSelector::Auto);
        assert_eq!(
            "3.4".parse::<VersionSelector>().unwrap(),
            VersionSelector::Pinned(ProtocolVersion::V3_4)
        );
    }

    #[test]
    fn selector_deserializes_from_number_or_string() {
        let v: VersionSelector = serde_json::from_str("3.3").unwrap();
        assert_eq!(v, VersionSelector::Pinned(ProtocolVersion::V3_3));
        let v: VersionSelector = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(v, VersionSelector::Auto);
    }

    #[test]
    fn only_3_22_needs_type_detection() {
        assert!(ProtocolVersion::V3_22.needs_type_detection());
        assert!(!ProtocolVersion::V3_3.needs_type_detection());
    }
}
