//! Tagged-string icon encoding.
//!
//! An icon is stored in the document as a single string `"{kind}:{payload}"`
//! so that last-write-wins resolution always yields a well-formed icon.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EpicenterError;

/// An icon reference attached to tables and KV entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Icon {
    /// `emoji:📝`
    Emoji(String),
    /// `lucide:file-text`
    Lucide(String),
    /// `url:https://example.com/icon.png`
    Url(String),
}

impl Icon {
    pub fn kind(&self) -> &'static str {
        match self {
            Icon::Emoji(_) => "emoji",
            Icon::Lucide(_) => "lucide",
            Icon::Url(_) => "url",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Icon::Emoji(p) | Icon::Lucide(p) | Icon::Url(p) => p,
        }
    }
}

impl fmt::Display for Icon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.payload())
    }
}

impl FromStr for Icon {
    type Err = EpicenterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EpicenterError::InvalidIcon(s.to_string());
        let (kind, payload) = s.split_once(':').ok_or_else(invalid)?;
        if payload.is_empty() {
            return Err(invalid());
        }
        let payload = payload.to_string();
        match kind {
            "emoji" => Ok(Icon::Emoji(payload)),
            "lucide" => Ok(Icon::Lucide(payload)),
            "url" => Ok(Icon::Url(payload)),
            _ => Err(invalid()),
        }
    }
}

impl Serialize for Icon {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Icon {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse an icon read back from the document, tolerating garbage.
pub(crate) fn parse_stored(raw: Option<String>) -> Option<Icon> {
    let raw = raw?;
    match raw.parse() {
        Ok(icon) => Some(icon),
        Err(e) => {
            log::warn!("Ignoring malformed stored icon: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_kind() {
        assert_eq!("emoji:📝".parse::<Icon>().unwrap(), Icon::Emoji("📝".into()));
        assert_eq!(
            "lucide:file-text".parse::<Icon>().unwrap(),
            Icon::Lucide("file-text".into())
        );
        assert_eq!(
            "url:https://example.com/a.png".parse::<Icon>().unwrap(),
            Icon::Url("https://example.com/a.png".into())
        );
    }

    #[test]
    fn test_rejects_unknown_kind_and_empty_payload() {
        assert!("svg:<svg/>".parse::<Icon>().is_err());
        assert!("emoji:".parse::<Icon>().is_err());
        assert!("no-colon".parse::<Icon>().is_err());
    }

    #[test]
    fn test_serde_uses_tagged_string() {
        let icon = Icon::Lucide("table".into());
        assert_eq!(serde_json::to_string(&icon).unwrap(), "\"lucide:table\"");
        let back: Icon = serde_json::from_str("\"lucide:table\"").unwrap();
        assert_eq!(back, icon);
    }
}
