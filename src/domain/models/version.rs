//! Controller version.
//!
//! Every job records the version of the controller that launched it. The
//! version is kept as a comparable value; the label form lives in
//! `services::version_codec`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// `MAJOR.MINOR.PATCH[-PRERELEASE]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ControllerVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl ControllerVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (core, prerelease) = match s.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (s, None),
        };

        let numbers: Vec<&str> = core.split('.').collect();
        if numbers.len() != 3 {
            return Err(format!("Invalid version '{s}': expected MAJOR.MINOR.PATCH"));
        }

        let parse_number = |part: &str| -> Result<u64, String> {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("Invalid version '{s}': '{part}' is not a number"));
            }
            part.parse::<u64>()
                .map_err(|e| format!("Invalid version '{s}': {e}"))
        };

        let prerelease = match prerelease {
            Some(pre) => {
                let valid = !pre.is_empty()
                    && pre
                        .split('.')
                        .all(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()));
                if !valid {
                    return Err(format!("Invalid version '{s}': bad prerelease '{pre}'"));
                }
                Some(pre.to_lowercase())
            }
            None => None,
        };

        Ok(Self {
            major: parse_number(numbers[0])?,
            minor: parse_number(numbers[1])?,
            patch: parse_number(numbers[2])?,
            prerelease,
        })
    }
}

impl std::fmt::Display for ControllerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl Ord for ControllerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A release sorts after any of its prereleases.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for ControllerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<String> for ControllerVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ControllerVersion> for String {
    fn from(value: ControllerVersion) -> Self {
        value.to_string()
    }
}
