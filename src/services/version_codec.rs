//! Label-safe encoding of controller versions.
//!
//! Job labels may only contain `[a-z0-9_-]`, so `1.0.0` is stored as
//! `1-0-0` and `1.0.0-rc.1` as `1-0-0--rc_1`. Decoding reverses it.

use crate::domain::models::{ControllerVersion, Job, VERSION_LABEL};

const PRERELEASE_SEPARATOR: &str = "--";

/// Encode a version as a label token.
pub fn encode(version: &ControllerVersion) -> String {
    let core = format!("{}-{}-{}", version.major, version.minor, version.patch);
    match &version.prerelease {
        Some(pre) => format!("{core}{PRERELEASE_SEPARATOR}{}", pre.replace('.', "_")),
        None => core,
    }
}

/// Decode a label token back into a version.
pub fn decode(token: &str) -> Result<ControllerVersion, String> {
    let (core, prerelease) = match token.split_once(PRERELEASE_SEPARATOR) {
        Some((core, pre)) => (core, Some(pre)),
        None => (token, None),
    };

    if core.split('-').count() != 3 {
        return Err(format!("Invalid version label '{token}'"));
    }

    let mut version = core.replace('-', ".");
    if let Some(pre) = prerelease {
        version.push('-');
        version.push_str(&pre.replace('_', "."));
    }

    ControllerVersion::parse(&version).map_err(|e| format!("Invalid version label '{token}': {e}"))
}

/// Version recorded in a job's label, if present and decodable.
pub fn label_version(job: &Job) -> Option<ControllerVersion> {
    job.labels.get(VERSION_LABEL).and_then(|token| decode(token).ok())
}

/// A job is current only when both its recorded version and its label match.
pub fn is_current(job: &Job, current: &ControllerVersion) -> bool {
    &job.controller_version == current && label_version(job).as_ref() == Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode(&ControllerVersion::new(1, 0, 0)), "1-0-0");
        assert_eq!(
            encode(&ControllerVersion::parse("0.10.2-rc.1").unwrap()),
            "0-10-2--rc_1"
        );
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode("0-9-9").unwrap(), ControllerVersion::new(0, 9, 9));
        assert_eq!(
            decode("2-1-0--beta_3").unwrap(),
            ControllerVersion::parse("2.1.0-beta.3").unwrap()
        );
        assert!(decode("1-0").is_err());
        assert!(decode("1.0.0").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_encoded_tokens_are_label_safe() {
        let token = encode(&ControllerVersion::parse("3.2.1-RC.7").unwrap());
        assert!(token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            major in 0u64..10_000,
            minor in 0u64..10_000,
            patch in 0u64..10_000,
            pre in proptest::option::of("[a-z0-9]{1,6}(\\.[a-z0-9]{1,6}){0,2}"),
        ) {
            let version = ControllerVersion {
                major,
                minor,
                patch,
                prerelease: pre,
            };
            prop_assert_eq!(decode(&encode(&version)).unwrap(), version);
        }
    }
}
