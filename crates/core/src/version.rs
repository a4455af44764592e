//! Row version tokens for optimistic concurrency.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Monotonically increasing version of a persisted row.
///
/// Every successful update bumps the version by one. Writers carry the version
/// they read and the store only applies the write if it still matches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version of a freshly inserted row.
    pub const INITIAL: Version = Version(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Compare against the version currently stored.
    pub fn check(self, actual: Version) -> DomainResult<()> {
        if self == actual {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {}, actual: {})",
                self.0, actual.0
            )))
        }
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn next_increments() {
        assert_eq!(Version::INITIAL.next().get(), 2);
    }

    #[test]
    fn check_reports_conflict_on_mismatch() {
        assert!(Version::new(3).check(Version::new(3)).is_ok());
        let err = Version::new(3).check(Version::new(4)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    proptest! {
        #[test]
        fn check_passes_only_on_equal_versions(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            let (a, b) = (Version::new(a), Version::new(b));
            prop_assert_eq!(a.check(b).is_ok(), a == b);
        }

        #[test]
        fn a_bumped_version_never_matches_its_reader(v in 0u64..u64::MAX) {
            let read = Version::new(v);
            prop_assert!(read < read.next());
            prop_assert!(read.check(read.next()).is_err());
        }
    }
}
