use std::time::SystemTime;

use uuid::Uuid;

/// Joins a foreign key to the random suffix of a pseudo key. Hex digests
/// never contain it, so a pseudo key is never mistaken for a real digest.
pub const PSEUDO_KEY_SEPARATOR: char = '-';

/// Lifecycle of a blob imported under a pseudo key.
///
/// ```text
/// PseudoKeyed -> RealKeyConfirmed -> EligibleForDeletion -> Retired -> (forgotten)
///                      ^                    |
///                      +---- cancelled -----+
/// ```
///
/// Once the real key is known, reads of the pseudo key resolve to it, so
/// references taken while the blob was pseudo-keyed keep working after the
/// pseudo object is gone. The alias itself is dropped one grace window after
/// retirement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PseudoKeyState {
    /// Stored under the pseudo key only; real digest not yet computed.
    PseudoKeyed,
    /// The real-keyed object is durable.
    RealKeyConfirmed { real_key: String },
    /// The pseudo object may be deleted by a sweep at or after `after`.
    EligibleForDeletion { real_key: String, after: SystemTime },
    /// The pseudo object is gone; the key is an alias of `real_key` until
    /// `forget_after`.
    Retired {
        real_key: String,
        forget_after: SystemTime,
    },
}

impl PseudoKeyState {
    pub fn real_key(&self) -> Option<&str> {
        match self {
            Self::PseudoKeyed => None,
            Self::RealKeyConfirmed { real_key }
            | Self::EligibleForDeletion { real_key, .. }
            | Self::Retired { real_key, .. } => Some(real_key),
        }
    }
}

/// A fresh pseudo key for a blob known as `source_key` elsewhere.
pub fn pseudo_key(source_key: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{source_key}{PSEUDO_KEY_SEPARATOR}{}", &suffix[..12])
}

/// Background request to compute the real key of a pseudo-keyed blob.
#[derive(Debug)]
pub(crate) struct RekeyJob {
    pub pseudo_key: String,
    /// Store epoch at submission; a `clear` in between voids the job.
    pub epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_crypto::DigestAlgorithm;

    #[test]
    fn pseudo_keys_are_unique_and_never_digests() {
        let source = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";
        let a = pseudo_key(source);
        let b = pseudo_key(source);
        assert_ne!(a, b);
        assert!(a.starts_with(source));
        for algorithm in [DigestAlgorithm::Md5, DigestAlgorithm::Sha256, DigestAlgorithm::Sha512] {
            assert!(!algorithm.is_valid_digest(&a));
        }
    }

    #[test]
    fn real_key_visible_after_confirmation() {
        assert_eq!(PseudoKeyState::PseudoKeyed.real_key(), None);
        let state = PseudoKeyState::Retired {
            real_key: "abc".into(),
            forget_after: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(state.real_key(), Some("abc"));
    }
}
