//! Shamir secret sharing for the key-encryption key.
//!
//! Splitting and recombination run over GF(2^8) (one polynomial per secret
//! byte, Lagrange interpolation at x = 0) via the `sharks` crate, which uses
//! table-driven constant-time Galois arithmetic. This module wraps it with
//! the share format and validation rules the seal controller depends on:
//!
//! - a share is `index (1 byte) || evaluations`, transported as base64;
//! - duplicate indices are rejected before interpolation;
//! - the secret carries a trailing self-check byte so a recombination from
//!   mismatched shares is detected instead of silently producing garbage.
//!
//! The self-check is advisory only — the authoritative integrity check is
//! whether the recovered KEK decrypts the stored data master key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sharks::{Share, Sharks};
use zeroize::Zeroize;

use crate::error::ShamirError;

/// XOR folded into the self-check byte so an all-zero secret does not get an
/// all-zero check.
const CHECK_TWEAK: u8 = 0x5A;

/// A single share of the split KEK.
///
/// Holds the raw `sharks` wire bytes (`index || evaluations`). Never
/// persisted by the platform; shown to operators exactly once.
#[derive(Clone, Zeroize)]
pub struct KekShare {
    data: Vec<u8>,
}

impl KekShare {
    /// The share's evaluation-point index (1-based).
    #[must_use]
    pub fn index(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    /// Encode the share as base64 for operator distribution.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// Decode a share from its base64 transport form.
    ///
    /// # Errors
    ///
    /// Returns [`ShamirError::InvalidShare`] if the input is not base64 or
    /// too short to carry an index and at least one evaluation byte.
    pub fn from_base64(encoded: &str) -> Result<Self, ShamirError> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| ShamirError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            })?;
        if data.len() < 2 {
            return Err(ShamirError::InvalidShare {
                reason: format!("share too short: {} bytes", data.len()),
            });
        }
        if data[0] == 0 {
            return Err(ShamirError::InvalidShare {
                reason: "share index 0 is reserved".to_owned(),
            });
        }
        Ok(Self { data })
    }
}

impl std::fmt::Debug for KekShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KekShare")
            .field("index", &self.index())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Compute the self-check byte for a secret.
fn check_byte(secret: &[u8]) -> u8 {
    secret.iter().fold(CHECK_TWEAK, |acc, b| acc ^ b)
}

/// Split a secret into `shares` Shamir shares with recovery `threshold`.
///
/// # Errors
///
/// Returns [`ShamirError::InvalidConfig`] if the parameters are out of
/// bounds (`1 <= threshold <= shares <= 255`, non-empty secret).
pub fn split_secret(
    secret: &[u8],
    shares: u8,
    threshold: u8,
) -> Result<Vec<KekShare>, ShamirError> {
    if secret.is_empty() {
        return Err(ShamirError::InvalidConfig {
            reason: "secret must not be empty".to_owned(),
        });
    }
    if threshold == 0 {
        return Err(ShamirError::InvalidConfig {
            reason: "threshold must be at least 1".to_owned(),
        });
    }
    if threshold > shares {
        return Err(ShamirError::InvalidConfig {
            reason: format!("threshold ({threshold}) cannot exceed share count ({shares})"),
        });
    }

    let mut payload = Vec::with_capacity(secret.len().saturating_add(1));
    payload.extend_from_slice(secret);
    payload.push(check_byte(secret));

    let shamir = Sharks(threshold);
    let dealer = shamir.dealer(&payload);
    let out: Vec<KekShare> = dealer
        .take(usize::from(shares))
        .map(|s| KekShare {
            data: Vec::from(&s),
        })
        .collect();

    payload.zeroize();
    Ok(out)
}

/// Recombine shares into the original secret.
///
/// # Errors
///
/// - [`ShamirError::ShareCountBelowThreshold`] if fewer than `threshold`
///   shares are provided.
/// - [`ShamirError::DuplicateShareIndex`] if two shares carry the same index.
/// - [`ShamirError::InvalidShare`] if a share fails to deserialize.
/// - [`ShamirError::IncoherentShares`] if interpolation produced a value
///   that fails the self-check byte.
pub fn combine_shares(shares: &[KekShare], threshold: u8) -> Result<Vec<u8>, ShamirError> {
    let got = u8::try_from(shares.len()).unwrap_or(u8::MAX);
    if got < threshold {
        return Err(ShamirError::ShareCountBelowThreshold {
            needed: threshold,
            got,
        });
    }

    let mut seen = [false; 256];
    for share in shares {
        let idx = share.index();
        if seen[usize::from(idx)] {
            return Err(ShamirError::DuplicateShareIndex { index: idx });
        }
        seen[usize::from(idx)] = true;
    }

    let parsed: Result<Vec<Share>, ShamirError> = shares
        .iter()
        .map(|s| {
            Share::try_from(s.data.as_slice()).map_err(|e| ShamirError::InvalidShare {
                reason: format!("share deserialization failed: {e}"),
            })
        })
        .collect();
    let parsed = parsed?;

    let shamir = Sharks(threshold);
    let mut payload = shamir
        .recover(&parsed)
        .map_err(|e| ShamirError::InvalidShare {
            reason: format!("recovery failed: {e}"),
        })?;

    let Some((&check, secret)) = payload.split_last() else {
        return Err(ShamirError::IncoherentShares);
    };
    if check != check_byte(secret) {
        payload.zeroize();
        return Err(ShamirError::IncoherentShares);
    }

    let secret = secret.to_vec();
    payload.zeroize();
    Ok(secret)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret() -> Vec<u8> {
        (0u8..32).map(|i| i.wrapping_mul(7).wrapping_add(3)).collect()
    }

    #[test]
    fn split_and_combine_exact_threshold() {
        let s = secret();
        let shares = split_secret(&s, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        let recovered = combine_shares(&shares[..3], 3).unwrap();
        assert_eq!(recovered, s);
    }

    #[test]
    fn any_threshold_subset_recovers() {
        let s = secret();
        let shares = split_secret(&s, 5, 3).unwrap();

        // Every 3-of-5 subset must recover the secret exactly.
        for a in 0..5 {
            for b in (a + 1)..5 {
                for c in (b + 1)..5 {
                    let subset = vec![
                        shares[a].clone(),
                        shares[b].clone(),
                        shares[c].clone(),
                    ];
                    assert_eq!(combine_shares(&subset, 3).unwrap(), s);
                }
            }
        }
    }

    #[test]
    fn below_threshold_is_rejected() {
        let s = secret();
        let shares = split_secret(&s, 5, 3).unwrap();
        let err = combine_shares(&shares[..2], 3).unwrap_err();
        assert!(matches!(
            err,
            ShamirError::ShareCountBelowThreshold { needed: 3, got: 2 }
        ));
    }

    #[test]
    fn below_threshold_shares_do_not_reveal_secret() {
        // Lying about the threshold with K-1 shares must not reproduce the
        // secret: the interpolation result is wrong and (almost always)
        // trips the self-check.
        let s = secret();
        let shares = split_secret(&s, 5, 3).unwrap();
        match combine_shares(&shares[..2], 2) {
            Ok(recovered) => assert_ne!(recovered, s),
            Err(_) => {}
        }
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let s = secret();
        let shares = split_secret(&s, 5, 3).unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];
        let err = combine_shares(&dup, 3).unwrap_err();
        assert!(matches!(err, ShamirError::DuplicateShareIndex { .. }));
    }

    #[test]
    fn corrupted_share_fails_self_check() {
        let s = secret();
        let shares = split_secret(&s, 5, 3).unwrap();

        // Flip one evaluation byte in the first share.
        let mut corrupted = shares[0].clone();
        let b64 = corrupted.to_base64();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
        raw[1] ^= 0x01;
        corrupted = KekShare { data: raw };

        let subset = vec![corrupted, shares[1].clone(), shares[2].clone()];
        match combine_shares(&subset, 3) {
            Ok(recovered) => assert_ne!(recovered, s),
            Err(e) => assert!(matches!(e, ShamirError::IncoherentShares)),
        }
    }

    #[test]
    fn base64_roundtrip_preserves_share() {
        let s = secret();
        let shares = split_secret(&s, 3, 2).unwrap();
        let restored: Vec<KekShare> = shares
            .iter()
            .map(|sh| KekShare::from_base64(&sh.to_base64()).unwrap())
            .collect();
        assert_eq!(combine_shares(&restored[..2], 2).unwrap(), s);
    }

    #[test]
    fn from_base64_rejects_garbage() {
        assert!(KekShare::from_base64("not-valid-base64!!!").is_err());
        assert!(KekShare::from_base64("").is_err());
    }

    #[test]
    fn invalid_split_configs_rejected() {
        let s = secret();
        assert!(split_secret(&s, 3, 0).is_err());
        assert!(split_secret(&s, 3, 4).is_err());
        assert!(split_secret(&[], 3, 2).is_err());
    }

    #[test]
    fn share_indices_are_distinct_and_nonzero() {
        let s = secret();
        let shares = split_secret(&s, 10, 4).unwrap();
        let mut indices: Vec<u8> = shares.iter().map(KekShare::index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 10);
        assert!(indices.iter().all(|&i| i != 0));
    }

    #[test]
    fn debug_does_not_leak_share_bytes() {
        let s = secret();
        let shares = split_secret(&s, 3, 2).unwrap();
        let debug = format!("{:?}", shares[0]);
        assert!(debug.contains("[REDACTED]"));
    }
}
