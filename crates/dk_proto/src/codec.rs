//! Plaintext padding applied before sealing.
//!
//! # Padding
//! To resist traffic analysis, plaintext can be padded to fixed size buckets
//! before encryption, so the relay sees uniform-sized ciphertext.
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536
//! Larger payloads are length-prefixed but not padded.

use serde::{Deserialize, Serialize};

/// Padding mode for metadata minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// No padding — minimal bandwidth.
    None,
    /// Pad to fixed-size buckets.
    #[default]
    Buckets,
    /// Pad all messages to the maximum bucket size (64KB).
    Maximum,
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];
const MAX_BUCKET: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Pad plaintext according to `mode`.
///
/// Format: [original_len: u32 LE] [plaintext] [random padding]
pub fn pad(plaintext: &[u8], mode: PaddingMode) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(plaintext.len()).map_err(|_| CodecError::TooLarge(plaintext.len()))?;
    let needed = 4 + plaintext.len();
    let target = match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES
            .iter()
            .copied()
            .find(|&b| b >= needed)
            .unwrap_or(needed),
        PaddingMode::Maximum => MAX_BUCKET.max(needed),
    };

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(plaintext);
    // Fill remaining with random bytes (not zeros — avoids compression leaks)
    let remaining = target - out.len();
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    Ok(out)
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if padded.len() < 4 {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_unpad_roundtrip_buckets() {
        let msg = b"Hello, World!";
        let padded = pad(msg, PaddingMode::Buckets).unwrap();
        assert_eq!(padded.len(), 256); // smallest bucket
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn pad_unpad_roundtrip_none() {
        let msg = b"No padding test";
        let padded = pad(msg, PaddingMode::None).unwrap();
        assert_eq!(padded.len(), 4 + msg.len());
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn pad_unpad_large_message() {
        let msg = vec![0x42u8; 5000];
        let padded = pad(&msg, PaddingMode::Buckets).unwrap();
        assert_eq!(padded.len(), 16384); // next bucket up from 5004
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn pad_maximum() {
        let padded = pad(b"tiny", PaddingMode::Maximum).unwrap();
        assert_eq!(padded.len(), 65536);
        assert_eq!(unpad(&padded).unwrap(), b"tiny");
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut bogus = vec![0u8; 16];
        bogus[..4].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(unpad(&bogus), Err(CodecError::InvalidPadding(_))));
        assert!(unpad(&[1, 2]).is_err());
    }
}
