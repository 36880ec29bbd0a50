use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    /// Deliberately carries no detail: a wrong key and a corrupted
    /// ciphertext must be indistinguishable to the caller.
    #[error("Message authentication failed")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("KEM operation failed: {0}")]
    Kem(String),

    #[error("Ratchet counter regression (chain {chain}, counter {counter})")]
    CounterRegression { chain: String, counter: u64 },

    #[error("Receiving chain desynchronised: {skip} skipped messages exceeds limit {limit}")]
    ChainDesynchronized { skip: u64, limit: u64 },

    #[error("Ratchet not ready: {0}")]
    RatchetNotReady(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
