//! API key generation and validation for instrument integrations

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

/// API key generator
pub struct ApiKeyGenerator;

impl ApiKeyGenerator {
    /// Generate a new API key
    /// Format: lab_ak_<32-char-random>
    pub fn generate() -> String {
        let random: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        format!("lab_ak_{}", random)
    }

    /// Generate key ID (public identifier)
    /// Format: ak_<8-char-prefix>
    pub fn generate_key_id(key: &str) -> String {
        // Extract 8 chars after prefix
        let prefix_chars = key.chars().skip(7).take(8).collect::<String>();
        format!("ak_{}", prefix_chars)
    }

    /// Hash API key for storage using SHA-256
    pub fn hash(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
