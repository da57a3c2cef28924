//! Chunkserver token issuance.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Default token length in characters.
pub const DEFAULT_TOKEN_LENGTH: usize = 8;

/// Issues opaque tokens for new chunkservers.
pub trait TokenGenerator: Send + Sync {
    /// Returns a fresh token.
    fn gen_token(&self) -> String;
}

/// Random alphanumeric tokens from the thread-local RNG.
pub struct DefaultTokenGenerator {
    length: usize,
}

impl DefaultTokenGenerator {
    /// Creates a generator producing tokens of `length` characters.
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl Default for DefaultTokenGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_LENGTH)
    }
}

impl TokenGenerator for DefaultTokenGenerator {
    fn gen_token(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_length_and_charset() {
        let gen = DefaultTokenGenerator::new(16);
        let token = gen.gen_token();
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_tokens_differ() {
        let gen = DefaultTokenGenerator::default();
        assert_ne!(gen.gen_token(), gen.gen_token());
    }
}
