use rand::Rng;
use sha2::{Digest, Sha256};

/// Generate a random join token.
pub fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..48)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Hash a join token with the configured pepper.
///
/// The hash doubles as the storage key, so it must stay deterministic:
/// lookup on RequestJoin is by hash, the raw value is never persisted.
pub fn hash_token(token: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(pepper.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_long_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_deterministic_and_pepper_sensitive() {
        let h1 = hash_token("tok", "pepper-a");
        let h2 = hash_token("tok", "pepper-a");
        let h3 = hash_token("tok", "pepper-b");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }
}
