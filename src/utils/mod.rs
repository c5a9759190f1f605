pub mod backoff;
pub mod paths;
pub mod rate_limiter;

use rand::Rng;

pub const CHARS_ASCII: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const CHARS_HEX_LOWER: &str = "0123456789abcdef";

/// Generate a random nonce of `length` characters drawn from `chars`.
pub fn create_nonce(chars: &str, length: usize) -> String {
    let pool: Vec<char> = chars.chars().collect();
    let mut rng = rand::thread_rng();
    (0..length).map(|_| pool[rng.gen_range(0..pool.len())]).collect()
}

/// Split a slice into owned chunks of at most `size` elements.
pub fn chunked<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_length_and_charset() {
        let nonce = create_nonce(CHARS_HEX_LOWER, 16);
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| CHARS_HEX_LOWER.contains(c)));
    }

    #[test]
    fn test_nonces_are_unique() {
        let a = create_nonce(CHARS_ASCII, 30);
        let b = create_nonce(CHARS_ASCII, 30);
        assert_ne!(a, b);
    }

    #[test]
    fn test_chunked_splits_evenly() {
        let items: Vec<u32> = (0..35).collect();
        let chunks = chunked(&items, 16);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 16);
        assert_eq!(chunks[2].len(), 3);
    }

    #[test]
    fn test_chunked_empty() {
        let chunks = chunked::<u32>(&[], 16);
        assert!(chunks.is_empty());
    }
}
