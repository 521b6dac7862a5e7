// src/core/utils.rs

//! Small shared helpers: random tokens and shard-list rendering.

use rand::Rng;

const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generates a random ASCII-letter token of the given length.
///
/// Used for session ids, probe nonces, and generated cluster names.
/// Drawn from the thread RNG, which is cryptographically secure, so
/// concurrent probe nonces cannot be guessed or cross-polluted.
pub fn random_string(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
        .collect()
}

/// Renders a shard list in the bracketed, comma-space-separated form the
/// child launch protocol expects, e.g. `[0, 1, 2]`.
pub fn shard_list_repr(shards: &[u64]) -> String {
    let mut s = String::from("[");
    for (i, shard) in shards.iter().enumerate() {
        s.push_str(&shard.to_string());
        if i != shards.len() - 1 {
            s.push_str(", ");
        }
    }
    s.push(']');
    s
}
