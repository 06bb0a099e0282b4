//! crates/tinyquiz_core/src/codes.rs
//!
//! Short, human-typable codes naming games and sessions.
//!
//! A code is built from a unique incremental value (for uniqueness) and random
//! bits (so codes cannot be guessed). Symbols that are easy to confuse are left
//! out of the alphabet.

use crate::ports::{PortError, PortResult};
use rand::{rngs::OsRng, RngCore};

const ALPHABET: &[u8; 32] = b"ABCDEFGHJKMNPQRSTUVWXYZ123456789";

/// Random bytes mixed into every generated game or session code.
pub const CODE_RANDOM_BYTES: u8 = 3;

/// Generates a code that can be guessed after 256^`random_bytes` attempts on average.
///
/// `random_bytes` can be at most 8 (64 bits of randomness).
pub fn generate_random_code(incremental: u64, random_bytes: u8) -> PortResult<String> {
    if random_bytes > 8 {
        return Err(PortError::Unexpected(format!(
            "at most 8 random bytes fit in a code, {} requested",
            random_bytes
        )));
    }
    let mut buf = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut buf[..random_bytes as usize])
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
    Ok(generate_code(incremental, u64::from_le_bytes(buf)))
}

/// Encodes both values into one compact code. Smaller values give shorter codes.
///
/// The code is unique whenever at least one of the arguments is unique. It is not
/// guaranteed to be parsable back into its arguments.
pub fn generate_code(incremental: u64, random: u64) -> String {
    let incremental_numerals = count_numerals(incremental);
    let random_numerals = count_numerals(random);

    let mut res = vec![0u8; incremental_numerals + random_numerals];
    encode(random, &mut res);
    encode(incremental, &mut res[..incremental_numerals]);
    res.into_iter().map(char::from).collect()
}

/// Number of symbols needed to encode `x`.
fn count_numerals(mut x: u64) -> usize {
    let mut numerals = 0;
    while x > 0 {
        numerals += 1;
        x /= ALPHABET.len() as u64;
    }
    numerals.max(1)
}

/// Writes `x` into `res` starting from its end.
fn encode(mut x: u64, res: &mut [u8]) {
    if x == 0 {
        if let Some(last) = res.last_mut() {
            *last = ALPHABET[0];
        }
        return;
    }
    for slot in res.iter_mut().rev() {
        if x == 0 {
            break;
        }
        *slot = ALPHABET[(x % ALPHABET.len() as u64) as usize];
        x /= ALPHABET.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes() {
        assert_eq!(generate_code(0, 0), "AA");
        assert_eq!(generate_code(32, 31), "BA9");
        assert_eq!(
            generate_code(u64::MAX, u64::MAX),
            "S999999999999S999999999999"
        );
    }

    #[test]
    fn incremental_part_keeps_codes_unique() {
        let a = generate_code(7, 12345);
        let b = generate_code(8, 12345);
        assert_ne!(a, b);
    }

    #[test]
    fn random_codes_use_only_the_alphabet() {
        for incremental in [0, 1, 1_000, u64::MAX] {
            let code = generate_random_code(incremental, CODE_RANDOM_BYTES).unwrap();
            assert!(code.bytes().all(|b| ALPHABET.contains(&b)), "{}", code);
            // three random bytes need at most five symbols
            assert!(code.len() <= count_numerals(incremental) + 5);
        }
    }

    #[test]
    fn too_many_random_bytes_is_an_error() {
        assert!(generate_random_code(1, 9).is_err());
    }
}
