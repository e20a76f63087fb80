//! Opaque device codes and human-enterable user codes.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{Rng, RngCore};

/// Restricted alphabet for user codes. Ambiguous glyphs (vowels, `0/O`,
/// `1/I`, `Y`) are excluded so the code survives being read aloud or typed
/// from a TV screen.
pub const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

pub const USER_CODE_LENGTH: usize = 8;

/// URL-safe opaque identifier with 192 bits of entropy, handed to the
/// polling device.
pub fn new_device_code() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Short uppercase code the user types into the verification page.
///
/// Uniqueness is enforced by the storage layer; callers regenerate on a
/// unique-key conflict.
pub fn new_user_code() -> String {
    let mut rng = rand::thread_rng();
    (0..USER_CODE_LENGTH)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect()
}
