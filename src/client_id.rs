//! Azureus-style client id generation.
//!
//! The id is the client acronym and version wrapped in dashes, followed by
//! random characters, e.g. `-GT0001hT4kq93bWf0Zr`.

use rand::Rng;

use crate::PeerId;

/// The Azureus-style prefix: acronym and four version digits.
const CLIENT_PREFIX: &[u8] = b"-GT0001";

/// The characters the random part of the id is drawn from. `I`, `l`, `o` and
/// `O` are excluded so ids stay unambiguous in textual logs.
const ALPHA_DIGITS: &[u8] =
    b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ0123456789";

/// Generates a new random client id.
pub fn new_client_id() -> PeerId {
    let mut rng = rand::thread_rng();
    let mut id = [0; 20];
    id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
    for b in id.iter_mut().skip(CLIENT_PREFIX.len()) {
        *b = ALPHA_DIGITS[rng.gen_range(0..ALPHA_DIGITS.len())];
    }
    id
}
