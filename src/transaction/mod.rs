pub mod endpoint;
pub mod executor;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;

pub use key::{TopViaBranchExt, TransactionKey, TransactionRole};
pub use transaction::{Transaction, TransactionEvent, TransactionState, TransactionType};

use rand::Rng;

const TAG_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A random opaque tag suitable for From/To tag parameters.
pub fn make_tag() -> String {
    random_token(8)
}

/// A random branch parameter, always magic-cookie prefixed.
pub fn make_branch() -> String {
    format!("{}{}", crate::identifiers::MAGIC_COOKIE, random_token(16))
}

/// A random Call-ID local part; `suffix` is typically `@host`.
pub fn make_call_id(suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("{}{}", random_token(16), s),
        None => random_token(16),
    }
}

fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..TAG_CHARS.len());
            TAG_CHARS[idx] as char
        })
        .collect()
}
