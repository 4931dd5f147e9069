//! Utility functions for identifiers, tracking numbers and fingerprints

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Parcel tracking number handed to the client on acceptance.
///
/// The tail of a uuid7 is random, the head is the clock, so both halves go in.
pub fn new_tracking_number() -> String {
    let id = uuid7();
    let bytes = id.as_bytes();
    format!(
        "GP-{}-{}",
        hex::encode_upper(&bytes[2..6]),
        hex::encode_upper(&bytes[10..16])
    )
}

/// Content fingerprint used to pair an optimistic message with its stored row.
pub fn message_fingerprint(thread_id: &str, sender_id: &str, content: &str) -> String {
    sha256::digest(format!("{thread_id}\u{1f}{sender_id}\u{1f}{content}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bech32_ids_carry_prefix() {
        let id = new_uuid_to_bech32("chat_").unwrap();
        assert!(id.starts_with("chat_1"));
        assert!(!id.contains('/'));
    }

    #[test]
    fn tracking_numbers_are_unique() {
        let a = new_tracking_number();
        let b = new_tracking_number();
        assert!(a.starts_with("GP-"));
        assert_eq!(a.len(), "GP-".len() + 8 + 1 + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_depends_on_every_part() {
        let base = message_fingerprint("t", "u", "hello");
        assert_eq!(base, message_fingerprint("t", "u", "hello"));
        assert_ne!(base, message_fingerprint("t2", "u", "hello"));
        assert_ne!(base, message_fingerprint("t", "u2", "hello"));
        assert_ne!(base, message_fingerprint("t", "u", "hello!"));
    }
}
