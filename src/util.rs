use std::fmt::Write as _;

use base64::prelude::*;
use rand::RngCore as _;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(input)
}

pub(crate) fn base64url_decode(input: &str) -> eyre::Result<Vec<u8>> {
    Ok(BASE64_URL_SAFE_NO_PAD.decode(input)?)
}

/// 32 random octets, base64url encoded without padding.
///
/// Used for challenge tokens and OOB page-view paths.
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64url(&bytes)
}

/// Short random resource identifier.
pub(crate) fn random_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64url(&bytes)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

pub(crate) fn parse_rfc3339(s: &str) -> eyre::Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|err| eyre::eyre!("invalid RFC 3339 date {s:?}: {err}"))
}

pub(crate) fn format_rfc3339(t: OffsetDateTime) -> String {
    // Rfc3339 formatting only fails for years outside 0..=9999.
    t.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub(crate) fn now_plus_secs(secs: u64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + Duration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64url_no_padding() {
        assert_eq!(base64url(b"hi"), "aGk");
        assert_eq!(base64url_decode("aGk").unwrap(), b"hi");
    }

    #[test]
    fn test_random_token_length() {
        // 32 octets encode to 43 base64url characters.
        assert_eq!(random_token().len(), 43);
        assert_ne!(random_token(), random_token());
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_rfc3339_round_trip() {
        let t = parse_rfc3339("2016-03-01T12:00:00Z").unwrap();
        assert_eq!(format_rfc3339(t), "2016-03-01T12:00:00Z");
        assert!(parse_rfc3339("yesterday-ish").is_err());
    }
}
