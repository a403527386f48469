use secp256k1::hashes::hmac::{Hmac, HmacEngine};
use secp256k1::hashes::{sha256, Hash, HashEngine};
use thiserror::Error;

const PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is not of the form sha256=<hex>")]
    Malformed,
    #[error("signature does not match")]
    Mismatch,
}

/// EventSub signs `message id || timestamp || raw body` with HMAC-SHA256.
pub fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
    let mut engine = HmacEngine::<sha256::Hash>::new(secret.as_bytes());
    engine.input(message_id.as_bytes());
    engine.input(timestamp.as_bytes());
    engine.input(body);
    let hmac = Hmac::<sha256::Hash>::from_engine(engine);
    format!("{}{:x}", PREFIX, hmac)
}

pub fn verify(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    header: &str,
) -> Result<(), SignatureError> {
    let provided = header
        .strip_prefix(PREFIX)
        .filter(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or(SignatureError::Malformed)?
        .to_ascii_lowercase();
    let expected = sign(secret, message_id, timestamp, body);
    if constant_time_eq(expected[PREFIX.len()..].as_bytes(), provided.as_bytes()) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    const SECRET: &str = "this-is-a-webhook-secret";
    const ID: &str = "e76c6bd4-55c9-4987-8304-da1588d8988b";
    const TS: &str = "2019-11-16T10:11:12.634234626Z";
    const BODY: &[u8] = br#"{"subscription":{},"event":{}}"#;

    #[test]
    fn matches_rfc4231_test_vector() {
        // RFC 4231 test case 2, with the key split across the three inputs
        let mac = sign("Jefe", "what do ya want ", "for nothing?", b"");
        assert_eq!(
            mac,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn accepts_own_signature() {
        let header = sign(SECRET, ID, TS, BODY);
        verify(SECRET, ID, TS, BODY, &header).unwrap();
        verify(SECRET, ID, TS, BODY, &header.to_uppercase().replace("SHA256=", "sha256="))
            .unwrap();
    }

    #[test]
    fn rejects_tampering() {
        let header = sign(SECRET, ID, TS, BODY);
        assert_eq!(
            verify(SECRET, ID, TS, br#"{"subscription":{},"event":{"x":1}}"#, &header),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify("other-secret", ID, TS, BODY, &header),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(SECRET, ID, "2019-11-16T10:11:13Z", BODY, &header),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(verify(SECRET, ID, TS, BODY, ""), Err(SignatureError::Malformed));
        assert_eq!(
            verify(SECRET, ID, TS, BODY, "sha1=abcdef"),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify(SECRET, ID, TS, BODY, &format!("sha256={}", "zz".repeat(32))),
            Err(SignatureError::Malformed)
        );
    }
}
