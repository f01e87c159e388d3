//! Opaque continue tokens for keyset pagination.
//!
//! A token encodes the `(created_at, uuid)` cursor of the last returned row
//! together with a fingerprint of the exact filter set it was minted for.
//! Re-using a token under a different filter set is rejected, because the
//! cursor would silently skip or duplicate rows.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    /// Microseconds since the epoch of the last row's `created_at`.
    c: i64,
    /// Uid of the last row.
    i: Uuid,
    /// Fingerprint of the filter set.
    f: String,
}

pub fn encode(created_at: DateTime<Utc>, uid: Uuid, fingerprint: &str) -> String {
    let payload = Payload {
        c: created_at.timestamp_micros(),
        i: uid,
        f: fingerprint.to_owned(),
    };

    // serializing a struct of scalars cannot fail
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode(token: &str, fingerprint: &str) -> Result<(DateTime<Utc>, Uuid)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::MalformedToken)?;
    let payload: Payload = serde_json::from_slice(&bytes).map_err(|_| Error::MalformedToken)?;

    if payload.f != fingerprint {
        return Err(Error::TokenMismatch);
    }

    let created_at = DateTime::from_timestamp_micros(payload.c).ok_or(Error::MalformedToken)?;

    Ok((created_at, payload.i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let created_at = DateTime::from_timestamp_micros(1_714_557_600_000_123).unwrap();
        let uid = Uuid::new_v4();

        let token = encode(created_at, uid, "abc123");
        let (decoded_at, decoded_uid) = decode(&token, "abc123").unwrap();

        assert_eq!(decoded_at, created_at);
        assert_eq!(decoded_uid, uid);
    }

    #[test]
    fn fingerprint_mismatch_is_rejected() {
        let token = encode(Utc::now(), Uuid::new_v4(), "filter-a");
        assert!(matches!(
            decode(&token, "filter-b").unwrap_err(),
            Error::TokenMismatch
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            decode("not!base64!", "x").unwrap_err(),
            Error::MalformedToken
        ));
        assert!(matches!(
            decode(&URL_SAFE_NO_PAD.encode(b"{\"nope\":1}"), "x").unwrap_err(),
            Error::MalformedToken
        ));
    }
}
