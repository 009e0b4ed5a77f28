pub(crate) mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};
use rand::prelude::*;
use ring::digest;

use crate::{config::SizeLimit, utils::error::ErrorKind, Error, Result};

/// Number of random bytes in a generated media ID
const MEDIA_ID_BYTES: usize = 32;

// Hopefully we have a better chat protocol in 530 years
#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
pub(crate) fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub(crate) fn random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Generates a candidate media ID: 256 random bits, hex-encoded
///
/// Uniqueness within an origin still has to be checked by the caller.
pub(crate) fn random_media_id() -> String {
    let mut bytes = [0_u8; MEDIA_ID_BYTES];
    thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// SHA-256 of `bytes` as unpadded URL-safe base64
pub(crate) fn sha256_base64(bytes: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Parses a declared `Content-Length` and checks it against `limit`
///
/// The value is parsed as a signed 64-bit integer, which is what peers send
/// in practice, and negative values are rejected. `None` means the length is
/// unknown and the body has to be capped while it is read.
pub(crate) fn parse_content_length(
    value: Option<&str>,
    limit: SizeLimit,
) -> Result<Option<u64>> {
    let Some(value) = value else {
        return Ok(None);
    };

    let length: i64 = value.trim().parse().map_err(|_| {
        Error::BadRequest(
            ErrorKind::InvalidParam,
            "Content-Length is not a valid integer",
        )
    })?;

    let length = u64::try_from(length).map_err(|_| {
        Error::BadRequest(
            ErrorKind::InvalidParam,
            "Content-Length must not be negative",
        )
    })?;

    limit.check(length)?;

    Ok(Some(length))
}
