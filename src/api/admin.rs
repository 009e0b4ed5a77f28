//! Operator endpoints, authenticated with the configured bearer token

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use http::{header::AUTHORIZATION, HeaderMap};
use ring::constant_time;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::{utils::error::ErrorKind, Error, Result, Services};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct QuarantineBody {
    /// Recorded as who quarantined the media, defaults to `admin`
    by: Option<String>,
    reason: String,
    /// Whether thumbnails are quarantined too
    thumbnails: bool,
}

impl QuarantineBody {
    fn by(&self) -> &str {
        self.by.as_deref().unwrap_or("admin")
    }
}

/// Compares tokens in time independent of how much of them matches
fn token_matches(given: &str, expected: &str) -> bool {
    constant_time::verify_slices_are_equal(given.as_bytes(), expected.as_bytes())
        .is_ok()
}

fn authorize(services: &Services, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = services.config.admin.token.as_deref() else {
        return Err(Error::BadRequest(
            ErrorKind::Unrecognized,
            "Admin API is disabled",
        ));
    };

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(Error::BadRequest(
            ErrorKind::MissingToken,
            "Missing access token",
        ))?;

    if token_matches(token, expected) {
        Ok(())
    } else {
        warn!("rejected admin request with a wrong token");
        Err(Error::BadRequest(ErrorKind::Forbidden, "Invalid access token"))
    }
}

/// # `POST /_grapevine/admin/media/quarantine/{serverName}/{mediaId}`
pub(crate) async fn quarantine_media_route(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    Path((origin, media_id)): Path<(String, String)>,
    Json(body): Json<QuarantineBody>,
) -> Result<Json<Value>> {
    authorize(&services, &headers)?;

    let affected = services.quarantine.quarantine_media(
        &media_id,
        &origin,
        body.by(),
        &body.reason,
        body.thumbnails,
    )?;

    Ok(Json(json!({ "affected": affected })))
}

/// # `POST /_grapevine/admin/media/quarantine_user/{userId}`
pub(crate) async fn quarantine_user_media_route(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<QuarantineBody>,
) -> Result<Json<Value>> {
    authorize(&services, &headers)?;

    let affected = services.quarantine.quarantine_media_by_user(
        &user_id,
        body.by(),
        &body.reason,
        body.thumbnails,
    )?;

    Ok(Json(json!({ "affected": affected })))
}

#[cfg(test)]
mod tests {
    use super::token_matches;

    #[test]
    fn tokens_must_match_exactly() {
        assert!(token_matches("secret", "secret"), "same token should match");
        for wrong in ["", "secre", "secrets", "Secret", "terces"] {
            assert!(!token_matches(wrong, "secret"), "{wrong:?} should not match");
        }
    }
}
