//! HTTP handlers

use axum::{body::Body, response::Response};
use http::{
    header::{
        CONTENT_DISPOSITION, CONTENT_SECURITY_POLICY, CONTENT_TYPE,
    },
    HeaderName, HeaderValue,
};
use serde::Deserialize;
use tracing::error;

use crate::{
    service::media::{
        content_disposition_for, Download, ThumbnailRequest,
        DEFAULT_CONTENT_TYPE,
    },
    utils::error::ErrorKind,
    Error, Result,
};

/// `Cross-Origin-Resource-Policy`, which `http` has no constant for
pub(crate) const CROSS_ORIGIN_RESOURCE_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-resource-policy");

pub(crate) mod admin;
pub(crate) mod client_server;
pub(crate) mod server_server;

/// Thumbnail query parameters
///
/// Dimensions are kept as strings so that garbage gets a Matrix error
/// instead of the extractor's plain-text rejection.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ThumbnailQuery {
    width: Option<String>,
    height: Option<String>,
    method: Option<String>,
    #[serde(default = "true_fn")]
    allow_remote: bool,
}

impl ThumbnailQuery {
    fn to_request(&self) -> Result<ThumbnailRequest> {
        Ok(ThumbnailRequest {
            width: parse_dimension(self.width.as_deref())?,
            height: parse_dimension(self.height.as_deref())?,
            method: self.method.clone(),
        })
    }
}

fn parse_dimension(value: Option<&str>) -> Result<Option<u32>> {
    value
        .map(|value| {
            value.parse().map_err(|_| {
                Error::BadRequest(
                    ErrorKind::InvalidParam,
                    "Thumbnail width and height must be positive integers",
                )
            })
        })
        .transpose()
}

fn true_fn() -> bool {
    true
}

/// Value for the `Content-Security-Policy` header
///
/// Cargo-culted from Synapse.
fn content_security_policy() -> HeaderValue {
    [
        "sandbox",
        "default-src 'none'",
        "script-src 'none'",
        "plugin-types application/pdf",
        "style-src 'unsafe-inline'",
        "media-src 'self'",
        "object-src 'self'",
    ]
    .join("; ")
    .try_into()
    .expect("hardcoded header value should be valid")
}

/// Set a header, but panic if it was already set
///
/// # Panics
///
/// Panics if the header was already set.
fn set_header_or_panic(
    response: &mut Response,
    header_name: HeaderName,
    header_value: HeaderValue,
) {
    if let Some(header_value) = response.headers().get(&header_name) {
        error!(?header_name, ?header_value, "unexpected pre-existing header");
        panic!(
            "expected {header_name:?} to be unset but it was set to \
             {header_value:?}"
        );
    }

    response.headers_mut().insert(header_name, header_value);
}

/// Content type safe to put in a header, falling back to the default if the
/// stored one isn't
fn content_type_header(content_type: &str) -> HeaderValue {
    HeaderValue::from_str(content_type).unwrap_or_else(|_| {
        HeaderValue::from_static(DEFAULT_CONTENT_TYPE)
    })
}

fn content_disposition_header(
    content_type: &str,
    filename: &str,
) -> HeaderValue {
    content_disposition_for(content_type, filename)
        .try_into()
        .expect("generated header value should be valid")
}

/// Builds the response for a client download
///
/// `filename` overrides the name the media was uploaded with.
fn media_response(download: Download, filename: Option<&str>) -> Response {
    let filename = filename.unwrap_or(&download.upload_name);
    let content_disposition =
        content_disposition_header(&download.content_type, filename);
    let content_type = content_type_header(&download.content_type);

    let mut response = Response::new(Body::from(download.bytes));
    set_header_or_panic(&mut response, CONTENT_TYPE, content_type);
    set_header_or_panic(&mut response, CONTENT_DISPOSITION, content_disposition);
    set_security_headers(&mut response);

    response
}

/// Adds the headers every piece of served media carries
fn set_security_headers(response: &mut Response) {
    set_header_or_panic(
        response,
        CONTENT_SECURITY_POLICY,
        content_security_policy(),
    );
    set_header_or_panic(
        response,
        CROSS_ORIGIN_RESOURCE_POLICY,
        HeaderValue::from_static("cross-origin"),
    );
}

#[cfg(test)]
mod tests {
    use http::header::{
        CONTENT_DISPOSITION, CONTENT_SECURITY_POLICY, CONTENT_TYPE,
    };

    use super::{
        media_response, parse_dimension, CROSS_ORIGIN_RESOURCE_POLICY,
    };
    use crate::service::media::Download;

    #[test]
    fn media_responses_carry_security_headers() {
        let response = media_response(
            Download {
                content_type: "text/html".to_owned(),
                upload_name: "page.html".to_owned(),
                bytes: b"<script></script>".to_vec(),
            },
            None,
        );

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        };

        assert_eq!(header(CONTENT_TYPE).as_deref(), Some("text/html"));
        assert_eq!(
            header(CONTENT_DISPOSITION).as_deref(),
            Some("attachment; filename=page.html")
        );
        assert_eq!(
            header(CROSS_ORIGIN_RESOURCE_POLICY).as_deref(),
            Some("cross-origin")
        );
        assert!(
            header(CONTENT_SECURITY_POLICY)
                .is_some_and(|csp| csp.starts_with("sandbox")),
            "CSP should sandbox the content"
        );
    }

    #[test]
    fn filename_override_wins() {
        let response = media_response(
            Download {
                content_type: "image/png".to_owned(),
                upload_name: "stored.png".to_owned(),
                bytes: Vec::new(),
            },
            Some("wanted.png"),
        );

        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION),
            Some(&"inline; filename=wanted.png".parse().expect("valid header"))
        );
    }

    #[test]
    fn broken_content_types_fall_back() {
        let response = media_response(
            Download {
                content_type: "text/plain\r\nX-Injected: 1".to_owned(),
                upload_name: String::new(),
                bytes: Vec::new(),
            },
            None,
        );

        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&"application/octet-stream".parse().expect("valid header"))
        );
    }

    #[test]
    fn dimensions_must_be_numbers() {
        assert_eq!(parse_dimension(None).ok(), Some(None));
        assert_eq!(parse_dimension(Some("32")).ok(), Some(Some(32)));
        for invalid in ["-1", "abc", "1.5", ""] {
            assert!(
                parse_dimension(Some(invalid)).is_err(),
                "{invalid:?} should be rejected"
            );
        }
    }
}
