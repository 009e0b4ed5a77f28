//! Request-level errors and their mapping onto HTTP responses

use std::sync::Arc;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;
use strum::IntoStaticStr;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    error::DisplayWithSources,
    service::{
        federation::FetchError, media::ContentHash, url_preview::PreviewError,
    },
};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Machine-readable error codes sent in the `errcode` field
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum ErrorKind {
    #[strum(serialize = "M_FORBIDDEN")]
    Forbidden,
    #[strum(serialize = "M_INVALID_PARAM")]
    InvalidParam,
    #[strum(serialize = "M_MISSING_PARAM")]
    MissingParam,
    #[strum(serialize = "M_MISSING_TOKEN")]
    MissingToken,
    #[strum(serialize = "M_NOT_FOUND")]
    NotFound,
    #[strum(serialize = "M_TOO_LARGE")]
    TooLarge,
    #[strum(serialize = "M_UNKNOWN")]
    Unknown,
    #[strum(serialize = "M_UNRECOGNIZED")]
    Unrecognized,
}

// Missing docs are allowed here since that kind of information should be
// encoded in the error messages themselves anyway.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("{1}")]
    BadRequest(ErrorKind, &'static str),

    /// A media ID or origin that can't possibly exist
    ///
    /// This is reported exactly like [`Error::NotFound`] so that callers can't
    /// distinguish malformed identifiers from missing media.
    #[error("malformed media identifier")]
    InvalidIdentifier,

    #[error("media not found")]
    NotFound,

    #[error("file is too large, the maximum is {0} bytes")]
    TooLarge(u64),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("database error")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    BadDatabase(&'static str),

    #[error("failed to (de)serialize JSON")]
    Json(#[from] serde_json::Error),

    #[error("stored content hashes to {actual} instead of {expected}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("failed to process image")]
    Image(#[from] image::ImageError),

    #[error("failed to fetch remote media")]
    Federation(#[from] FetchError),

    #[error("failed to generate URL preview")]
    UrlPreview(#[from] PreviewError),

    #[error("failed to read request body")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),

    #[error("operation was canceled before it completed")]
    Canceled,

    /// An error produced once and handed to every waiter of a coalesced
    /// request
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    pub(crate) fn bad_database(message: &'static str) -> Self {
        error!("BadDatabase: {}", message);
        Self::BadDatabase(message)
    }

    /// Returns the innermost error, looking through [`Error::Shared`]
    pub(crate) fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    fn status_and_kind(&self) -> (StatusCode, ErrorKind) {
        use ErrorKind as Kind;

        match self.root() {
            Error::BadRequest(kind, _) => {
                let status = match kind {
                    Kind::Forbidden => StatusCode::FORBIDDEN,
                    Kind::MissingToken => StatusCode::UNAUTHORIZED,
                    Kind::NotFound | Kind::Unrecognized => {
                        StatusCode::NOT_FOUND
                    }
                    Kind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                    Kind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
                    Kind::InvalidParam | Kind::MissingParam => {
                        StatusCode::BAD_REQUEST
                    }
                };
                (status, *kind)
            }
            Error::InvalidIdentifier
            | Error::NotFound
            | Error::Federation(_) => (StatusCode::NOT_FOUND, Kind::NotFound),
            Error::TooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, Kind::TooLarge),
            Error::Body(_) => (StatusCode::BAD_REQUEST, Kind::Unknown),
            Error::Io(_)
            | Error::Database(_)
            | Error::BadDatabase(_)
            | Error::Json(_)
            | Error::HashMismatch { .. }
            | Error::Image(_)
            | Error::UrlPreview(_)
            | Error::Join(_)
            | Error::Canceled
            | Error::Shared(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Kind::Unknown)
            }
        }
    }

    /// The message shown to clients
    fn client_message(&self) -> String {
        match self.root() {
            Error::InvalidIdentifier | Error::NotFound | Error::Federation(_) => {
                "Media not found".to_owned()
            }
            Error::UrlPreview(e) => e.to_string(),
            e @ (Error::BadRequest(..) | Error::TooLarge(_)) => e.to_string(),
            Error::Body(_) => "Failed to read request body".to_owned(),
            _ => "Internal server error".to_owned(),
        }
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        self.status_and_kind().0
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        self.status_and_kind().1
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let details = DisplayWithSources {
            error: &self,
            infix: ": ",
        };

        if status.is_server_error() {
            error!(%status, error = %details, "request failed");
        } else if status == StatusCode::NOT_FOUND {
            debug!(error = %details, "not found");
        } else {
            info!(%status, error = %details, "bad request");
        }

        let errcode: &'static str = self.kind().into();
        (
            status,
            Json(json!({
                "errcode": errcode,
                "error": self.client_message(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::StatusCode;

    use super::{Error, ErrorKind};

    #[test]
    fn identifier_errors_look_like_missing_media() {
        assert_eq!(
            Error::InvalidIdentifier.status_code(),
            StatusCode::NOT_FOUND,
            "malformed identifiers should not be distinguishable"
        );
        assert_eq!(Error::InvalidIdentifier.kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::InvalidIdentifier.client_message(),
            Error::NotFound.client_message(),
        );
    }

    #[test]
    fn too_large_names_the_limit() {
        let error = Error::TooLarge(1024);
        assert_eq!(error.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(
            error.client_message().contains("1024"),
            "message should include the configured maximum"
        );
    }

    #[test]
    fn shared_errors_keep_their_root_status() {
        let shared = Error::Shared(Arc::new(Error::Shared(Arc::new(
            Error::TooLarge(5),
        ))));
        assert_eq!(shared.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(
            matches!(shared.root(), Error::TooLarge(5)),
            "root should unwrap every layer of sharing"
        );
    }

    #[test]
    fn storage_faults_are_not_exposed() {
        let error = Error::Io(std::io::Error::other("disk on fire"));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            !error.client_message().contains("disk"),
            "internal details should stay in the logs"
        );
    }
}
