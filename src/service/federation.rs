//! Retrieval of media owned by other servers

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use http::{header, StatusCode};
use thiserror::Error;
use tracing::debug;

use super::media::{filename_from_header, MediaId, Origin};
use crate::{config::SizeLimit, utils, Error};

/// Reasons a remote fetch can fail
// Missing docs are allowed here since that kind of information should be
// encoded in the error messages themselves anyway.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub(crate) enum FetchError {
    #[error("request to remote server failed")]
    Request(#[from] reqwest::Error),

    #[error("remote server responded with {0}")]
    Status(StatusCode),

    #[error("remote content is larger than the maximum of {0} bytes")]
    TooLarge(u64),

    #[error("remote server sent an invalid Content-Length")]
    InvalidLength,
}

/// A successful response from the owning server, body not yet read
pub(crate) struct RemoteMedia {
    pub(crate) content_type: Option<String>,
    pub(crate) filename: Option<String>,
    pub(crate) body: BoxStream<'static, Result<Bytes, FetchError>>,
}

#[async_trait]
pub(crate) trait FederationClient: Send + Sync {
    /// Asks `origin` for its media `media_id`
    ///
    /// Responses that declare more than `limit` bytes are rejected before
    /// the body is read. The body itself is not capped here.
    async fn fetch_media(
        &self,
        origin: &Origin,
        media_id: &MediaId,
        limit: SizeLimit,
    ) -> Result<RemoteMedia, FetchError>;
}

/// Fetches media straight from the origin over HTTPS
pub(crate) struct HttpFederationClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFederationClient {
    pub(crate) fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(FetchError::from)?;

        Ok(Self {
            client,
            timeout,
        })
    }
}

#[async_trait]
impl FederationClient for HttpFederationClient {
    #[tracing::instrument(skip(self))]
    async fn fetch_media(
        &self,
        origin: &Origin,
        media_id: &MediaId,
        limit: SizeLimit,
    ) -> Result<RemoteMedia, FetchError> {
        let url = format!(
            "https://{origin}/_matrix/media/v3/download/{origin}/{media_id}"
        );
        let timeout_ms = self.timeout.as_millis().to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("allow_remote", "false"),
                ("allow_redirect", "false"),
                ("timeout_ms", timeout_ms.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let headers = response.headers();
        let header_str = |name: header::HeaderName| {
            headers.get(name).and_then(|v| v.to_str().ok())
        };

        let content_length =
            utils::parse_content_length(header_str(header::CONTENT_LENGTH), limit)
                .map_err(|error| match error {
                    Error::TooLarge(max) => FetchError::TooLarge(max),
                    _ => FetchError::InvalidLength,
                })?;
        debug!(?content_length, "remote server accepted request");

        let content_type = header_str(header::CONTENT_TYPE).map(str::to_owned);
        let filename =
            header_str(header::CONTENT_DISPOSITION).and_then(filename_from_header);

        Ok(RemoteMedia {
            content_type,
            filename,
            body: response.bytes_stream().map_err(FetchError::from).boxed(),
        })
    }
}
