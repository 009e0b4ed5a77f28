//! Link previews built from Open Graph metadata

use std::{net::IpAddr, sync::Arc, time::Duration};

use futures_util::StreamExt;
use http::{header, StatusCode};
use lru_cache::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::{redirect, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use crate::{
    config::{SizeLimit, UrlPreviewConfig},
    service::{
        media::{self, MediaMetadata, MediaStore, Origin, ThumbnailSize},
        Coordinator,
    },
    utils, Error, Result,
};

mod data;
mod ip_filter;
mod open_graph;

pub(crate) use data::Data;
use ip_filter::{AddressFilter, FilteringResolver};

/// Redirects followed before giving up
const MAX_REDIRECTS: usize = 5;

// Missing docs are allowed here since that kind of information should be
// encoded in the error messages themselves anyway.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub(crate) enum PreviewError {
    #[error("URL is not allowed to be previewed")]
    Denied,

    #[error("URL is not valid")]
    InvalidUrl,

    #[error("only http and https URLs can be previewed")]
    UnsupportedScheme,

    #[error("URL points at a forbidden address")]
    ForbiddenAddress,

    #[error("failed to fetch URL")]
    Request(#[from] reqwest::Error),

    #[error("URL responded with {0}")]
    Status(StatusCode),

    #[error("page is larger than the maximum of {0} bytes")]
    TooLarge(u64),
}

/// Preview of a URL, as sent to clients
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UrlPreview {
    #[serde(rename = "og:title", skip_serializing_if = "Option::is_none")]
    pub(crate) title: Option<String>,

    #[serde(
        rename = "og:description",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) description: Option<String>,

    #[serde(rename = "og:type", skip_serializing_if = "Option::is_none")]
    pub(crate) kind: Option<String>,

    #[serde(rename = "og:url", skip_serializing_if = "Option::is_none")]
    pub(crate) url: Option<String>,

    /// `mxc://` URI of the stored preview image
    #[serde(rename = "og:image", skip_serializing_if = "Option::is_none")]
    pub(crate) image: Option<String>,

    #[serde(rename = "og:image:type", skip_serializing_if = "Option::is_none")]
    pub(crate) image_type: Option<String>,

    #[serde(
        rename = "og:image:width",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) image_width: Option<u32>,

    #[serde(
        rename = "og:image:height",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) image_height: Option<u32>,

    #[serde(
        rename = "matrix:image:size",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) image_size: Option<u64>,
}

/// Settings the previewer needs besides its collaborators
struct Settings {
    denylist: Vec<Regex>,
    max_page_size: SizeLimit,
    cache_lifetime: Duration,
    image_size: Option<ThumbnailSize>,
    local_origin: Origin,
}

pub(crate) struct UrlPreviewer {
    db: Arc<dyn Data>,
    media_db: Arc<dyn media::Data>,
    store: Arc<MediaStore>,
    client: reqwest::Client,
    filter: Arc<AddressFilter>,
    coordinator: Arc<Coordinator<UrlPreview>>,
    /// Recently generated previews and when they were generated
    cache: Mutex<LruCache<String, (UrlPreview, u64)>>,
    settings: Settings,
}

impl UrlPreviewer {
    pub(crate) fn new(
        db: Arc<dyn Data>,
        media_db: Arc<dyn media::Data>,
        store: Arc<MediaStore>,
        coordinator: Arc<Coordinator<UrlPreview>>,
        local_origin: Origin,
        config: &UrlPreviewConfig,
    ) -> Result<Self> {
        let filter = Arc::new(AddressFilter::new(
            config.allow_networks.clone(),
            config.deny_networks.clone(),
        ));

        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .unwrap_or_else(|error| {
                warn!(
                    %error,
                    "failed to read system DNS configuration, using defaults"
                );
                TokioAsyncResolver::tokio(
                    ResolverConfig::default(),
                    ResolverOpts::default(),
                )
            });

        let redirect_filter = Arc::clone(&filter);
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .dns_resolver(Arc::new(FilteringResolver::new(
                resolver,
                Arc::clone(&filter),
            )))
            .redirect(redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error("too many redirects")
                } else if check_url(attempt.url(), &redirect_filter).is_err() {
                    attempt.error("redirect target is not allowed")
                } else {
                    attempt.follow()
                }
            }))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(PreviewError::from)?;

        Ok(Self {
            db,
            media_db,
            store,
            client,
            filter,
            coordinator,
            cache: Mutex::new(LruCache::new(config.cache_capacity)),
            settings: Settings {
                denylist: config.denylist.clone(),
                max_page_size: config.max_page_size,
                cache_lifetime: config.cache_lifetime(),
                image_size: config.thumbnail_size,
                local_origin,
            },
        })
    }

    /// Returns a preview of `url`, from cache if a fresh one exists
    #[tracing::instrument(skip(self))]
    pub(crate) async fn preview(&self, url: &str) -> Result<UrlPreview> {
        if self.settings.denylist.iter().any(|re| re.is_match(url)) {
            debug!("URL matches the denylist");
            return Err(PreviewError::Denied.into());
        }

        let mut url = Url::parse(url).map_err(|_| PreviewError::InvalidUrl)?;
        url.set_fragment(None);
        check_url(&url, &self.filter)?;

        let key = url.as_str().to_owned();
        let url_hash = utils::sha256_base64(key.as_bytes());

        if let Some(preview) = self.cached(&url_hash)? {
            return Ok(preview);
        }

        self.coordinator
            .run(key, || self.generate(&url, &url_hash))
            .await
    }

    fn cached(&self, url_hash: &str) -> Result<Option<UrlPreview>> {
        let lifetime =
            u64::try_from(self.settings.cache_lifetime.as_millis())
                .unwrap_or(u64::MAX);
        let now = utils::millis_since_unix_epoch();
        let fresh = |created_ts: u64| now.saturating_sub(created_ts) < lifetime;

        if let Some((preview, created_ts)) = self.cache.lock().get_mut(url_hash)
        {
            if fresh(*created_ts) {
                return Ok(Some(preview.clone()));
            }
        }

        match self.db.search_url_preview(url_hash)? {
            Some((preview, created_ts)) if fresh(created_ts) => {
                self.cache
                    .lock()
                    .insert(url_hash.to_owned(), (preview.clone(), created_ts));
                Ok(Some(preview))
            }
            _ => Ok(None),
        }
    }

    async fn generate(&self, url: &Url, url_hash: &str) -> Result<UrlPreview> {
        // Another request may have finished this URL while we were waiting
        if let Some(preview) = self.cached(url_hash)? {
            return Ok(preview);
        }

        let (content_type, body) = self.fetch(url).await?;

        let preview = if content_type.starts_with("image/") {
            let mut preview = self.store_image(body, &content_type).await?;
            preview.url = Some(url.to_string());
            preview
        } else {
            let graph = open_graph::parse(&String::from_utf8_lossy(&body));
            let mut preview = match graph.image.and_then(|i| url.join(&i).ok())
            {
                Some(image_url) => {
                    self.preview_image(&image_url).await.unwrap_or_else(|e| {
                        warn!(
                            %image_url,
                            error = %e,
                            "failed to fetch preview image"
                        );
                        UrlPreview::default()
                    })
                }
                None => UrlPreview::default(),
            };
            preview.title = graph.title;
            preview.description = graph.description;
            preview.kind = graph.kind;
            preview.url = graph.url.or_else(|| Some(url.to_string()));
            preview
        };

        let created_ts = utils::millis_since_unix_epoch();
        self.db.set_url_preview(url_hash, url.as_str(), &preview, created_ts)?;
        self.cache
            .lock()
            .insert(url_hash.to_owned(), (preview.clone(), created_ts));

        debug!("generated preview");
        Ok(preview)
    }

    async fn preview_image(&self, url: &Url) -> Result<UrlPreview> {
        check_url(url, &self.filter)?;

        let (content_type, body) = self.fetch(url).await?;
        if !content_type.starts_with("image/") {
            debug!(%content_type, "preview image is not an image");
            return Ok(UrlPreview::default());
        }

        self.store_image(body, &content_type).await
    }

    /// Downloads `url`, returning its content type and body
    async fn fetch(&self, url: &Url) -> Result<(String, Vec<u8>)> {
        let limit = self.settings.max_page_size;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(PreviewError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PreviewError::Status(status).into());
        }

        let content_length = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok());
        utils::parse_content_length(content_length, limit).map_err(
            |error| match error {
                Error::TooLarge(max) => PreviewError::TooLarge(max).into(),
                other => other,
            },
        )?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.map_err(PreviewError::from)?);

            let size = u64::try_from(body.len()).unwrap_or(u64::MAX);
            if let Some(max) = limit.bytes().filter(|max| size > *max) {
                return Err(PreviewError::TooLarge(max).into());
            }
        }

        Ok((content_type, body))
    }

    /// Stores an image as local media, resized to the configured size
    async fn store_image(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<UrlPreview> {
        let size = self.settings.image_size;
        let content_type = content_type.to_owned();

        let (bytes, content_type, dimensions) =
            tokio::task::spawn_blocking(move || -> Result<_> {
                let (bytes, content_type) = match size {
                    Some(size) => media::resize(&bytes, size)?
                        .map_or((bytes, content_type), |(resized, t)| {
                            (resized, t.to_owned())
                        }),
                    None => (bytes, content_type),
                };
                let dimensions = image::load_from_memory(&bytes)
                    .ok()
                    .map(|image| (image.width(), image.height()));
                Ok((bytes, content_type, dimensions))
            })
            .await??;

        let (hash, file_size) = self.store.store_bytes(bytes).await?;
        let media = MediaMetadata {
            media_id: media::unused_media_id(
                &*self.media_db,
                &self.settings.local_origin,
            )?,
            origin: self.settings.local_origin.clone(),
            content_type,
            file_size,
            upload_name: String::new(),
            hash,
            user_id: None,
            created_ts: utils::millis_since_unix_epoch(),
            quarantine: None,
        };
        self.media_db.create_file_metadata(&media)?;

        Ok(UrlPreview {
            image: Some(media.mxc().to_string()),
            image_type: Some(media.content_type),
            image_width: dimensions.map(|(width, _)| width),
            image_height: dimensions.map(|(_, height)| height),
            image_size: Some(media.file_size),
            ..UrlPreview::default()
        })
    }
}

/// Rejects schemes other than HTTP(S) and literal addresses that fail the
/// filter
///
/// Hostnames are checked when they are resolved.
fn check_url(url: &Url, filter: &AddressFilter) -> Result<(), PreviewError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PreviewError::UnsupportedScheme);
    }

    let host = url.host_str().ok_or(PreviewError::InvalidUrl)?;
    // IPv6 literals keep their brackets in URLs
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let Ok(ip) = host.parse::<IpAddr>() else {
        return Ok(());
    };

    if filter.is_allowed(ip) {
        Ok(())
    } else {
        warn!(%ip, "refusing to preview forbidden address");
        Err(PreviewError::ForbiddenAddress)
    }
}
