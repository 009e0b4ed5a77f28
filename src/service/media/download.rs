use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    is_thumbnailable, Data, MediaId, MediaMetadata, MediaStore, Origin,
    ResizeMethod, ThumbnailMetadata, ThumbnailSize, Thumbnailer,
    DEFAULT_CONTENT_TYPE,
};
use crate::{
    config::SizeLimit,
    error::DisplayWithSources,
    service::{federation::FederationClient, Coordinator},
    utils::{self, error::ErrorKind},
    Error, Result,
};

/// Thumbnail parameters exactly as the client sent them
#[derive(Clone, Debug, Default)]
pub(crate) struct ThumbnailRequest {
    pub(crate) width: Option<u32>,
    pub(crate) height: Option<u32>,
    pub(crate) method: Option<String>,
}

impl ThumbnailRequest {
    fn size(&self) -> Result<ThumbnailSize> {
        let (Some(width), Some(height)) = (self.width, self.height) else {
            return Err(Error::BadRequest(
                ErrorKind::MissingParam,
                "Thumbnail width and height are required",
            ));
        };

        ThumbnailSize::new(
            width,
            height,
            ResizeMethod::parse(self.method.as_deref())?,
        )
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DownloadRequest {
    pub(crate) media_id: String,
    pub(crate) origin: String,
    /// Whether media missing locally may be fetched from its origin
    pub(crate) allow_remote: bool,
    /// Whether the request came from another server, which never causes a
    /// remote fetch
    pub(crate) federation: bool,
    pub(crate) thumbnail: Option<ThumbnailRequest>,
}

/// Content ready to be sent
#[derive(Debug)]
pub(crate) struct Download {
    pub(crate) content_type: String,
    pub(crate) upload_name: String,
    pub(crate) bytes: Vec<u8>,
}

pub(crate) struct Downloader {
    db: Arc<dyn Data>,
    store: Arc<MediaStore>,
    thumbnailer: Arc<Thumbnailer>,
    federation: Arc<dyn FederationClient>,
    remote_fetches: Arc<Coordinator<MediaMetadata>>,
    local_origin: Origin,
    max_file_size: SizeLimit,
    dynamic_thumbnails: bool,
}

/// Settings the download pipeline needs from the configuration
pub(crate) struct DownloadSettings {
    pub(crate) local_origin: Origin,
    pub(crate) max_file_size: SizeLimit,
    pub(crate) dynamic_thumbnails: bool,
}

impl Downloader {
    pub(crate) fn new(
        db: Arc<dyn Data>,
        store: Arc<MediaStore>,
        thumbnailer: Arc<Thumbnailer>,
        federation: Arc<dyn FederationClient>,
        remote_fetches: Arc<Coordinator<MediaMetadata>>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            db,
            store,
            thumbnailer,
            federation,
            remote_fetches,
            local_origin: settings.local_origin,
            max_file_size: settings.max_file_size,
            dynamic_thumbnails: settings.dynamic_thumbnails,
        }
    }

    /// Finds the requested content, fetching it from its origin if needed
    ///
    /// Anything that can't be served, for whatever reason other than bad
    /// thumbnail parameters, is reported as [`Error::NotFound`].
    #[tracing::instrument(skip(self))]
    pub(crate) async fn download(
        &self,
        request: &DownloadRequest,
    ) -> Result<Download> {
        let media_id = MediaId::parse(&request.media_id)?;
        let origin = Origin::parse(&request.origin)?;
        let size =
            request.thumbnail.as_ref().map(ThumbnailRequest::size).transpose()?;

        let media = self.metadata(&media_id, &origin, request).await?;
        if media.is_quarantined() {
            info!(%media_id, %origin, "refusing to serve quarantined media");
            return Err(Error::NotFound);
        }

        if let Some(size) = size {
            if let Some(thumbnail) = self.thumbnail(&media, size).await? {
                return Ok(Download {
                    content_type: thumbnail.content_type,
                    upload_name: media.upload_name,
                    bytes: self.store.read(&thumbnail.hash).await?,
                });
            }
        }

        Ok(Download {
            bytes: self.store.read(&media.hash).await?,
            content_type: media.content_type,
            upload_name: media.upload_name,
        })
    }

    async fn metadata(
        &self,
        media_id: &MediaId,
        origin: &Origin,
        request: &DownloadRequest,
    ) -> Result<MediaMetadata> {
        if let Some(media) = self.db.search_file_metadata(media_id, origin)? {
            return Ok(media);
        }

        if *origin == self.local_origin
            || request.federation
            || !request.allow_remote
        {
            return Err(Error::NotFound);
        }

        self.remote_fetches
            .run(format!("{origin}/{media_id}"), || {
                self.fetch_remote(media_id, origin)
            })
            .await
            .map_err(|error| {
                warn!(
                    %media_id,
                    %origin,
                    error = %DisplayWithSources {
                        error: &error,
                        infix: ": ",
                    },
                    "failed to fetch remote media",
                );
                Error::NotFound
            })
    }

    /// Fetches remote media and commits it, so later requests are served
    /// locally
    async fn fetch_remote(
        &self,
        media_id: &MediaId,
        origin: &Origin,
    ) -> Result<MediaMetadata> {
        if let Some(media) = self.db.search_file_metadata(media_id, origin)? {
            return Ok(media);
        }

        let remote = self
            .federation
            .fetch_media(origin, media_id, self.max_file_size)
            .await?;
        let temp =
            self.store.write_content(remote.body, self.max_file_size).await?;

        let media = MediaMetadata {
            media_id: media_id.clone(),
            origin: origin.clone(),
            content_type: remote
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            file_size: temp.size,
            upload_name: remote.filename.unwrap_or_default(),
            hash: temp.hash.clone(),
            user_id: None,
            created_ts: utils::millis_since_unix_epoch(),
            quarantine: None,
        };

        self.store.finalize(temp).await?;
        self.db.create_file_metadata(&media)?;

        debug!(size = media.file_size, "stored remote media");
        Ok(media)
    }

    /// Picks the thumbnail to serve, or `None` to serve the original
    async fn thumbnail(
        &self,
        media: &MediaMetadata,
        size: ThumbnailSize,
    ) -> Result<Option<ThumbnailMetadata>> {
        let exact = self.db.search_thumbnail_metadata(
            &media.media_id,
            &media.origin,
            size,
        )?;

        match exact {
            Some(thumbnail) if thumbnail.quarantine.is_none() => {
                return Ok(Some(thumbnail));
            }
            // Quarantined thumbnails are never regenerated
            Some(_) => {}
            None if self.dynamic_thumbnails
                && is_thumbnailable(&media.content_type) =>
            {
                match self.thumbnailer.generate(media, size).await {
                    Ok(Some(thumbnail)) => return Ok(Some(thumbnail)),
                    Ok(None) => {}
                    Err(error) => {
                        warn!(%error, %size, "failed to generate thumbnail");
                    }
                }
            }
            None => {}
        }

        let stored = self.db.thumbnails_for(&media.media_id, &media.origin)?;
        Ok(best_fit(stored, size))
    }
}

/// Chooses the smallest stored thumbnail that covers `size`, preferring the
/// requested method
fn best_fit(
    candidates: Vec<ThumbnailMetadata>,
    size: ThumbnailSize,
) -> Option<ThumbnailMetadata> {
    candidates
        .into_iter()
        .filter(|t| {
            t.quarantine.is_none()
                && t.size.width >= size.width
                && t.size.height >= size.height
        })
        .min_by_key(|t| {
            (
                t.size.method != size.method,
                u64::from(t.size.width) * u64::from(t.size.height),
            )
        })
}
