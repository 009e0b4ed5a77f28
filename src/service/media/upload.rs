use std::{error::Error as StdError, sync::Arc};

use bytes::Bytes;
use futures_util::Stream;
use ruma::{OwnedMxcUri, UserId};
use tracing::{debug, info};

use super::{
    is_thumbnailable, Data, MediaId, MediaMetadata, MediaStore, Origin,
    ThumbnailSize, Thumbnailer, DEFAULT_CONTENT_TYPE,
};
use crate::{
    config::SizeLimit,
    utils::{self, error::ErrorKind},
    Error, Result,
};

/// Everything about an upload except its body
#[derive(Clone, Debug, Default)]
pub(crate) struct UploadRequest {
    pub(crate) content_type: Option<String>,
    pub(crate) upload_name: Option<String>,
    /// Matrix user ID of the uploader, empty or absent if unknown
    pub(crate) user_id: Option<String>,
    /// Length announced by the client, if any
    pub(crate) declared_length: Option<u64>,
}

pub(crate) struct Uploader {
    db: Arc<dyn Data>,
    store: Arc<MediaStore>,
    thumbnailer: Arc<Thumbnailer>,
    local_origin: Origin,
    max_file_size: SizeLimit,
    /// Thumbnails generated in the background after each image upload
    pregenerate: Vec<ThumbnailSize>,
}

impl Uploader {
    pub(crate) fn new(
        db: Arc<dyn Data>,
        store: Arc<MediaStore>,
        thumbnailer: Arc<Thumbnailer>,
        local_origin: Origin,
        max_file_size: SizeLimit,
        pregenerate: Vec<ThumbnailSize>,
    ) -> Self {
        Self {
            db,
            store,
            thumbnailer,
            local_origin,
            max_file_size,
            pregenerate,
        }
    }

    pub(crate) fn max_file_size(&self) -> SizeLimit {
        self.max_file_size
    }

    /// Stores a new piece of local media and returns its content URI
    #[tracing::instrument(skip(self, body))]
    pub(crate) async fn upload<S, E>(
        &self,
        request: UploadRequest,
        body: S,
    ) -> Result<OwnedMxcUri>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        if let Some(length) = request.declared_length {
            self.max_file_size.check(length)?;
        }

        let upload_name = request.upload_name.unwrap_or_default();
        if upload_name.starts_with('~') {
            return Err(Error::BadRequest(
                ErrorKind::InvalidParam,
                "Filename must not start with '~'",
            ));
        }

        let user_id = request
            .user_id
            .filter(|user_id| !user_id.is_empty())
            .map(|user_id| {
                UserId::parse(user_id).map_err(|_| {
                    Error::BadRequest(
                        ErrorKind::InvalidParam,
                        "User ID must look like @localpart:domain",
                    )
                })
            })
            .transpose()?;

        let media_id = unused_media_id(&*self.db, &self.local_origin)?;

        // The limit is enforced again here because the declared length may
        // be missing or wrong
        let temp = self.store.write_content(body, self.max_file_size).await?;

        let media = MediaMetadata {
            media_id,
            origin: self.local_origin.clone(),
            content_type: request
                .content_type
                .filter(|content_type| !content_type.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
            file_size: temp.size,
            upload_name,
            hash: temp.hash.clone(),
            user_id,
            created_ts: utils::millis_since_unix_epoch(),
            quarantine: None,
        };

        self.store.finalize(temp).await?;
        self.db.create_file_metadata(&media)?;
        info!(
            media_id = %media.media_id,
            size = media.file_size,
            hash = %media.hash,
            "stored upload",
        );

        let mxc = media.mxc();
        if !self.pregenerate.is_empty()
            && is_thumbnailable(&media.content_type)
        {
            self.thumbnailer.pregenerate(media, self.pregenerate.clone());
        }

        Ok(mxc)
    }
}

/// Picks a fresh media ID that isn't taken yet on `origin`
pub(crate) fn unused_media_id(
    db: &dyn Data,
    origin: &Origin,
) -> Result<MediaId> {
    loop {
        let candidate = MediaId::parse(&utils::random_media_id())?;
        if db.search_file_metadata(&candidate, origin)?.is_none() {
            return Ok(candidate);
        }
        debug!(%candidate, "media ID already taken, trying another");
    }
}
