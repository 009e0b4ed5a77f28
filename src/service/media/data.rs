use ruma::UserId;

use super::{
    MediaId, MediaMetadata, Origin, QuarantineRecord, ThumbnailMetadata,
    ThumbnailSize,
};
use crate::Result;

pub(crate) trait Data: Send + Sync {
    /// Stores metadata for a new piece of media
    ///
    /// Fails if `(media_id, origin)` is already taken.
    fn create_file_metadata(&self, meta: &MediaMetadata) -> Result<()>;

    fn search_file_metadata(
        &self,
        media_id: &MediaId,
        origin: &Origin,
    ) -> Result<Option<MediaMetadata>>;

    /// Stores metadata for a thumbnail, keeping the existing row if the same
    /// thumbnail was already recorded
    fn create_thumbnail_metadata(&self, meta: &ThumbnailMetadata) -> Result<()>;

    fn search_thumbnail_metadata(
        &self,
        media_id: &MediaId,
        origin: &Origin,
        size: ThumbnailSize,
    ) -> Result<Option<ThumbnailMetadata>>;

    /// All thumbnails stored for a piece of media
    fn thumbnails_for(
        &self,
        media_id: &MediaId,
        origin: &Origin,
    ) -> Result<Vec<ThumbnailMetadata>>;

    /// Flags one piece of media, and optionally its thumbnails, atomically.
    /// Returns the number of media rows affected.
    fn quarantine_media(
        &self,
        media_id: &MediaId,
        origin: &Origin,
        record: &QuarantineRecord,
        also_thumbnails: bool,
    ) -> Result<u64>;

    /// Flags everything uploaded by `user_id`, and optionally the thumbnails,
    /// atomically. Returns the number of media rows affected.
    fn quarantine_media_by_user(
        &self,
        user_id: &UserId,
        record: &QuarantineRecord,
        also_thumbnails: bool,
    ) -> Result<u64>;
}
