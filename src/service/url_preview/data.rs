use super::UrlPreview;
use crate::Result;

pub(crate) trait Data: Send + Sync {
    /// Returns a stored preview and when it was generated, in milliseconds
    /// since the Unix epoch
    fn search_url_preview(
        &self,
        url_hash: &str,
    ) -> Result<Option<(UrlPreview, u64)>>;

    /// Stores a preview, replacing any older one for the same URL
    fn set_url_preview(
        &self,
        url_hash: &str,
        url: &str,
        preview: &UrlPreview,
        created_ts: u64,
    ) -> Result<()>;
}
