use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::{
    service::url_preview::{self, UrlPreview},
    Result,
};

impl url_preview::Data for Database {
    fn search_url_preview(
        &self,
        url_hash: &str,
    ) -> Result<Option<(UrlPreview, u64)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT preview, creation_ts FROM url_previews \
                 WHERE url_hash = ?1",
                params![url_hash],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)),
            )
            .optional()?;

        row.map(|(preview, created_ts)| {
            Ok((serde_json::from_str(&preview)?, created_ts))
        })
        .transpose()
    }

    fn set_url_preview(
        &self,
        url_hash: &str,
        url: &str,
        preview: &UrlPreview,
        created_ts: u64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO url_previews \
             (url_hash, url, preview, creation_ts) VALUES (?1, ?2, ?3, ?4)",
            params![url_hash, url, serde_json::to_string(preview)?, created_ts],
        )?;

        Ok(())
    }
}
