use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef},
    OptionalExtension, Row, ToSql,
};
use ruma::{OwnedUserId, UserId};

use super::Database;
use crate::{
    service::media::{
        self, ContentHash, MediaId, MediaMetadata, Origin, QuarantineRecord,
        ResizeMethod, ThumbnailMetadata, ThumbnailSize,
    },
    Error, Result,
};

const MEDIA_COLUMNS: &str = "media_id, media_origin, content_type, file_size, \
                             upload_name, base64hash, user_id, creation_ts, \
                             quarantined, quarantined_at, quarantined_by, \
                             quarantine_reason";

const THUMBNAIL_COLUMNS: &str = "media_id, media_origin, width, height, \
                                 resize_method, content_type, file_size, \
                                 base64hash, creation_ts, quarantined, \
                                 quarantined_at, quarantined_by, \
                                 quarantine_reason";

/// Converts a stored string back into a validated identifier
fn from_text<T, F>(value: ValueRef<'_>, parse: F) -> FromSqlResult<T>
where
    F: FnOnce(&str) -> Option<T>,
{
    parse(value.as_str()?).ok_or_else(|| {
        FromSqlError::Other(Box::new(Error::bad_database(
            "invalid identifier in database",
        )))
    })
}

impl ToSql for MediaId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for MediaId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        from_text(value, |s| MediaId::parse(s).ok())
    }
}

impl ToSql for Origin {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Origin {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        from_text(value, |s| Origin::parse(s).ok())
    }
}

impl ToSql for ContentHash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ContentHash {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        from_text(value, ContentHash::parse)
    }
}

impl ToSql for ResizeMethod {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_ref().into())
    }
}

impl FromSql for ResizeMethod {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        from_text(value, |s| s.parse().ok())
    }
}

/// Reads the quarantine columns starting at `first`
fn quarantine_from_row(
    row: &Row<'_>,
    first: usize,
) -> rusqlite::Result<Option<QuarantineRecord>> {
    if !row.get::<_, bool>(first)? {
        return Ok(None);
    }

    Ok(Some(QuarantineRecord {
        quarantined_at: row.get::<_, Option<u64>>(first + 1)?.unwrap_or(0),
        quarantined_by: row
            .get::<_, Option<String>>(first + 2)?
            .unwrap_or_default(),
        reason: row.get::<_, Option<String>>(first + 3)?.unwrap_or_default(),
    }))
}

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaMetadata> {
    let user_id: String = row.get(6)?;
    let user_id = if user_id.is_empty() {
        None
    } else {
        Some(UserId::parse(user_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?)
    };

    Ok(MediaMetadata {
        media_id: row.get(0)?,
        origin: row.get(1)?,
        content_type: row.get(2)?,
        file_size: row.get(3)?,
        upload_name: row.get(4)?,
        hash: row.get(5)?,
        user_id,
        created_ts: row.get(7)?,
        quarantine: quarantine_from_row(row, 8)?,
    })
}

fn thumbnail_from_row(row: &Row<'_>) -> rusqlite::Result<ThumbnailMetadata> {
    Ok(ThumbnailMetadata {
        media_id: row.get(0)?,
        origin: row.get(1)?,
        size: ThumbnailSize {
            width: row.get(2)?,
            height: row.get(3)?,
            method: row.get(4)?,
        },
        content_type: row.get(5)?,
        file_size: row.get(6)?,
        hash: row.get(7)?,
        created_ts: row.get(8)?,
        quarantine: quarantine_from_row(row, 9)?,
    })
}

fn user_id_column(user_id: Option<&OwnedUserId>) -> &str {
    user_id.map_or("", |u| u.as_str())
}

impl media::Data for Database {
    fn create_file_metadata(&self, meta: &MediaMetadata) -> Result<()> {
        self.conn().execute(
            "INSERT INTO media_repository (media_id, media_origin, \
             content_type, file_size, upload_name, base64hash, user_id, \
             creation_ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                meta.media_id,
                meta.origin,
                meta.content_type,
                meta.file_size,
                meta.upload_name,
                meta.hash,
                user_id_column(meta.user_id.as_ref()),
                meta.created_ts,
            ],
        )?;

        Ok(())
    }

    fn search_file_metadata(
        &self,
        media_id: &MediaId,
        origin: &Origin,
    ) -> Result<Option<MediaMetadata>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MEDIA_COLUMNS} FROM media_repository \
                     WHERE media_id = ?1 AND media_origin = ?2"
                ),
                params![media_id, origin],
                media_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    fn create_thumbnail_metadata(&self, meta: &ThumbnailMetadata) -> Result<()> {
        self.conn().execute(
            "INSERT INTO thumbnails (media_id, media_origin, width, height, \
             resize_method, content_type, file_size, base64hash, \
             creation_ts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT DO NOTHING",
            params![
                meta.media_id,
                meta.origin,
                meta.size.width,
                meta.size.height,
                meta.size.method,
                meta.content_type,
                meta.file_size,
                meta.hash,
                meta.created_ts,
            ],
        )?;

        Ok(())
    }

    fn search_thumbnail_metadata(
        &self,
        media_id: &MediaId,
        origin: &Origin,
        size: ThumbnailSize,
    ) -> Result<Option<ThumbnailMetadata>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {THUMBNAIL_COLUMNS} FROM thumbnails \
                     WHERE media_id = ?1 AND media_origin = ?2 \
                     AND width = ?3 AND height = ?4 AND resize_method = ?5"
                ),
                params![media_id, origin, size.width, size.height, size.method],
                thumbnail_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    fn thumbnails_for(
        &self,
        media_id: &MediaId,
        origin: &Origin,
    ) -> Result<Vec<ThumbnailMetadata>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {THUMBNAIL_COLUMNS} FROM thumbnails \
             WHERE media_id = ?1 AND media_origin = ?2 \
             ORDER BY width, height"
        ))?;

        let thumbnails = stmt
            .query_map(params![media_id, origin], thumbnail_from_row)?
            .collect::<rusqlite::Result<_>>()?;

        Ok(thumbnails)
    }

    fn quarantine_media(
        &self,
        media_id: &MediaId,
        origin: &Origin,
        record: &QuarantineRecord,
        also_thumbnails: bool,
    ) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let affected = tx.execute(
            "UPDATE media_repository SET quarantined = 1, \
             quarantined_at = ?3, quarantined_by = ?4, \
             quarantine_reason = ?5 \
             WHERE media_id = ?1 AND media_origin = ?2",
            params![
                media_id,
                origin,
                record.quarantined_at,
                record.quarantined_by,
                record.reason,
            ],
        )?;

        if also_thumbnails {
            tx.execute(
                "UPDATE thumbnails SET quarantined = 1, \
                 quarantined_at = ?3, quarantined_by = ?4, \
                 quarantine_reason = ?5 \
                 WHERE media_id = ?1 AND media_origin = ?2",
                params![
                    media_id,
                    origin,
                    record.quarantined_at,
                    record.quarantined_by,
                    record.reason,
                ],
            )?;
        }

        tx.commit()?;

        Ok(u64::try_from(affected).unwrap_or(u64::MAX))
    }

    fn quarantine_media_by_user(
        &self,
        user_id: &UserId,
        record: &QuarantineRecord,
        also_thumbnails: bool,
    ) -> Result<u64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if also_thumbnails {
            tx.execute(
                "UPDATE thumbnails SET quarantined = 1, \
                 quarantined_at = ?2, quarantined_by = ?3, \
                 quarantine_reason = ?4 \
                 WHERE EXISTS (SELECT 1 FROM media_repository m \
                     WHERE m.media_id = thumbnails.media_id \
                     AND m.media_origin = thumbnails.media_origin \
                     AND m.user_id = ?1)",
                params![
                    user_id.as_str(),
                    record.quarantined_at,
                    record.quarantined_by,
                    record.reason,
                ],
            )?;
        }

        let affected = tx.execute(
            "UPDATE media_repository SET quarantined = 1, \
             quarantined_at = ?2, quarantined_by = ?3, \
             quarantine_reason = ?4 \
             WHERE user_id = ?1",
            params![
                user_id.as_str(),
                record.quarantined_at,
                record.quarantined_by,
                record.reason,
            ],
        )?;

        tx.commit()?;

        Ok(u64::try_from(affected).unwrap_or(u64::MAX))
    }
}
