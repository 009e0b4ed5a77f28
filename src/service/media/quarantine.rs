use std::sync::Arc;

use ruma::UserId;
use tracing::info;

use super::{Data, MediaId, Origin, QuarantineRecord};
use crate::{
    utils::{self, error::ErrorKind},
    Error, Result,
};

/// Hides media from downloads without deleting anything
pub(crate) struct Quarantine {
    db: Arc<dyn Data>,
}

impl Quarantine {
    pub(crate) fn new(db: Arc<dyn Data>) -> Self {
        Self {
            db,
        }
    }

    fn record(by: &str, reason: &str) -> QuarantineRecord {
        QuarantineRecord {
            quarantined_at: utils::millis_since_unix_epoch(),
            quarantined_by: by.to_owned(),
            reason: reason.to_owned(),
        }
    }

    /// Quarantines one piece of media, returning how many media rows changed
    #[tracing::instrument(skip(self))]
    pub(crate) fn quarantine_media(
        &self,
        media_id: &str,
        origin: &str,
        by: &str,
        reason: &str,
        also_thumbnails: bool,
    ) -> Result<u64> {
        let invalid = |_| {
            Error::BadRequest(ErrorKind::InvalidParam, "Invalid media ID or origin")
        };
        let media_id = MediaId::parse(media_id).map_err(invalid)?;
        let origin = Origin::parse(origin).map_err(invalid)?;

        let affected = self.db.quarantine_media(
            &media_id,
            &origin,
            &Self::record(by, reason),
            also_thumbnails,
        )?;

        info!(affected, "quarantined media");
        Ok(affected)
    }

    /// Quarantines everything a user uploaded, returning how many media rows
    /// changed
    #[tracing::instrument(skip(self))]
    pub(crate) fn quarantine_media_by_user(
        &self,
        user_id: &str,
        by: &str,
        reason: &str,
        also_thumbnails: bool,
    ) -> Result<u64> {
        let user_id = <&UserId>::try_from(user_id).map_err(|_| {
            Error::BadRequest(ErrorKind::InvalidParam, "Invalid user ID")
        })?;

        let affected = self.db.quarantine_media_by_user(
            user_id,
            &Self::record(by, reason),
            also_thumbnails,
        )?;

        info!(affected, "quarantined media");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::Quarantine;
    use crate::{
        service::media::{testing, Data, ResizeMethod},
        utils::error::ErrorKind,
        Error,
    };

    #[tokio::test]
    async fn flags_media_and_thumbnails() {
        let harness = testing::Harness::new().await;
        let media = harness
            .insert("abc", "example.com", "text/plain", b"bad".to_vec())
            .await;
        let thumbnail =
            testing::thumbnail("abc", "example.com", 32, 32, ResizeMethod::Crop);
        harness
            .db
            .create_thumbnail_metadata(&thumbnail)
            .expect("insert should succeed");
        let quarantine = Quarantine::new(harness.db.clone());

        let affected = quarantine
            .quarantine_media("abc", "Example.COM", "@admin:example.com", "spam", true)
            .expect("quarantine should succeed");
        assert_eq!(affected, 1);

        let stored = harness
            .db
            .search_file_metadata(&media.media_id, &media.origin)
            .expect("query should succeed")
            .expect("row should remain");
        let record = stored.quarantine.expect("media should be flagged");
        assert_eq!(record.quarantined_by, "@admin:example.com");
        assert_eq!(record.reason, "spam");

        let bytes = harness.store.read(&media.hash).await.expect("bytes kept");
        assert_eq!(bytes, b"bad");

        let thumbnail = harness
            .db
            .search_thumbnail_metadata(
                &thumbnail.media_id,
                &thumbnail.origin,
                thumbnail.size,
            )
            .expect("query should succeed")
            .expect("row should remain");
        assert!(thumbnail.quarantine.is_some(), "thumbnail should be flagged");
    }

    #[tokio::test]
    async fn no_match_is_not_an_error() {
        let harness = testing::Harness::new().await;
        let quarantine = Quarantine::new(harness.db.clone());

        let affected = quarantine
            .quarantine_media("nope", "example.com", "@admin:example.com", "", true)
            .expect("no match is fine");
        assert_eq!(affected, 0);

        let affected = quarantine
            .quarantine_media_by_user(
                "@nobody:example.com",
                "@admin:example.com",
                "",
                false,
            )
            .expect("no match is fine");
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn malformed_input_is_rejected() {
        let harness = testing::Harness::new().await;
        let quarantine = Quarantine::new(harness.db.clone());

        let error = quarantine
            .quarantine_media("a/b", "example.com", "@admin:example.com", "", true)
            .expect_err("bad media ID should be rejected");
        assert!(
            matches!(error, Error::BadRequest(ErrorKind::InvalidParam, _)),
            "got {error:?}"
        );

        let error = quarantine
            .quarantine_media_by_user("alice", "@admin:example.com", "", true)
            .expect_err("bad user ID should be rejected");
        assert!(
            matches!(error, Error::BadRequest(ErrorKind::InvalidParam, _)),
            "got {error:?}"
        );
    }
}
