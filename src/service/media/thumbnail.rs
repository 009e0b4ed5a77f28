use std::{io::Cursor, sync::Arc};

use image::{imageops::FilterType, DynamicImage, ImageFormat};
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument};

use super::{
    Data, MediaMetadata, MediaStore, ResizeMethod, ThumbnailMetadata,
    ThumbnailSize,
};
use crate::{service::Coordinator, utils, Error, Result};

/// Generates and stores thumbnails, one generation per size at a time
pub(crate) struct Thumbnailer {
    db: Arc<dyn Data>,
    store: Arc<MediaStore>,
    coordinator: Arc<Coordinator<Option<ThumbnailMetadata>>>,
    /// Bounds how many images are decoded at the same time
    permits: Semaphore,
    #[cfg(test)]
    resizes: std::sync::atomic::AtomicUsize,
}

impl Thumbnailer {
    pub(crate) fn new(
        db: Arc<dyn Data>,
        store: Arc<MediaStore>,
        coordinator: Arc<Coordinator<Option<ThumbnailMetadata>>>,
        max_generators: usize,
    ) -> Self {
        Self {
            db,
            store,
            coordinator,
            permits: Semaphore::new(max_generators),
            #[cfg(test)]
            resizes: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Returns the thumbnail of `media` at exactly `size`, generating it if
    /// it doesn't exist yet
    ///
    /// Returns `None` if the content isn't an image or is smaller than the
    /// requested size.
    #[tracing::instrument(
        skip(self, media),
        fields(media_id = %media.media_id, origin = %media.origin),
    )]
    pub(crate) async fn generate(
        &self,
        media: &MediaMetadata,
        size: ThumbnailSize,
    ) -> Result<Option<ThumbnailMetadata>> {
        let key = format!("{}/{}/{size}", media.origin, media.media_id);

        self.coordinator.run(key, || self.generate_uncoalesced(media, size)).await
    }

    async fn generate_uncoalesced(
        &self,
        media: &MediaMetadata,
        size: ThumbnailSize,
    ) -> Result<Option<ThumbnailMetadata>> {
        // A previous leader may have finished between our lookup and now
        if let Some(existing) =
            self.db.search_thumbnail_metadata(&media.media_id, &media.origin, size)?
        {
            return Ok(Some(existing));
        }

        let _permit =
            self.permits.acquire().await.map_err(|_| Error::Canceled)?;

        let original = self.store.read(&media.hash).await?;
        #[cfg(test)]
        self.resizes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let Some((bytes, content_type)) =
            tokio::task::spawn_blocking(move || resize(&original, size))
                .await??
        else {
            debug!("content can't be thumbnailed at this size");
            return Ok(None);
        };

        let (hash, file_size) = self.store.store_bytes(bytes).await?;
        let thumbnail = ThumbnailMetadata {
            media_id: media.media_id.clone(),
            origin: media.origin.clone(),
            size,
            content_type: content_type.to_owned(),
            file_size,
            hash,
            created_ts: utils::millis_since_unix_epoch(),
            quarantine: None,
        };
        self.db.create_thumbnail_metadata(&thumbnail)?;

        debug!(%size, "generated thumbnail");
        Ok(Some(thumbnail))
    }

    /// Generates `sizes` in the background, logging failures
    pub(crate) fn pregenerate(
        self: &Arc<Self>,
        media: MediaMetadata,
        sizes: Vec<ThumbnailSize>,
    ) {
        let thumbnailer = Arc::clone(self);

        tokio::spawn(
            async move {
                for size in sizes {
                    if let Err(error) = thumbnailer.generate(&media, size).await
                    {
                        warn!(%error, %size, "failed to pregenerate thumbnail");
                    }
                }
            }
            .in_current_span(),
        );
    }
}

/// Largest dimensions that fit inside `width`x`height` while keeping the
/// aspect ratio of the original
fn scaled_dimensions(
    original_width: u32,
    original_height: u32,
    width: u32,
    height: u32,
) -> (u32, u32) {
    let (original_width, original_height) =
        (u64::from(original_width), u64::from(original_height));

    let use_width = u64::from(width) * original_height
        <= original_width * u64::from(height);
    let fit = |numerator: u64, denominator: u64| {
        u32::try_from(numerator / denominator).unwrap_or(u32::MAX).max(1)
    };

    if use_width {
        (width, fit(original_height * u64::from(width), original_width))
    } else {
        (fit(original_width * u64::from(height), original_height), height)
    }
}

/// Resizes an encoded image, returning the encoded result and its content
/// type
///
/// Returns `None` if `bytes` isn't a supported image or is smaller than
/// `size` in either dimension.
pub(crate) fn resize(
    bytes: &[u8],
    size: ThumbnailSize,
) -> Result<Option<(Vec<u8>, &'static str)>> {
    let Ok(image) = image::load_from_memory(bytes) else {
        return Ok(None);
    };

    if size.width > image.width() || size.height > image.height() {
        return Ok(None);
    }

    let thumbnail = match size.method {
        ResizeMethod::Crop => {
            image.resize_to_fill(size.width, size.height, FilterType::CatmullRom)
        }
        ResizeMethod::Scale => {
            let (width, height) = scaled_dimensions(
                image.width(),
                image.height(),
                size.width,
                size.height,
            );
            image.thumbnail_exact(width, height)
        }
    };

    let (thumbnail, format, content_type) =
        if image::guess_format(bytes).ok() == Some(ImageFormat::Jpeg) {
            (
                DynamicImage::ImageRgb8(thumbnail.to_rgb8()),
                ImageFormat::Jpeg,
                "image/jpeg",
            )
        } else {
            (thumbnail, ImageFormat::Png, "image/png")
        };

    let mut encoded = Vec::new();
    thumbnail.write_to(&mut Cursor::new(&mut encoded), format)?;

    Ok(Some((encoded, content_type)))
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::Ordering, Arc};

    use futures_util::future::join_all;
    use image::GenericImageView;

    use super::{resize, scaled_dimensions, Thumbnailer};
    use crate::service::{
        media::{testing, Data, ResizeMethod, ThumbnailSize},
        Coordinator,
    };

    fn size(width: u32, height: u32, method: ResizeMethod) -> ThumbnailSize {
        ThumbnailSize::new(width, height, method).expect("valid size")
    }

    fn dimensions(bytes: &[u8]) -> (u32, u32) {
        image::load_from_memory(bytes).expect("should decode").dimensions()
    }

    #[test]
    fn scaling_keeps_aspect_ratio() {
        assert_eq!(scaled_dimensions(100, 50, 40, 40), (40, 20));
        assert_eq!(scaled_dimensions(50, 100, 40, 40), (20, 40));
        assert_eq!(scaled_dimensions(640, 480, 320, 240), (320, 240));
        assert_eq!(scaled_dimensions(1000, 1, 10, 10), (10, 1));
    }

    #[test]
    fn crop_fills_the_box() {
        let (bytes, content_type) =
            resize(&testing::png(100, 50), size(32, 32, ResizeMethod::Crop))
                .expect("resize should succeed")
                .expect("image is large enough");

        assert_eq!(content_type, "image/png");
        assert_eq!(dimensions(&bytes), (32, 32));
    }

    #[test]
    fn scale_fits_inside_the_box() {
        let (bytes, _) =
            resize(&testing::png(100, 50), size(40, 40, ResizeMethod::Scale))
                .expect("resize should succeed")
                .expect("image is large enough");

        assert_eq!(dimensions(&bytes), (40, 20));
    }

    #[test]
    fn jpeg_stays_jpeg() {
        let (bytes, content_type) =
            resize(&testing::jpeg(64, 64), size(32, 32, ResizeMethod::Crop))
                .expect("resize should succeed")
                .expect("image is large enough");

        assert_eq!(content_type, "image/jpeg");
        assert_eq!(
            image::guess_format(&bytes).ok(),
            Some(image::ImageFormat::Jpeg)
        );
    }

    #[test]
    fn small_or_broken_images_are_skipped() {
        let too_small =
            resize(&testing::png(16, 16), size(32, 32, ResizeMethod::Crop))
                .expect("resize should not fail");
        assert!(too_small.is_none(), "upscaling should not happen");

        let not_an_image =
            resize(b"hello world", size(32, 32, ResizeMethod::Crop))
                .expect("resize should not fail");
        assert!(not_an_image.is_none(), "non-images should be skipped");
    }

    #[tokio::test]
    async fn concurrent_requests_store_one_thumbnail() {
        let harness = testing::Harness::new().await;
        let media = harness
            .insert("abc", "example.com", "image/png", testing::png(64, 64))
            .await;
        let coordinator = Arc::new(Coordinator::new("thumbnail"));
        let thumbnailer = Thumbnailer::new(
            harness.db.clone(),
            harness.store.clone(),
            Arc::clone(&coordinator),
            1,
        );
        let size = size(32, 32, ResizeMethod::Crop);
        let key = format!("{}/{}/{size}", media.origin, media.media_id);

        // The leader waits for this permit until every other caller joined
        let permit = thumbnailer
            .permits
            .acquire()
            .await
            .expect("semaphore should be open");
        let release = async {
            while coordinator.followers(&key) < 7 {
                tokio::task::yield_now().await;
            }
            drop(permit);
        };

        let (results, ()) = tokio::join!(
            join_all((0..8).map(|_| thumbnailer.generate(&media, size))),
            release,
        );

        assert_eq!(
            thumbnailer.resizes.load(Ordering::SeqCst),
            1,
            "concurrent callers should share one resize"
        );

        let first = results
            .first()
            .and_then(|r| r.as_ref().ok())
            .cloned()
            .flatten()
            .expect("thumbnail should be generated");
        for result in results {
            assert_eq!(
                result.expect("generation should succeed").as_ref(),
                Some(&first),
                "every caller should see the same thumbnail"
            );
        }

        let stored = harness
            .db
            .thumbnails_for(&media.media_id, &media.origin)
            .expect("query should succeed");
        assert_eq!(stored, vec![first.clone()]);

        let bytes =
            harness.store.read(&first.hash).await.expect("should be stored");
        assert_eq!(dimensions(&bytes), (32, 32));
    }

    #[tokio::test]
    async fn existing_thumbnails_are_reused() {
        let harness = testing::Harness::new().await;
        let media = harness
            .insert("abc", "example.com", "image/png", testing::png(64, 64))
            .await;
        let thumbnailer = Thumbnailer::new(
            harness.db.clone(),
            harness.store.clone(),
            Arc::new(Coordinator::new("thumbnail")),
            1,
        );
        let size = size(32, 32, ResizeMethod::Scale);

        let first = thumbnailer
            .generate(&media, size)
            .await
            .expect("generation should succeed");
        let second = thumbnailer
            .generate(&media, size)
            .await
            .expect("lookup should succeed");

        assert!(first.is_some(), "thumbnail should be generated");
        assert_eq!(first, second, "second call should find the stored row");
    }
}
