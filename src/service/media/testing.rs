//! Fixtures shared by the media tests

use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use http::StatusCode;
use image::{DynamicImage, ImageFormat, RgbImage};
use tokio::sync::watch;

use super::{
    ContentHash, MediaId, MediaMetadata, MediaStore, Origin, ResizeMethod,
    ThumbnailMetadata, ThumbnailSize,
};
use crate::{
    config::SizeLimit,
    database::Database,
    service::federation::{FederationClient, FetchError, RemoteMedia},
};

/// Hash of `b"hello world"`
pub(crate) const HELLO_HASH: &str =
    "uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek";

pub(crate) fn media(
    media_id: &str,
    origin: &str,
    user_id: Option<&str>,
) -> MediaMetadata {
    MediaMetadata {
        media_id: MediaId::parse(media_id).expect("valid media id"),
        origin: Origin::parse(origin).expect("valid origin"),
        content_type: "image/png".to_owned(),
        file_size: 11,
        upload_name: "hello.png".to_owned(),
        hash: ContentHash::parse(HELLO_HASH).expect("valid hash"),
        user_id: user_id
            .map(|user_id| user_id.try_into().expect("valid user id")),
        created_ts: 1_700_000_000_000,
        quarantine: None,
    }
}

pub(crate) fn thumbnail(
    media_id: &str,
    origin: &str,
    width: u32,
    height: u32,
    method: ResizeMethod,
) -> ThumbnailMetadata {
    ThumbnailMetadata {
        media_id: MediaId::parse(media_id).expect("valid media id"),
        origin: Origin::parse(origin).expect("valid origin"),
        size: ThumbnailSize::new(width, height, method)
            .expect("valid thumbnail size"),
        content_type: "image/png".to_owned(),
        file_size: 11,
        hash: ContentHash::parse(HELLO_HASH).expect("valid hash"),
        created_ts: 1_700_000_000_000,
        quarantine: None,
    }
}

fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            u8::try_from(x % 256).expect("fits in u8"),
            u8::try_from(y % 256).expect("fits in u8"),
            128,
        ])
    });

    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .expect("image should encode");
    bytes
}

pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Png)
}

pub(crate) fn jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(width, height, ImageFormat::Jpeg)
}

/// Database and content store living in a temporary directory
pub(crate) struct Harness {
    pub(crate) db: Arc<Database>,
    pub(crate) store: Arc<MediaStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let store = MediaStore::open(dir.path().join("media"))
            .await
            .expect("should open store");

        Self {
            db: Arc::new(
                Database::open_in_memory().expect("should open database"),
            ),
            store: Arc::new(store),
            _dir: dir,
        }
    }

    /// Stores `bytes` and records them as media
    pub(crate) async fn insert(
        &self,
        media_id: &str,
        origin: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> MediaMetadata {
        use super::Data as _;

        let (hash, file_size) =
            self.store.store_bytes(bytes).await.expect("should store bytes");
        let meta = MediaMetadata {
            content_type: content_type.to_owned(),
            file_size,
            hash,
            ..media(media_id, origin, None)
        };
        self.db.create_file_metadata(&meta).expect("should insert metadata");

        meta
    }
}

/// Scripted stand-in for a remote server
pub(crate) struct FakeFederation {
    response: Result<(Option<String>, Bytes), StatusCode>,
    calls: AtomicUsize,
    open: watch::Sender<bool>,
}

impl FakeFederation {
    pub(crate) fn serving(content_type: &str, bytes: Vec<u8>) -> Self {
        Self {
            response: Ok((Some(content_type.to_owned()), bytes.into())),
            calls: AtomicUsize::new(0),
            open: watch::channel(true).0,
        }
    }

    pub(crate) fn failing(status: StatusCode) -> Self {
        Self {
            response: Err(status),
            calls: AtomicUsize::new(0),
            open: watch::channel(true).0,
        }
    }

    /// Makes requests wait until [`FakeFederation::release`] is called
    pub(crate) fn gated(self) -> Self {
        self.open.send_replace(false);
        self
    }

    pub(crate) fn release(&self) {
        self.open.send_replace(true);
    }

    /// Number of fetches that have started
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FederationClient for FakeFederation {
    async fn fetch_media(
        &self,
        _origin: &Origin,
        _media_id: &MediaId,
        limit: SizeLimit,
    ) -> Result<RemoteMedia, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut open = self.open.subscribe();
        open.wait_for(|open| *open).await.expect("fake should outlive fetches");

        let (content_type, bytes) =
            self.response.clone().map_err(FetchError::Status)?;
        let size = u64::try_from(bytes.len()).expect("fits in u64");
        if let Some(max) = limit.bytes().filter(|max| size > *max) {
            return Err(FetchError::TooLarge(max));
        }

        Ok(RemoteMedia {
            content_type,
            filename: Some("remote.bin".to_owned()),
            body: stream::iter([Ok(bytes)]).boxed(),
        })
    }
}
