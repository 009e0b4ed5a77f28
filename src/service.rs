use std::sync::Arc;

use tracing::info;

use crate::{database::Database, Config, Result};

pub(crate) mod coordinator;
pub(crate) mod federation;
pub(crate) mod media;
pub(crate) mod url_preview;

pub(crate) use coordinator::Coordinator;
use federation::HttpFederationClient;
use media::{
    DownloadSettings, Downloader, MediaStore, Origin, Quarantine, Thumbnailer,
    Uploader,
};
use url_preview::UrlPreviewer;

/// Everything request handlers need, built once at startup
pub(crate) struct Services {
    pub(crate) config: Config,
    pub(crate) local_origin: Origin,
    pub(crate) downloader: Downloader,
    pub(crate) uploader: Uploader,
    pub(crate) quarantine: Quarantine,
    /// `None` when URL previews are disabled
    pub(crate) url_preview: Option<UrlPreviewer>,
}

impl Services {
    #[tracing::instrument(skip_all)]
    pub(crate) async fn build(
        config: Config,
        db: Arc<Database>,
    ) -> Result<Self> {
        let local_origin = Origin::from(&*config.server_name);
        let store =
            Arc::new(MediaStore::open(config.media.base_path.clone()).await?);

        let thumbnailer = Arc::new(Thumbnailer::new(
            db.clone(),
            Arc::clone(&store),
            Arc::new(Coordinator::new("thumbnails")),
            config.media.max_thumbnail_generators,
        ));

        let downloader = Downloader::new(
            db.clone(),
            Arc::clone(&store),
            Arc::clone(&thumbnailer),
            Arc::new(HttpFederationClient::new(config.federation.timeout())?),
            Arc::new(Coordinator::new("remote_media")),
            DownloadSettings {
                local_origin: local_origin.clone(),
                max_file_size: config.media.max_file_size,
                dynamic_thumbnails: config.media.dynamic_thumbnails,
            },
        );

        let uploader = Uploader::new(
            db.clone(),
            Arc::clone(&store),
            thumbnailer,
            local_origin.clone(),
            config.media.max_file_size,
            config.media.thumbnail_sizes.clone(),
        );

        let url_preview = if config.url_preview.enable {
            Some(UrlPreviewer::new(
                db.clone(),
                db.clone(),
                store,
                Arc::new(Coordinator::new("url_previews")),
                local_origin.clone(),
                &config.url_preview,
            )?)
        } else {
            info!("URL previews are disabled");
            None
        };

        Ok(Self {
            local_origin,
            downloader,
            uploader,
            quarantine: Quarantine::new(db),
            url_preview,
            config,
        })
    }
}
