mod media;
mod url_preview;

pub(crate) use media::{
    create_content_route, get_content_as_filename_route, get_content_route,
    get_content_thumbnail_route, get_media_config_route,
};
pub(crate) use url_preview::get_url_preview_route;
