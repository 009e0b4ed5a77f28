mod media;

pub(crate) use media::{get_content_route, get_content_thumbnail_route};
