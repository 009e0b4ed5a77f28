use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::{
    service::url_preview::UrlPreview, utils::error::ErrorKind, Error, Result,
    Services,
};

#[derive(Debug, Deserialize)]
pub(crate) struct PreviewQuery {
    url: Option<String>,
}

/// # `GET /_matrix/media/v3/preview_url`
///
/// Returns Open Graph metadata about a URL.
pub(crate) async fn get_url_preview_route(
    State(services): State<Arc<Services>>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<UrlPreview>> {
    let Some(previewer) = &services.url_preview else {
        return Err(Error::BadRequest(
            ErrorKind::Unrecognized,
            "URL previews are disabled",
        ));
    };

    let url = query.url.ok_or(Error::BadRequest(
        ErrorKind::MissingParam,
        "Missing url parameter",
    ))?;

    previewer.preview(&url).await.map(Json)
}
