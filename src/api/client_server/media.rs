use std::sync::Arc;

use axum::{
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    response::Response,
    Json,
};
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    HeaderMap, HeaderName,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    api::{media_response, true_fn, ThumbnailQuery},
    service::media::{DownloadRequest, UploadRequest},
    utils::{self, error::ErrorKind},
    Error, Result, Services,
};

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    #[serde(default = "true_fn")]
    allow_remote: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UploadQuery {
    filename: Option<String>,
    /// Matrix user ID to record as the uploader
    user_id: Option<String>,
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

fn download_request(
    services: &Services,
    origin: String,
    media_id: String,
    allow_remote: bool,
) -> DownloadRequest {
    DownloadRequest {
        media_id,
        origin,
        allow_remote: allow_remote && services.config.federation.enable,
        federation: false,
        thumbnail: None,
    }
}

/// # `GET /_matrix/media/v3/config`
///
/// Returns the maximum upload size, if there is one.
pub(crate) async fn get_media_config_route(
    State(services): State<Arc<Services>>,
) -> Json<Value> {
    Json(match services.uploader.max_file_size().bytes() {
        Some(max) => json!({ "m.upload.size": max }),
        None => json!({}),
    })
}

/// # `POST /_matrix/media/v3/upload`
///
/// Permanently save media in the server.
///
/// The body is either the raw content or a `multipart/form-data` form whose
/// `file` field holds the content.
pub(crate) async fn create_content_route(
    State(services): State<Arc<Services>>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Result<Json<Value>> {
    let content_type = header_string(request.headers(), CONTENT_TYPE);
    let is_multipart = content_type.as_deref().is_some_and(|content_type| {
        content_type.to_ascii_lowercase().starts_with("multipart/form-data")
    });

    let mut upload = UploadRequest {
        content_type,
        upload_name: query.filename,
        user_id: query.user_id,
        declared_length: None,
    };

    let content_uri = if is_multipart {
        let mut multipart =
            Multipart::from_request(request, &()).await.map_err(|_| {
                Error::BadRequest(
                    ErrorKind::InvalidParam,
                    "Malformed multipart body",
                )
            })?;

        loop {
            let field = multipart.next_field().await.map_err(|_| {
                Error::BadRequest(
                    ErrorKind::InvalidParam,
                    "Malformed multipart body",
                )
            })?;
            let Some(field) = field else {
                return Err(Error::BadRequest(
                    ErrorKind::MissingParam,
                    "Multipart body has no file field",
                ));
            };
            if field.name() != Some("file") {
                continue;
            }

            upload.content_type = field.content_type().map(ToOwned::to_owned);
            if upload.upload_name.is_none() {
                upload.upload_name = field.file_name().map(ToOwned::to_owned);
            }

            break services.uploader.upload(upload, Box::pin(field)).await?;
        }
    } else {
        let content_length = header_string(request.headers(), CONTENT_LENGTH);
        upload.declared_length = utils::parse_content_length(
            content_length.as_deref(),
            services.uploader.max_file_size(),
        )?;

        services
            .uploader
            .upload(upload, request.into_body().into_data_stream())
            .await?
    };

    Ok(Json(json!({ "content_uri": content_uri })))
}

/// # `GET /_matrix/media/v3/download/{serverName}/{mediaId}`
///
/// Load media from our server or over federation.
///
/// - Only allows federation if `allow_remote` is true
pub(crate) async fn get_content_route(
    State(services): State<Arc<Services>>,
    Path((origin, media_id)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let request =
        download_request(&services, origin, media_id, query.allow_remote);
    let download = services.downloader.download(&request).await?;

    Ok(media_response(download, None))
}

/// # `GET /_matrix/media/v3/download/{serverName}/{mediaId}/{fileName}`
///
/// Load media from our server or over federation, permitting desired filename.
///
/// - Only allows federation if `allow_remote` is true
pub(crate) async fn get_content_as_filename_route(
    State(services): State<Arc<Services>>,
    Path((origin, media_id, filename)): Path<(String, String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let request =
        download_request(&services, origin, media_id, query.allow_remote);
    let download = services.downloader.download(&request).await?;

    Ok(media_response(download, Some(&filename)))
}

/// # `GET /_matrix/media/v3/thumbnail/{serverName}/{mediaId}`
///
/// Load media thumbnail from our server or over federation.
///
/// - Only allows federation if `allow_remote` is true
/// - Serves the original if no thumbnail can be made
pub(crate) async fn get_content_thumbnail_route(
    State(services): State<Arc<Services>>,
    Path((origin, media_id)): Path<(String, String)>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response> {
    let mut request =
        download_request(&services, origin, media_id, query.allow_remote);
    request.thumbnail = Some(query.to_request()?);
    let download = services.downloader.download(&request).await?;

    Ok(media_response(download, None))
}
