use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    response::Response,
};
use http::{header::CONTENT_TYPE, HeaderValue};

use crate::{
    api::{
        content_disposition_header, content_type_header, set_header_or_panic,
        set_security_headers, ThumbnailQuery,
    },
    service::media::{Download, DownloadRequest},
    utils, Result, Services,
};

/// Length of the random multipart boundary
const BOUNDARY_LENGTH: usize = 32;

/// Encodes `download` as the two-part `multipart/mixed` body federation
/// expects: a JSON metadata part followed by the content itself
fn multipart_response(download: Download) -> Response {
    let boundary = utils::random_string(BOUNDARY_LENGTH);
    let content_type = content_type_header(&download.content_type);
    let content_disposition = content_disposition_header(
        &download.content_type,
        &download.upload_name,
    );

    let mut body = Vec::with_capacity(download.bytes.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json\r\n\r\n{}\r\n");
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: ");
    body.extend_from_slice(content_type.as_bytes());
    body.extend_from_slice(b"\r\nContent-Disposition: ");
    body.extend_from_slice(content_disposition.as_bytes());
    body.extend_from_slice(b"\r\n\r\n");
    body.extend_from_slice(&download.bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let mut response = Response::new(Body::from(body));
    set_header_or_panic(
        &mut response,
        CONTENT_TYPE,
        HeaderValue::from_str(&format!("multipart/mixed; boundary={boundary}"))
            .expect("boundary should be alphanumeric"),
    );
    set_security_headers(&mut response);

    response
}

fn local_request(services: &Services, media_id: String) -> DownloadRequest {
    DownloadRequest {
        media_id,
        origin: services.local_origin.to_string(),
        allow_remote: false,
        federation: true,
        thumbnail: None,
    }
}

/// # `GET /_matrix/federation/v1/media/download/{mediaId}`
///
/// Serves local media to other servers.
pub(crate) async fn get_content_route(
    State(services): State<Arc<Services>>,
    Path(media_id): Path<String>,
) -> Result<Response> {
    let request = local_request(&services, media_id);
    let download = services.downloader.download(&request).await?;

    Ok(multipart_response(download))
}

/// # `GET /_matrix/federation/v1/media/thumbnail/{mediaId}`
///
/// Serves a thumbnail of local media to other servers.
pub(crate) async fn get_content_thumbnail_route(
    State(services): State<Arc<Services>>,
    Path(media_id): Path<String>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response> {
    let mut request = local_request(&services, media_id);
    request.thumbnail = Some(query.to_request()?);
    let download = services.downloader.download(&request).await?;

    Ok(multipart_response(download))
}
