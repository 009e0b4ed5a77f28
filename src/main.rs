use std::{io, net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, MatchedPath},
    response::IntoResponse,
    routing::{any, get, post},
    Router,
};
use axum_server::{
    bind, bind_rustls, tls_rustls::RustlsConfig, Handle as ServerHandle,
};
use futures_util::{future::try_join_all, FutureExt as _};
use http::{
    header::{self, HeaderName},
    Method, Uri,
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
    ServiceBuilderExt as _,
};
use tracing::{debug, info, warn};

mod api;
mod clap;
mod config;
mod database;
mod error;
mod observability;
mod service;
mod utils;

use config::ListenConfig;
pub(crate) use config::Config;
use database::Database;
pub(crate) use service::Services;
#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
use tikv_jemallocator::Jemalloc;
use utils::error::ErrorKind;
pub(crate) use utils::error::{Error, Result};

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `GRAPEVINE_MEDIA_VERSION_EXTRA` to any UTF-8
/// string to include it in parenthesis after the SemVer version. A common
/// value are git commit hashes.
fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("GRAPEVINE_MEDIA_VERSION_EXTRA") {
        Some(x) => format!("{cargo_pkg_version} ({x})"),
        None => cargo_pkg_version.to_owned(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let Err(e) = try_main().await else {
        return ExitCode::SUCCESS;
    };

    eprintln!(
        "Error: {}",
        error::DisplayWithSources {
            error: &e,
            infix: "\n    Caused by: "
        }
    );

    ExitCode::FAILURE
}

/// Fallible entrypoint
async fn try_main() -> Result<(), error::Main> {
    use error::Main as Error;

    let args = clap::parse();
    let config = config::load(args.config).await?;

    observability::init(&config)?;

    // Every stored file and federation connection is a file descriptor. The
    // soft limit is usually 1024, and the hard limit is usually 512000.
    #[cfg(unix)]
    if let Err(error) = maximize_fd_limit() {
        warn!(%error, "Failed to raise the open file limit");
    }

    info!("Loading database");
    let db = Database::open(&config.database.path).map_err(Error::Database)?;

    info!("Initializing services");
    let services =
        Services::build(config, Arc::new(db)).await.map_err(Error::Services)?;

    info!("Starting server");
    run_server(Arc::new(services)).await.map_err(Error::Serve)?;

    Ok(())
}

async fn run_server(services: Arc<Services>) -> io::Result<()> {
    let config = &services.config;

    let x_requested_with = HeaderName::from_static("x-requested-with");

    let middlewares = ServiceBuilder::new()
        .sensitive_headers([header::AUTHORIZATION])
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &http::Request<_>| {
                let path = if let Some(path) =
                    request.extensions().get::<MatchedPath>()
                {
                    path.as_str()
                } else {
                    request.uri().path()
                };

                tracing::info_span!(
                    "http_request",
                    otel.name = path,
                    %path,
                    method = %request.method(),
                )
            },
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::ORIGIN,
                    x_requested_with,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::AUTHORIZATION,
                ])
                .max_age(Duration::from_secs(86400)),
        )
        .layer(axum::middleware::from_fn(observability::http_metrics_layer));

    let app = routes(Arc::clone(&services))
        .layer(middlewares)
        .into_make_service();
    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));

    let tls = match &config.tls {
        Some(tls) => {
            Some(RustlsConfig::from_pem_file(&tls.certs, &tls.key).await?)
        }
        None => None,
    };

    let mut servers = Vec::new();
    for listen in &config.listen {
        let ListenConfig::Tcp {
            address,
            port,
            tls: use_tls,
        } = listen;
        let addr = SocketAddr::from((*address, *port));

        info!(%listen, "Listening");
        let server = if *use_tls {
            let tls = tls.clone().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "TLS listener configured without certificates",
                )
            })?;
            bind_rustls(addr, tls)
                .handle(handle.clone())
                .serve(app.clone())
                .boxed()
        } else {
            bind(addr).handle(handle.clone()).serve(app.clone()).boxed()
        };
        servers.push(server);
    }

    #[cfg(feature = "systemd")]
    if let Err(error) =
        sd_notify::notify(true, &[sd_notify::NotifyState::Ready])
    {
        warn!(%error, "Failed to notify systemd");
    }

    try_join_all(servers).await?;

    Ok(())
}

fn routes(services: Arc<Services>) -> Router {
    use api::{admin, client_server as c2s, server_server as s2s};

    let federation_enabled = services.config.federation.enable;
    let admin_enabled = services.config.admin.token.is_some();
    let metrics_enabled = services.config.observability.metrics.enable;

    let mut router = Router::new();

    for version in ["r0", "v3"] {
        let prefix = format!("/_matrix/media/{version}");

        router = router
            .route(
                &format!("{prefix}/config"),
                get(c2s::get_media_config_route),
            )
            .route(
                &format!("{prefix}/upload"),
                post(c2s::create_content_route),
            )
            .route(
                &format!("{prefix}/download/:server_name/:media_id"),
                get(c2s::get_content_route),
            )
            .route(
                &format!("{prefix}/download/:server_name/:media_id/:file_name"),
                get(c2s::get_content_as_filename_route),
            )
            .route(
                &format!("{prefix}/thumbnail/:server_name/:media_id"),
                get(c2s::get_content_thumbnail_route),
            )
            .route(
                &format!("{prefix}/preview_url"),
                get(c2s::get_url_preview_route),
            );
    }

    let router = if federation_enabled {
        router
            .route(
                "/_matrix/federation/v1/media/download/:media_id",
                get(s2s::get_content_route),
            )
            .route(
                "/_matrix/federation/v1/media/thumbnail/:media_id",
                get(s2s::get_content_thumbnail_route),
            )
    } else {
        router.route("/_matrix/federation/*path", any(federation_disabled))
    };

    let router = if admin_enabled {
        router
            .route(
                "/_grapevine/admin/media/quarantine/:server_name/:media_id",
                post(admin::quarantine_media_route),
            )
            .route(
                "/_grapevine/admin/media/quarantine_user/:user_id",
                post(admin::quarantine_user_media_route),
            )
    } else {
        router
    };

    let router = if metrics_enabled {
        router.route(
            "/metrics",
            get(|| async { observability::METRICS.export() }),
        )
    } else {
        router
    };

    router
        .route("/", get(it_works))
        .fallback(not_found)
        // Upload size is enforced while the body is streamed to disk
        .layer(DefaultBodyLimit::disable())
        .with_state(services)
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        () = ctrl_c => { sig = "Ctrl+C"; },
        () = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
    handle.graceful_shutdown(Some(Duration::from_secs(30)));

    #[cfg(feature = "systemd")]
    if let Err(error) =
        sd_notify::notify(true, &[sd_notify::NotifyState::Stopping])
    {
        warn!(%error, "Failed to notify systemd");
    }
}

async fn federation_disabled(_: Uri) -> impl IntoResponse {
    Error::BadRequest(ErrorKind::Forbidden, "Federation is disabled.")
}

async fn not_found(method: Method, uri: Uri) -> impl IntoResponse {
    debug!(%method, %uri, "unknown route");
    Error::BadRequest(ErrorKind::Unrecognized, "Unrecognized request")
}

async fn it_works() -> &'static str {
    "Hello from grapevine-media!"
}

#[cfg(unix)]
#[tracing::instrument(err)]
fn maximize_fd_limit() -> Result<(), nix::errno::Errno> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let res = Resource::RLIMIT_NOFILE;

    let (soft_limit, hard_limit) = getrlimit(res)?;

    debug!("Current nofile soft limit: {soft_limit}");

    setrlimit(res, hard_limit, hard_limit)?;

    debug!("Increased nofile soft limit to {hard_limit}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{self, Body},
        Router,
    };
    use http::{header, HeaderMap, Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt as _;

    use crate::{database::Database, Config, Services};

    const MULTIPART_BODY: &str = "--XYZ\r\n\
        Content-Disposition: form-data; name=\"comment\"\r\n\r\n\
        ignored\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"cat.png\"\r\n\
        Content-Type: image/png\r\n\r\n\
        not really a png\r\n\
        --XYZ--\r\n";

    struct TestServer {
        router: Router,
        _dir: TempDir,
    }

    struct TestResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    impl TestResponse {
        fn json(&self) -> Value {
            serde_json::from_slice(&self.body).expect("body should be JSON")
        }

        fn header(&self, name: header::HeaderName) -> Option<&str> {
            self.headers.get(name).and_then(|v| v.to_str().ok())
        }
    }

    /// Builds the router around fresh storage, with extra config tables
    /// appended to a minimal config
    async fn server(extra: &str) -> TestServer {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let config: Config = toml::from_str(&format!(
            r#"
            server_name = "example.com"

            [database]
            path = "unused.db"

            [media]
            base_path = '{}'
            max_file_size = 64
            thumbnail_sizes = []

            {extra}
            "#,
            dir.path().display()
        ))
        .expect("test config should parse");

        let db =
            Arc::new(Database::open_in_memory().expect("should open database"));
        let services = Services::build(config, db)
            .await
            .expect("services should build");

        TestServer {
            router: super::routes(Arc::new(services)),
            _dir: dir,
        }
    }

    impl TestServer {
        async fn send(&self, request: Request<Body>) -> TestResponse {
            let response = self
                .router
                .clone()
                .oneshot(request)
                .await
                .expect("router should not fail");

            TestResponse {
                status: response.status(),
                headers: response.headers().clone(),
                body: body::to_bytes(response.into_body(), usize::MAX)
                    .await
                    .expect("body should be readable")
                    .to_vec(),
            }
        }

        async fn get(&self, uri: &str) -> TestResponse {
            self.send(
                Request::get(uri).body(Body::empty()).expect("valid request"),
            )
            .await
        }

        /// Uploads `body` and returns the new media ID
        async fn upload(&self, query: &str, body: &'static str) -> String {
            let response = self
                .send(
                    Request::post(format!("/_matrix/media/v3/upload?{query}"))
                        .header(header::CONTENT_TYPE, "text/plain")
                        .body(Body::from(body))
                        .expect("valid request"),
                )
                .await;
            assert_eq!(response.status, StatusCode::OK);

            response.json()["content_uri"]
                .as_str()
                .and_then(|uri| uri.strip_prefix("mxc://example.com/"))
                .expect("upload should return a local content URI")
                .to_owned()
        }
    }

    #[tokio::test]
    async fn upload_then_download() {
        let server = server("").await;
        let media_id = server
            .upload("filename=hello.txt&user_id=@alice:example.com", "hello")
            .await;

        let response = server
            .get(&format!("/_matrix/media/v3/download/example.com/{media_id}"))
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"hello");
        assert_eq!(response.header(header::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(
            response.header(header::CONTENT_DISPOSITION),
            Some("inline; filename=hello.txt")
        );
        assert_eq!(
            response.header(crate::api::CROSS_ORIGIN_RESOURCE_POLICY),
            Some("cross-origin")
        );

        // Origins are case-insensitive and r0 is an alias of v3
        let response = server
            .get(&format!(
                "/_matrix/media/r0/download/EXAMPLE.com/{media_id}/other.txt"
            ))
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.header(header::CONTENT_DISPOSITION),
            Some("inline; filename=other.txt")
        );
    }

    #[tokio::test]
    async fn multipart_uploads_read_the_file_field() {
        let server = server("").await;
        let response = server
            .send(
                Request::post("/_matrix/media/v3/upload")
                    .header(
                        header::CONTENT_TYPE,
                        "multipart/form-data; boundary=XYZ",
                    )
                    .body(Body::from(MULTIPART_BODY))
                    .expect("valid request"),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);

        let content_uri = response.json()["content_uri"]
            .as_str()
            .expect("content URI should be a string")
            .to_owned();
        let media_id = content_uri
            .strip_prefix("mxc://example.com/")
            .expect("content URI should be local");

        let response = server
            .get(&format!("/_matrix/media/v3/download/example.com/{media_id}"))
            .await;
        assert_eq!(response.body, b"not really a png");
        assert_eq!(response.header(header::CONTENT_TYPE), Some("image/png"));
        assert_eq!(
            response.header(header::CONTENT_DISPOSITION),
            Some("inline; filename=cat.png")
        );
    }

    #[tokio::test]
    async fn upload_size_limit() {
        let server = server("").await;
        let upload = |size: usize| {
            Request::post("/_matrix/media/v3/upload")
                .body(Body::from(vec![b'x'; size]))
                .expect("valid request")
        };

        assert_eq!(server.send(upload(64)).await.status, StatusCode::OK);

        let response = server.send(upload(65)).await;
        assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.json()["errcode"], "M_TOO_LARGE");
        assert!(
            response.json()["error"]
                .as_str()
                .is_some_and(|message| message.contains("64")),
            "error should name the limit"
        );

        let response = server
            .send(
                Request::post("/_matrix/media/v3/upload")
                    .header(header::CONTENT_LENGTH, "1000")
                    .body(Body::from("tiny"))
                    .expect("valid request"),
            )
            .await;
        assert_eq!(
            response.status,
            StatusCode::PAYLOAD_TOO_LARGE,
            "declared length should be checked before reading"
        );
    }

    #[tokio::test]
    async fn bad_requests() {
        let server = server("").await;

        for uri in [
            "/_matrix/media/v3/download/example.com/missing",
            "/_matrix/media/v3/download/example.com/bad!id",
        ] {
            let response = server.get(uri).await;
            assert_eq!(response.status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(response.json()["errcode"], "M_NOT_FOUND", "{uri}");
        }

        let response = server
            .get("/_matrix/media/v3/thumbnail/example.com/abc?width=x&height=1")
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.json()["errcode"], "M_INVALID_PARAM");

        let response = server
            .send(
                Request::post("/_matrix/media/v3/upload?filename=~secret")
                    .body(Body::from("x"))
                    .expect("valid request"),
            )
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);

        let response = server.get("/_matrix/client/v3/sync").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.json()["errcode"], "M_UNRECOGNIZED");
    }

    #[tokio::test]
    async fn media_config_reports_the_limit() {
        let server = server("").await;
        let response = server.get("/_matrix/media/v3/config").await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json(), json!({ "m.upload.size": 64 }));
    }

    #[tokio::test]
    async fn url_previews_can_be_disabled() {
        let server = server("").await;
        let response = server
            .get("/_matrix/media/v3/preview_url?url=https://example.org/")
            .await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.json()["errcode"], "M_UNRECOGNIZED");
    }

    #[tokio::test]
    async fn federation_download_is_multipart() {
        let server = server("").await;
        let media_id = server.upload("filename=hello.txt", "hello").await;

        let response = server
            .get(&format!("/_matrix/federation/v1/media/download/{media_id}"))
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(
            response
                .header(header::CONTENT_TYPE)
                .is_some_and(|v| v.starts_with("multipart/mixed; boundary=")),
            "federation responses should be multipart/mixed"
        );
        assert!(
            String::from_utf8_lossy(&response.body).contains("\r\n\r\nhello\r\n"),
            "content part should hold the bytes"
        );
    }

    #[tokio::test]
    async fn federation_can_be_disabled() {
        let server = server("[federation]\nenable = false").await;
        let response =
            server.get("/_matrix/federation/v1/media/download/abc").await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.json()["errcode"], "M_FORBIDDEN");
    }

    #[tokio::test]
    async fn admin_quarantine() {
        let server = server("[admin]\ntoken = \"secret\"").await;
        let alice = server
            .upload("filename=a.txt&user_id=@alice:example.com", "alice")
            .await;
        let bob = server
            .upload("filename=b.txt&user_id=@bob:example.com", "bob")
            .await;

        let quarantine = |uri: &str, token: Option<&str>| {
            let mut request = Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(token) = token {
                request =
                    request.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            request
                .body(Body::from(r#"{"reason": "spam", "thumbnails": true}"#))
                .expect("valid request")
        };

        let uri = format!("/_grapevine/admin/media/quarantine/example.com/{alice}");
        let response = server.send(quarantine(&uri, None)).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        for wrong in ["wrong", "secre", "secret2"] {
            let response = server.send(quarantine(&uri, Some(wrong))).await;
            assert_eq!(response.status, StatusCode::FORBIDDEN);
        }

        let response = server.send(quarantine(&uri, Some("secret"))).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json(), json!({ "affected": 1 }));

        let response = server
            .send(quarantine(
                "/_grapevine/admin/media/quarantine_user/@bob:example.com",
                Some("secret"),
            ))
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json(), json!({ "affected": 1 }));

        for media_id in [alice, bob] {
            let response = server
                .get(&format!(
                    "/_matrix/media/v3/download/example.com/{media_id}"
                ))
                .await;
            assert_eq!(
                response.status,
                StatusCode::NOT_FOUND,
                "quarantined media should not be served"
            );
        }
    }

    #[tokio::test]
    async fn admin_routes_need_a_token() {
        let server = server("").await;
        let response = server
            .send(
                Request::post(
                    "/_grapevine/admin/media/quarantine/example.com/abc",
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .expect("valid request"),
            )
            .await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
