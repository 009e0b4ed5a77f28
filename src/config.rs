use std::{
    borrow::Cow,
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use once_cell::sync::Lazy;
use ruma::OwnedServerName;
use serde::{de, Deserialize, Deserializer};

use crate::{error, service::media::ThumbnailSize, Error, Result};

mod ip_network;

pub(crate) use ip_network::IpNetwork;

/// The default configuration file path
pub(crate) static DEFAULT_PATH: Lazy<PathBuf> =
    Lazy::new(|| [env!("CARGO_PKG_NAME"), "config.toml"].iter().collect());

#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_listen")]
    pub(crate) listen: Vec<ListenConfig>,
    pub(crate) tls: Option<TlsConfig>,

    pub(crate) server_name: OwnedServerName,
    pub(crate) database: DatabaseConfig,
    pub(crate) media: MediaConfig,
    #[serde(default)]
    pub(crate) federation: FederationConfig,
    #[serde(default)]
    pub(crate) url_preview: UrlPreviewConfig,
    #[serde(default)]
    pub(crate) admin: AdminConfig,
    #[serde(default)]
    pub(crate) observability: ObservabilityConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TlsConfig {
    pub(crate) certs: String,
    pub(crate) key: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ListenConfig {
    Tcp {
        #[serde(default = "default_address")]
        address: IpAddr,
        #[serde(default = "default_port")]
        port: u16,
        #[serde(default = "false_fn")]
        tls: bool,
    },
}

impl Display for ListenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenConfig::Tcp {
                address,
                port,
                tls: false,
            } => write!(f, "http://{address}:{port}"),
            ListenConfig::Tcp {
                address,
                port,
                tls: true,
            } => write!(f, "https://{address}:{port}"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DatabaseConfig {
    /// Path of the SQLite file holding media metadata
    pub(crate) path: PathBuf,
}

/// Upper bound on a number of bytes
///
/// Written in the config file as an integer or the string `"unlimited"`. Zero
/// is a real limit that rejects every non-empty body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SizeLimit {
    Bytes(u64),
    Unlimited,
}

impl SizeLimit {
    /// Fails with [`Error::TooLarge`] if `size` exceeds the limit
    pub(crate) fn check(self, size: u64) -> Result<()> {
        match self {
            SizeLimit::Bytes(max) if size > max => Err(Error::TooLarge(max)),
            SizeLimit::Bytes(_) | SizeLimit::Unlimited => Ok(()),
        }
    }

    /// The limit as a number, if there is one
    pub(crate) fn bytes(self) -> Option<u64> {
        match self {
            SizeLimit::Bytes(max) => Some(max),
            SizeLimit::Unlimited => None,
        }
    }
}

impl<'de> Deserialize<'de> for SizeLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = SizeLimit;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative number of bytes or \"unlimited\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(SizeLimit::Bytes(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u64::try_from(v).map(SizeLimit::Bytes).map_err(|_| {
                    E::invalid_value(de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v == "unlimited" {
                    Ok(SizeLimit::Unlimited)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MediaConfig {
    /// Directory holding the content store
    pub(crate) base_path: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub(crate) max_file_size: SizeLimit,
    /// Generate thumbnails on first request instead of serving the original
    #[serde(default = "true_fn")]
    pub(crate) dynamic_thumbnails: bool,
    #[serde(default = "default_max_thumbnail_generators")]
    pub(crate) max_thumbnail_generators: usize,
    /// Thumbnails generated right after an image is uploaded
    #[serde(default = "default_thumbnail_sizes")]
    pub(crate) thumbnail_sizes: Vec<ThumbnailSize>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct FederationConfig {
    pub(crate) enable: bool,
    /// Timeout for fetching remote media, in seconds
    pub(crate) timeout: u64,
}

impl FederationConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enable: true,
            timeout: 20,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct UrlPreviewConfig {
    pub(crate) enable: bool,
    /// Regular expressions matched against the requested URL
    #[serde(deserialize_with = "deserialize_regexes")]
    pub(crate) denylist: Vec<regex::Regex>,
    /// Networks that may be contacted even if `deny_networks` matches
    pub(crate) allow_networks: Vec<IpNetwork>,
    pub(crate) deny_networks: Vec<IpNetwork>,
    /// Request timeout in seconds
    pub(crate) timeout: u64,
    /// How long a generated preview is served from cache, in seconds
    pub(crate) cache_lifetime: u64,
    /// Number of previews kept in memory
    pub(crate) cache_capacity: usize,
    /// Maximum number of bytes read from a page or image
    pub(crate) max_page_size: SizeLimit,
    /// Preview images larger than this are resized before being stored
    pub(crate) thumbnail_size: Option<ThumbnailSize>,
}

impl UrlPreviewConfig {
    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub(crate) fn cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.cache_lifetime)
    }
}

impl Default for UrlPreviewConfig {
    fn default() -> Self {
        Self {
            enable: false,
            denylist: Vec::new(),
            allow_networks: Vec::new(),
            deny_networks: IpNetwork::private_ranges(),
            timeout: 10,
            cache_lifetime: 60 * 60 * 24,
            cache_capacity: 1000,
            max_page_size: SizeLimit::Bytes(1024 * 1024),
            thumbnail_size: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AdminConfig {
    /// Bearer token for the admin routes, which are disabled when unset
    pub(crate) token: Option<String>,
}

#[derive(Copy, Clone, Default, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LogFormat {
    /// Use the [`tracing_subscriber::fmt::format::Pretty`] formatter
    Pretty,
    /// Use the [`tracing_subscriber::fmt::format::Full`] formatter
    #[default]
    Full,
    /// Use the [`tracing_subscriber::fmt::format::Compact`] formatter
    Compact,
    /// Use the [`tracing_subscriber::fmt::format::Json`] formatter
    Json,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct MetricsConfig {
    pub(crate) enable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct LogConfig {
    /// `EnvFilter` directives, checked when the config is loaded
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub(crate) filter: String,
    pub(crate) colors: bool,
    pub(crate) format: LogFormat,
    pub(crate) timestamp: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_tracing_filter(),
            colors: true,
            format: LogFormat::default(),
            timestamp: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ObservabilityConfig {
    /// Prometheus metrics
    pub(crate) metrics: MetricsConfig,
    /// Logging to stdout
    pub(crate) logs: LogConfig,
}

fn false_fn() -> bool {
    false
}

fn true_fn() -> bool {
    true
}

fn default_listen() -> Vec<ListenConfig> {
    vec![ListenConfig::Tcp {
        address: default_address(),
        port: default_port(),
        tls: false,
    }]
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    6167
}

fn default_max_file_size() -> SizeLimit {
    // Default to 20 MB
    SizeLimit::Bytes(20 * 1024 * 1024)
}

fn default_max_thumbnail_generators() -> usize {
    4
}

fn default_thumbnail_sizes() -> Vec<ThumbnailSize> {
    use crate::service::media::ResizeMethod::{Crop, Scale};

    [(32, 32, Crop), (96, 96, Crop), (320, 240, Scale), (640, 480, Scale)]
        .into_iter()
        .map(|(width, height, method)| ThumbnailSize {
            width,
            height,
            method,
        })
        .collect()
}

fn default_tracing_filter() -> String {
    "info".to_owned()
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let directives = String::deserialize(deserializer)?;
    tracing_subscriber::EnvFilter::try_new(&directives)
        .map_err(de::Error::custom)?;
    Ok(directives)
}

fn deserialize_regexes<'de, D>(
    deserializer: D,
) -> Result<Vec<regex::Regex>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|pattern| regex::Regex::new(pattern))
        .collect::<Result<_, _>>()
        .map_err(de::Error::custom)
}

/// Search default locations for a configuration file
///
/// If one isn't found, the list of tried paths is returned.
fn search() -> Result<PathBuf, error::ConfigSearch> {
    use error::ConfigSearch as Error;

    xdg::BaseDirectories::new()?
        .find_config_file(&*DEFAULT_PATH)
        .ok_or(Error::NotFound)
}

/// Load the configuration from the given path or XDG Base Directories
pub(crate) async fn load<P>(path: Option<P>) -> Result<Config, error::Config>
where
    P: AsRef<Path>,
{
    use error::Config as Error;

    let path = match path.as_ref().map(AsRef::as_ref) {
        Some(x) => Cow::Borrowed(x),
        None => Cow::Owned(search()?),
    };

    let path = path.as_ref();

    let config: Config = toml::from_str(
        &tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Read(e, path.to_owned()))?,
    )
    .map_err(|e| Error::Parse(e, path.to_owned()))?;

    config.validate()?;

    Ok(config)
}

impl Config {
    /// Checks constraints that can't be expressed through deserialization
    fn validate(&self) -> Result<(), error::Config> {
        use error::Config as Error;

        if self.media.max_thumbnail_generators == 0 {
            return Err(Error::Invalid(
                "media.max_thumbnail_generators must be at least 1",
            ));
        }

        if self
            .media
            .thumbnail_sizes
            .iter()
            .chain(&self.url_preview.thumbnail_size)
            .any(|size| size.width == 0 || size.height == 0)
        {
            return Err(Error::Invalid(
                "thumbnail sizes must have a positive width and height",
            ));
        }

        let wants_tls = self.listen.iter().any(|listen| match listen {
            ListenConfig::Tcp {
                tls,
                ..
            } => *tls,
        });
        if wants_tls && self.tls.is_none() {
            return Err(Error::Invalid(
                "listeners with tls = true need a [tls] section",
            ));
        }

        if self.admin.token.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Invalid("admin.token must not be empty"));
        }

        Ok(())
    }
}
