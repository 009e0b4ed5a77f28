//! The media repository: content storage, metadata and the pipelines built on
//! top of them

use std::fmt;

use ring::digest;
use ruma::{OwnedMxcUri, OwnedUserId, ServerName};
use serde::Deserialize;
use strum::{AsRefStr, EnumString};

use crate::{utils::error::ErrorKind, Error, Result};

mod data;
mod disposition;
mod download;
mod quarantine;
mod store;
#[cfg(test)]
pub(crate) mod testing;
mod thumbnail;
mod upload;

pub(crate) use data::Data;
pub(crate) use disposition::{content_disposition_for, filename_from_header};
pub(crate) use download::{
    Download, DownloadRequest, DownloadSettings, Downloader, ThumbnailRequest,
};
pub(crate) use quarantine::Quarantine;
pub(crate) use store::MediaStore;
pub(crate) use thumbnail::{resize, Thumbnailer};
pub(crate) use upload::{unused_media_id, UploadRequest, Uploader};

/// Content type used when neither the client nor the remote server told us
pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Opaque media identifier, unique within an [`Origin`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct MediaId(String);

impl MediaId {
    /// Accepts non-empty strings made of `[A-Za-z0-9_=-]`
    pub(crate) fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.bytes().all(|b| {
                b.is_ascii_alphanumeric() || matches!(b, b'_' | b'=' | b'-')
            });

        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(Error::InvalidIdentifier)
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical, lower-cased name of the server owning a piece of media
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Origin(String);

impl Origin {
    pub(crate) fn parse(s: &str) -> Result<Self> {
        let server_name = <&ServerName>::try_from(s)
            .map_err(|_| Error::InvalidIdentifier)?;
        Ok(Self::from(server_name))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&ServerName> for Origin {
    fn from(server_name: &ServerName) -> Self {
        Self(server_name.as_str().to_ascii_lowercase())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of some content, as unpadded URL-safe base64
///
/// This is the only key under which bytes are stored on disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ContentHash {
    encoded: String,
    digest: [u8; digest::SHA256_OUTPUT_LEN],
}

impl ContentHash {
    /// Length of an encoded SHA-256 digest
    const ENCODED_LEN: usize = 43;

    pub(crate) fn parse(s: &str) -> Option<Self> {
        use base64::{engine::general_purpose, Engine as _};

        if s.len() != Self::ENCODED_LEN {
            return None;
        }
        let digest = general_purpose::URL_SAFE_NO_PAD
            .decode(s)
            .ok()?
            .try_into()
            .ok()?;

        Some(Self {
            encoded: s.to_owned(),
            digest,
        })
    }

    pub(crate) fn from_digest(digest: &digest::Digest) -> Self {
        use base64::{engine::general_purpose, Engine as _};

        Self {
            encoded: general_purpose::URL_SAFE_NO_PAD.encode(digest.as_ref()),
            digest: digest
                .as_ref()
                .try_into()
                .expect("SHA-256 digests should be 32 bytes"),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Splits the hash into a short directory prefix and the remainder
    ///
    /// Both are lower-case hex so that distinct hashes stay distinct on
    /// case-insensitive filesystems.
    pub(crate) fn shard(&self) -> (String, String) {
        let mut hex = hex::encode(self.digest);
        let remainder = hex.split_off(2);
        (hex, remainder)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, AsRefStr, EnumString,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub(crate) enum ResizeMethod {
    /// Fit inside the requested box, preserving the aspect ratio
    #[default]
    Scale,
    /// Fill the requested box exactly, cropping whatever sticks out
    Crop,
}

impl ResizeMethod {
    /// Parses a client-supplied method, defaulting to [`ResizeMethod::Scale`]
    pub(crate) fn parse(s: Option<&str>) -> Result<Self> {
        match s {
            None | Some("") => Ok(Self::Scale),
            Some(s) => s.parse().map_err(|_| {
                Error::BadRequest(
                    ErrorKind::InvalidParam,
                    "Resize method must be \"scale\" or \"crop\"",
                )
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub(crate) struct ThumbnailSize {
    pub(crate) width: u32,
    pub(crate) height: u32,
    #[serde(default)]
    pub(crate) method: ResizeMethod,
}

impl ThumbnailSize {
    pub(crate) fn new(
        width: u32,
        height: u32,
        method: ResizeMethod,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::BadRequest(
                ErrorKind::InvalidParam,
                "Thumbnail width and height must be positive",
            ));
        }

        Ok(Self {
            width,
            height,
            method,
        })
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}-{}", self.width, self.height, self.method.as_ref())
    }
}

/// Who quarantined something, when and why
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct QuarantineRecord {
    pub(crate) quarantined_at: u64,
    pub(crate) quarantined_by: String,
    pub(crate) reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MediaMetadata {
    pub(crate) media_id: MediaId,
    pub(crate) origin: Origin,
    pub(crate) content_type: String,
    pub(crate) file_size: u64,
    /// Display filename, may be empty
    pub(crate) upload_name: String,
    pub(crate) hash: ContentHash,
    /// `None` for media fetched from other servers
    pub(crate) user_id: Option<OwnedUserId>,
    pub(crate) created_ts: u64,
    pub(crate) quarantine: Option<QuarantineRecord>,
}

impl MediaMetadata {
    pub(crate) fn mxc(&self) -> OwnedMxcUri {
        format!("mxc://{}/{}", self.origin, self.media_id).into()
    }

    pub(crate) fn is_quarantined(&self) -> bool {
        self.quarantine.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ThumbnailMetadata {
    pub(crate) media_id: MediaId,
    pub(crate) origin: Origin,
    pub(crate) size: ThumbnailSize,
    pub(crate) content_type: String,
    pub(crate) file_size: u64,
    pub(crate) hash: ContentHash,
    pub(crate) created_ts: u64,
    pub(crate) quarantine: Option<QuarantineRecord>,
}

/// Returns whether thumbnails can be generated for this content type
pub(crate) fn is_thumbnailable(content_type: &str) -> bool {
    content_type.trim_start().to_ascii_lowercase().starts_with("image/")
}
