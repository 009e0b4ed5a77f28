//! Content-addressed file storage
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── content/
//! │   └── b9/4d27b9934d3e08a52e...   # finalized content, hex of the hash
//! └── tmp/
//!     └── 3kQ9.../content            # in-progress writes
//! ```

use std::{
    convert::Infallible,
    error::Error as StdError,
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use ring::digest;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
};
use tracing::{trace, warn, Level};

use super::ContentHash;
use crate::{config::SizeLimit, utils, Error, Result};

const CONTENT_FOLDER: &str = "content";
const TEMP_FOLDER: &str = "tmp";
const TEMP_FILE: &str = "content";

/// Length of the random name of each temporary directory
const TEMP_NAME_LENGTH: usize = 32;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Temporary directory that is removed when discarded or dropped
///
/// Prefer [`TempDir::discard`]; dropping falls back to a blocking removal so
/// that canceled writes still clean up.
#[derive(Debug)]
struct TempDir {
    path: PathBuf,
    removed: bool,
}

impl TempDir {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            removed: false,
        }
    }

    async fn discard(mut self) {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => trace!(path = %self.path.display(), "removed temp dir"),
            Err(error) => log_removal_error(&self.path, &error),
        }
        self.removed = true;
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "removed temp dir"),
            Err(error) => log_removal_error(&self.path, &error),
        }
    }
}

fn log_removal_error(path: &Path, error: &io::Error) {
    if error.kind() == io::ErrorKind::NotFound {
        trace!(path = %path.display(), "directory was already gone");
    } else {
        warn!(path = %path.display(), %error, "failed to remove directory");
    }
}

/// Content that has been written and hashed but not yet committed
///
/// Dropping this discards the written bytes.
#[derive(Debug)]
pub(crate) struct TempContent {
    pub(crate) hash: ContentHash,
    pub(crate) size: u64,
    dir: TempDir,
}

impl TempContent {
    fn file_path(&self) -> PathBuf {
        self.dir.path.join(TEMP_FILE)
    }
}

pub(crate) struct MediaStore {
    base_path: PathBuf,
}

impl MediaStore {
    /// Opens the store, discarding any writes left over from a previous run
    pub(crate) async fn open(base_path: PathBuf) -> Result<Self> {
        let store = Self {
            base_path,
        };

        store.remove_directory(&store.base_path.join(TEMP_FOLDER)).await;
        fs::create_dir_all(store.base_path.join(TEMP_FOLDER)).await?;
        fs::create_dir_all(store.base_path.join(CONTENT_FOLDER)).await?;

        Ok(store)
    }

    /// Maps a hash to the path its content is stored at
    pub(crate) fn path_for_hash(&self, hash: &ContentHash) -> PathBuf {
        let (prefix, remainder) = hash.shard();
        self.base_path.join(CONTENT_FOLDER).join(prefix).join(remainder)
    }

    /// Streams `body` into a temporary file while hashing it
    ///
    /// Fails with [`Error::TooLarge`] as soon as more than `limit` bytes have
    /// been received, regardless of what the sender declared up front.
    #[tracing::instrument(skip(self, body))]
    pub(crate) async fn write_content<S, E>(
        &self,
        mut body: S,
        limit: SizeLimit,
    ) -> Result<TempContent>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let dir = TempDir::new(
            self.base_path
                .join(TEMP_FOLDER)
                .join(utils::random_string(TEMP_NAME_LENGTH)),
        );

        match write_hashed(&dir.path, &mut body, limit).await {
            Ok((hash, size)) => Ok(TempContent {
                hash,
                size,
                dir,
            }),
            Err(error) => {
                dir.discard().await;
                Err(error)
            }
        }
    }

    /// Moves written content to its hash-derived path, checking it again
    /// after the move
    ///
    /// The content is staged next to its final path and verified there, so
    /// content that fails the check never replaces what is already stored.
    /// Content that is already present is replaced by identical bytes. The
    /// temporary directory is removed whatever the outcome.
    #[tracing::instrument(skip(self), fields(hash = %temp.hash))]
    pub(crate) async fn finalize(&self, temp: TempContent) -> Result<PathBuf> {
        let result = self.commit(&temp).await;
        temp.dir.discard().await;

        result
    }

    async fn commit(&self, temp: &TempContent) -> Result<PathBuf> {
        let path = self.path_for_hash(&temp.hash);
        let staged = path.with_extension(format!(
            "{}.partial",
            utils::random_string(TEMP_NAME_LENGTH)
        ));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(temp.file_path(), &staged).await?;

        let verified = match hash_file(&staged).await {
            Ok(actual) if actual == temp.hash => {
                fs::rename(&staged, &path).await.map_err(Error::from)
            }
            Ok(actual) => Err(Error::HashMismatch {
                expected: temp.hash.clone(),
                actual,
            }),
            Err(error) => Err(error),
        };

        if verified.is_err() {
            if let Err(error) = fs::remove_file(&staged).await {
                log_removal_error(&staged, &error);
            }
        }
        verified?;

        Ok(path)
    }

    /// Writes and finalizes an in-memory buffer in one go
    pub(crate) async fn store_bytes(
        &self,
        bytes: Vec<u8>,
    ) -> Result<(ContentHash, u64)> {
        let body = stream::iter([Ok::<_, Infallible>(Bytes::from(bytes))]);
        let temp = self.write_content(body, SizeLimit::Unlimited).await?;
        let hash = temp.hash.clone();
        let size = temp.size;
        self.finalize(temp).await?;

        Ok((hash, size))
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self))]
    pub(crate) async fn read(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut file = Vec::new();
        BufReader::new(File::open(self.path_for_hash(hash)).await?)
            .read_to_end(&mut file)
            .await?;

        Ok(file)
    }

    /// Removes a directory and everything in it, logging instead of failing
    pub(crate) async fn remove_directory(&self, path: &Path) {
        if let Err(error) = fs::remove_dir_all(path).await {
            log_removal_error(path, &error);
        }
    }
}

/// Writes `body` to `dir` while hashing it, enforcing `limit`
async fn write_hashed<S, E>(
    dir: &Path,
    body: &mut S,
    limit: SizeLimit,
) -> Result<(ContentHash, u64)>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fs::create_dir_all(dir).await?;

    let mut file = File::create(dir.join(TEMP_FILE)).await?;
    let mut context = digest::Context::new(&digest::SHA256);
    let mut size = 0_u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| Error::Body(e.into()))?;

        size = size
            .saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        limit.check(size)?;

        context.update(&chunk);
        file.write_all(&chunk).await?;
    }

    file.sync_all().await?;

    Ok((ContentHash::from_digest(&context.finish()), size))
}

async fn hash_file(path: &Path) -> Result<ContentHash> {
    let mut file = File::open(path).await?;
    let mut context = digest::Context::new(&digest::SHA256);
    let mut buffer = vec![0; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.update(buffer.get(..read).unwrap_or_default());
    }

    Ok(ContentHash::from_digest(&context.finish()))
}
