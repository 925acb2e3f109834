use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::FileStream;

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// Errors reported by a [`Filesystem`].
#[derive(Debug, Error)]
pub enum FilesystemError {
    /// Nothing readable exists at the path.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The path tries to leave the filesystem root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Reading the file failed for any other reason.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FilesystemError {
    /// Wrap an I/O error, folding `NotFound` into [`FilesystemError::NotFound`].
    pub fn io(path: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => FilesystemError::NotFound(path.to_owned()),
            _ => FilesystemError::Io { path: path.to_owned(), source },
        }
    }
}

/// The capability a [`FileStream`] reads files through.
///
/// Paths are opaque identifiers interpreted by the implementation. Every
/// operation must fail with [`FilesystemError::NotFound`] when the path does
/// not exist.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Readable, seekable handle over a file's bytes.
    type Reader: AsyncRead + AsyncSeekStart + Send + Unpin + 'static;

    /// Open the file for reading, positioned at byte 0.
    async fn read_stream(&self, path: &str) -> Result<Self::Reader, FilesystemError>;

    /// Size of the file in bytes.
    async fn size(&self, path: &str) -> Result<u64, FilesystemError>;

    /// MIME type of the file, e.g. `text/plain`.
    async fn mimetype(&self, path: &str) -> Result<String, FilesystemError>;
}

/// Adds `stream(path)` to every [`Filesystem`].
pub trait StreamFiles: Filesystem + Sized {
    /// Start building a streamed response for `path`.
    fn stream(&self, path: impl Into<String>) -> FileStream<'_, Self> {
        FileStream::new(self, path)
    }
}

impl<F: Filesystem> StreamFiles for F {}

/// [`Filesystem`] backed by a directory on local disk.
///
/// Paths are resolved relative to the root. A leading `/` is ignored;
/// `..` and platform prefixes are refused.
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    root: PathBuf,
}

impl LocalFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFilesystem { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FilesystemError> {
        let relative = Path::new(path.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(FilesystemError::InvalidPath(path.to_owned())),
            }
        }
        Ok(self.root.join(relative))
    }

    /// Resolve `path` and make sure it names a regular file.
    async fn file_path(&self, path: &str) -> Result<(PathBuf, Metadata), FilesystemError> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| FilesystemError::io(path, e))?;
        if !metadata.is_file() {
            return Err(FilesystemError::NotFound(path.to_owned()));
        }
        Ok((full, metadata))
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    type Reader = tokio::fs::File;

    async fn read_stream(&self, path: &str) -> Result<tokio::fs::File, FilesystemError> {
        let (full, _) = self.file_path(path).await?;
        tokio::fs::File::open(&full)
            .await
            .map_err(|e| FilesystemError::io(path, e))
    }

    async fn size(&self, path: &str) -> Result<u64, FilesystemError> {
        let (_, metadata) = self.file_path(path).await?;
        Ok(metadata.len())
    }

    async fn mimetype(&self, path: &str) -> Result<String, FilesystemError> {
        let (full, _) = self.file_path(path).await?;
        Ok(mime_guess::from_path(&full).first_or_octet_stream().to_string())
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    contents: Bytes,
    mimetype: Option<String>,
}

/// [`Filesystem`] holding whole files in memory.
///
/// Handy for tests and for serving embedded assets. MIME types are guessed
/// from the path unless set explicitly.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilesystem {
    files: HashMap<String, MemoryFile>,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryFilesystem::insert`].
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Bytes>) {
        let file = MemoryFile { contents: contents.into(), mimetype: None };
        self.files.insert(path.into(), file);
    }

    pub fn insert_with_mimetype(
        &mut self,
        path: impl Into<String>,
        contents: impl Into<Bytes>,
        mimetype: impl Into<String>,
    ) {
        let file = MemoryFile { contents: contents.into(), mimetype: Some(mimetype.into()) };
        self.files.insert(path.into(), file);
    }

    pub fn remove(&mut self, path: &str) -> Option<Bytes> {
        self.files.remove(path).map(|file| file.contents)
    }

    fn get(&self, path: &str) -> Result<&MemoryFile, FilesystemError> {
        self.files
            .get(path)
            .ok_or_else(|| FilesystemError::NotFound(path.to_owned()))
    }
}

#[async_trait]
impl Filesystem for MemoryFilesystem {
    type Reader = io::Cursor<Bytes>;

    async fn read_stream(&self, path: &str) -> Result<io::Cursor<Bytes>, FilesystemError> {
        // Bytes clones share the underlying buffer
        Ok(io::Cursor::new(self.get(path)?.contents.clone()))
    }

    async fn size(&self, path: &str) -> Result<u64, FilesystemError> {
        Ok(self.get(path)?.contents.len() as u64)
    }

    async fn mimetype(&self, path: &str) -> Result<String, FilesystemError> {
        let file = self.get(path)?;
        Ok(match &file.mimetype {
            Some(mimetype) => mimetype.clone(),
            None => mime_guess::from_path(path).first_or_octet_stream().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn local() -> LocalFilesystem {
        LocalFilesystem::new("test")
    }

    #[tokio::test]
    async fn test_file_size() {
        assert_eq!(54, local().size("fixture.txt").await.unwrap());
        assert_eq!(54, local().size("/fixture.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_mimetype() {
        assert_eq!("text/plain", local().mimetype("fixture.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_stream() {
        let mut file = local().read_stream("fixture.txt").await.unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!("Hello world this is a file to test range requests on!\n", contents);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let fs = local();
        assert_matches!(fs.size("missing.txt").await, Err(FilesystemError::NotFound(p)) if p == "missing.txt");
        assert_matches!(fs.mimetype("missing.txt").await, Err(FilesystemError::NotFound(_)));
        assert_matches!(fs.read_stream("missing.txt").await, Err(FilesystemError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_directory_is_not_found() {
        let fs = LocalFilesystem::new(".");
        assert_matches!(fs.size("test").await, Err(FilesystemError::NotFound(_)));
        assert_matches!(fs.size("").await, Err(FilesystemError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let fs = local();
        assert_matches!(fs.size("../Cargo.toml").await, Err(FilesystemError::InvalidPath(_)));
        assert_matches!(fs.read_stream("a/../../Cargo.toml").await, Err(FilesystemError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_memory_filesystem() {
        let mut fs = MemoryFilesystem::new().with_file("clip.mp4", &b"0123456789"[..]);
        fs.insert_with_mimetype("blob", "abc", "application/x-custom");

        assert_eq!(10, fs.size("clip.mp4").await.unwrap());
        assert_eq!("video/mp4", fs.mimetype("clip.mp4").await.unwrap());
        assert_eq!("application/x-custom", fs.mimetype("blob").await.unwrap());
        fs.insert("noext", "xyz");
        assert_eq!("application/octet-stream", fs.mimetype("noext").await.unwrap());

        let mut reader = fs.read_stream("blob").await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(b"abc", &contents[..]);

        assert_eq!(Some(Bytes::from_static(b"abc")), fs.remove("blob"));
        assert_matches!(fs.size("blob").await, Err(FilesystemError::NotFound(_)));
    }
}
