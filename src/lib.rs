//! # axum-filestream
//!
//! HTTP byte-range file streaming for [`axum`][1].
//!
//! Files are reached through the [`Filesystem`] trait, so the same code
//! serves from local disk ([`LocalFilesystem`]), memory
//! ([`MemoryFilesystem`]) or any other store that can hand out a seekable
//! reader. A [`FileStream`] is configured for one request, resolved against
//! the request's `Range` header into a [`ResolvedStream`], and then either
//! turned into a response or written into any [`AsyncWrite`] sink.
//!
//! Only single ranges are supported. Multi-range requests, like every other
//! malformed or out of bounds range, are answered with `416 Range Not
//! Satisfiable` before a single byte of the body is read.
//!
//! ```
//! use std::sync::Arc;
//!
//! use axum::Router;
//! use axum::extract::State;
//! use axum::http::HeaderMap;
//! use axum::response::Response;
//! use axum::routing::get;
//!
//! use axum_filestream::{LocalFilesystem, StreamFiles};
//!
//! async fn video(State(fs): State<Arc<LocalFilesystem>>, headers: HeaderMap) -> Response {
//!     fs.stream("video.mp4")
//!         .with_mimetype("video/mp4")
//!         .respond_to(&headers)
//!         .await
//! }
//!
//! let fs = Arc::new(LocalFilesystem::new("public"));
//! let _app: Router = Router::new().route("/video", get(video)).with_state(fs);
//! ```
//!
//! [1]: https://docs.rs/axum

mod error;
mod file;
mod range;
mod stream;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

pub use error::{RangeNotSatisfiable, StreamError};
pub use file::{AsyncSeekStart, Filesystem, FilesystemError, LocalFilesystem, MemoryFilesystem, StreamFiles};
pub use range::{ByteRange, RangeError};
pub use stream::{ChunkedBody, IO_BUFFER_SIZE, PARTIAL_CHUNK_SIZE};

/// Pull the raw `Range` header out of a request's headers.
///
/// Fails with [`RangeError::Unreadable`] when the value is not visible ASCII.
pub fn range_header(headers: &HeaderMap) -> Result<Option<&str>, RangeError> {
    headers
        .get(header::RANGE)
        .map(|value| value.to_str().map_err(|_| RangeError::Unreadable))
        .transpose()
}

/// How the client should present the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    /// Render in the browser if possible.
    #[default]
    Inline,
    /// Prompt the user to save the file.
    Download,
}

impl Disposition {
    /// The `Content-Disposition` type token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Download => "attachment",
        }
    }
}

/// Per-request overrides for a [`FileStream`].
///
/// Anything left unset is looked up through the [`Filesystem`] (size,
/// mimetype) or derived from the path (filename) when the range is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub size: Option<u64>,
    pub mimetype: Option<String>,
    pub filename: Option<String>,
    pub disposition: Disposition,
    /// Status for full responses. Partial responses are always 206.
    pub status: Option<StatusCode>,
}

impl StreamOptions {
    pub fn with_download(mut self) -> Self {
        self.disposition = Disposition::Download;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }
}

/// A file about to be streamed, bound to the filesystem it lives on.
///
/// Built once per request, configured with the `with_*` methods, then
/// consumed by [`FileStream::resolve_range`].
#[derive(Debug)]
pub struct FileStream<'a, F> {
    fs: &'a F,
    path: String,
    options: StreamOptions,
}

impl<'a, F: Filesystem> FileStream<'a, F> {
    pub fn new(fs: &'a F, path: impl Into<String>) -> Self {
        FileStream { fs, path: path.into(), options: StreamOptions::default() }
    }

    /// Replace all overrides at once.
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Send `Content-Disposition: attachment` instead of `inline`.
    pub fn with_download(mut self) -> Self {
        self.options = self.options.with_download();
        self
    }

    /// Filename for `Content-Disposition`. Defaults to the last path segment.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.options = self.options.with_filename(filename);
        self
    }

    /// Use a known size instead of asking the filesystem.
    pub fn with_size(mut self, size: u64) -> Self {
        self.options = self.options.with_size(size);
        self
    }

    /// Use a known MIME type instead of asking the filesystem.
    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.options = self.options.with_mimetype(mimetype);
        self
    }

    /// Status sent when no range is requested. Defaults to 200.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.options = self.options.with_status(status);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Resolve the request's `Range` header (`None` or blank for the whole
    /// file) into a streaming plan.
    ///
    /// The file size is looked up at most once, here, and reused for the
    /// headers and the body. The range is validated before anything else is
    /// touched, so a bad range costs one size lookup and nothing more.
    pub async fn resolve_range(self, range_header: Option<&str>) -> Result<ResolvedStream<'a, F>, StreamError> {
        self.resolve(Ok(range_header)).await
    }

    /// Like [`FileStream::resolve_range`], taking the `Range` header straight
    /// from the request. An unreadable header is a 416 like any bad range.
    pub async fn resolve_request(self, headers: &HeaderMap) -> Result<ResolvedStream<'a, F>, StreamError> {
        self.resolve(range_header(headers)).await
    }

    async fn resolve(self, range_header: Result<Option<&str>, RangeError>) -> Result<ResolvedStream<'a, F>, StreamError> {
        let FileStream { fs, path, options } = self;

        let total_size = match options.size {
            Some(size) => size,
            None => fs.size(&path).await?,
        };

        let range = range_header
            .and_then(|header| ByteRange::resolve(header, total_size))
            .map_err(|reason| {
                warn!(path = %path, total_size, %reason, "rejecting range request");
                RangeNotSatisfiable::new(total_size, reason)
            })?;

        let mimetype = match options.mimetype {
            Some(mimetype) => mimetype,
            None => fs.mimetype(&path).await?,
        };

        let status = match range {
            Some(_) => StatusCode::PARTIAL_CONTENT,
            None => options.status.unwrap_or(StatusCode::OK),
        };

        let filename = match options.filename {
            Some(filename) => filename,
            None => default_filename(&path).to_owned(),
        };

        let mut resolved = ResolvedStream {
            fs,
            path,
            total_size,
            range,
            status,
            mimetype,
            filename,
            disposition: options.disposition,
            headers: HeaderMap::new(),
        };
        resolved.headers = resolved.build_headers()?;

        debug!(
            path = %resolved.path,
            total_size,
            status = resolved.status.as_u16(),
            range = ?resolved.range,
            "resolved file stream"
        );

        Ok(resolved)
    }

    /// Resolve and respond in one go, turning every failure into its error
    /// response (416, 404, 400 or 500).
    pub async fn respond(self, range_header: Option<&str>) -> Response {
        self.respond_with(Ok(range_header)).await
    }

    /// Like [`FileStream::respond`], taking the `Range` header straight from
    /// the request.
    pub async fn respond_to(self, headers: &HeaderMap) -> Response {
        self.respond_with(range_header(headers)).await
    }

    async fn respond_with(self, range_header: Result<Option<&str>, RangeError>) -> Response {
        let result = match self.resolve(range_header).await {
            Ok(resolved) => resolved.respond().await,
            Err(err) => Err(err),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                if !matches!(err, StreamError::RangeNotSatisfiable(_)) {
                    warn!(error = %err, "failed to stream file");
                }
                err.into_response()
            }
        }
    }
}

/// A [`FileStream`] with its range, size and headers fixed.
#[derive(Debug)]
pub struct ResolvedStream<'a, F> {
    fs: &'a F,
    path: String,
    total_size: u64,
    range: Option<ByteRange>,
    status: StatusCode,
    mimetype: String,
    filename: String,
    disposition: Disposition,
    headers: HeaderMap,
}

impl<'a, F: Filesystem> ResolvedStream<'a, F> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The requested range, or `None` when the whole file is served.
    pub fn range(&self) -> Option<ByteRange> {
        self.range
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of bytes in the body.
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.total_size, |range| range.len())
    }

    /// Offset of the first byte sent.
    pub fn start(&self) -> u64 {
        self.range.map_or(0, |range| range.start())
    }

    /// Offset of the last byte sent, `None` for an empty file.
    pub fn last_byte(&self) -> Option<u64> {
        match self.range {
            Some(range) => Some(range.end()),
            None => self.total_size.checked_sub(1),
        }
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Response headers: `Accept-Ranges`, `Content-Disposition`,
    /// `Content-Length`, `Content-Type`, plus `Content-Range` for 206.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn build_headers(&self) -> Result<HeaderMap, StreamError> {
        let mut headers = HeaderMap::new();

        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let disposition = format!(
            "{}; filename=\"{}\"",
            self.disposition.as_str(),
            quote_filename(&self.filename),
        );
        headers.insert(header::CONTENT_DISPOSITION, header_value(header::CONTENT_DISPOSITION, disposition)?);

        if let Some(range) = self.range {
            let content_range = format!("bytes {}-{}/{}", range.start(), range.end(), self.total_size);
            headers.insert(header::CONTENT_RANGE, header_value(header::CONTENT_RANGE, content_range)?);
        }

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.content_length()));
        headers.insert(header::CONTENT_TYPE, header_value(header::CONTENT_TYPE, self.mimetype.clone())?);

        Ok(headers)
    }

    /// Open the file and build the body for this plan.
    pub async fn open(&self) -> Result<ChunkedBody<F::Reader>, StreamError> {
        let reader = self.fs.read_stream(&self.path).await?;
        Ok(match self.range {
            Some(range) => ChunkedBody::partial(reader, range),
            None => ChunkedBody::full(reader, self.total_size),
        })
    }

    /// Write the body into `sink`, returning the number of bytes written.
    ///
    /// Partial bodies are flushed after every chunk so the client sees
    /// progress. A failed write ends the copy with
    /// [`StreamError::SinkClosed`]; nothing is retried. Neither the file nor
    /// the sink is closed.
    pub async fn stream<W>(self, sink: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let body = self.open().await?;
        let result = stream::copy_to_sink(body, sink, self.range.is_some(), &self.path).await;

        match &result {
            Ok(written) => debug!(path = %self.path, written, "finished streaming file"),
            Err(StreamError::SinkClosed(err)) => debug!(path = %self.path, error = %err, "client went away"),
            Err(err) => warn!(path = %self.path, error = %err, "streaming failed"),
        }

        result
    }

    /// Open the file and build the full HTTP response.
    pub async fn respond(self) -> Result<Response, StreamError> {
        let body = self.open().await?;
        Ok((self.status, self.headers, body).into_response())
    }
}

fn header_value(name: HeaderName, value: String) -> Result<HeaderValue, StreamError> {
    HeaderValue::try_from(value).map_err(|source| StreamError::InvalidHeader { name, source })
}

/// Last non-empty `/` segment of `path`.
fn default_filename(path: &str) -> &str {
    path.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or(path)
}

/// Escape for a quoted-string; control characters are dropped.
fn quote_filename(filename: &str) -> String {
    let mut quoted = String::with_capacity(filename.len());
    for c in filename.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            c if c.is_control() => {}
            c => quoted.push(c),
        }
    }
    quoted
}
