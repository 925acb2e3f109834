use std::io;

use axum::http::header::{self, HeaderName, InvalidHeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::file::FilesystemError;
use crate::range::RangeError;

/// Everything that can go wrong between resolving a range and the last byte
/// reaching the client.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The `Range` header was malformed, out of bounds or asked for more
    /// than one range. Detected before any byte is sent.
    #[error(transparent)]
    RangeNotSatisfiable(#[from] RangeNotSatisfiable),

    /// The backing file is missing or could not be opened, seeked or read.
    #[error("file unavailable: {0}")]
    StreamUnavailable(#[from] FilesystemError),

    /// Writing to the client failed, usually because it disconnected.
    #[error("client sink closed: {0}")]
    SinkClosed(#[source] io::Error),

    /// A configured value (filename, mimetype) cannot be sent as a header.
    #[error("invalid value for header {name}")]
    InvalidHeader {
        name: HeaderName,
        #[source]
        source: InvalidHeaderValue,
    },
}

/// Error type indicating that the requested range was not satisfiable.
/// Implements [`IntoResponse`] as a bodiless 416 carrying a `Content-Range`
/// hint describing the full representation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("range not satisfiable for {total_size} byte file: {reason}")]
pub struct RangeNotSatisfiable {
    pub total_size: u64,
    pub reason: RangeError,
}

impl RangeNotSatisfiable {
    pub(crate) fn new(total_size: u64, reason: RangeError) -> Self {
        RangeNotSatisfiable { total_size, reason }
    }

    /// Value of the `Content-Range` header sent with the 416 response.
    ///
    /// This is `bytes 0-<size-1>/<size>`, the range the server would have
    /// served by default. A zero-length file has no such range and gets the
    /// RFC 7233 `bytes */0` form instead.
    pub fn content_range(&self) -> String {
        match self.total_size.checked_sub(1) {
            Some(last) => format!("bytes 0-{}/{}", last, self.total_size),
            None => "bytes */0".to_owned(),
        }
    }
}

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let headers = [(header::CONTENT_RANGE, self.content_range())];
        (status, headers, ()).into_response()
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        match self {
            StreamError::RangeNotSatisfiable(err) => err.into_response(),
            StreamError::StreamUnavailable(FilesystemError::NotFound(_)) => {
                StatusCode::NOT_FOUND.into_response()
            }
            StreamError::StreamUnavailable(FilesystemError::InvalidPath(_)) => {
                StatusCode::BAD_REQUEST.into_response()
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_hint() {
        let err = RangeNotSatisfiable::new(100, RangeError::MultipleRanges);
        assert_eq!("bytes 0-99/100", err.content_range());

        let err = RangeNotSatisfiable::new(0, RangeError::MultipleRanges);
        assert_eq!("bytes */0", err.content_range());
    }

    #[test]
    fn test_range_not_satisfiable_response() {
        let err = RangeNotSatisfiable::new(54, RangeError::Malformed("bytes=x".into()));
        let response = err.into_response();
        assert_eq!(StatusCode::RANGE_NOT_SATISFIABLE, response.status());
        assert_eq!("bytes 0-53/54", response.headers()[header::CONTENT_RANGE]);
    }

    #[test]
    fn test_stream_error_status_mapping() {
        let missing = StreamError::from(FilesystemError::NotFound("a.txt".into()));
        assert_eq!(StatusCode::NOT_FOUND, missing.into_response().status());

        let invalid = StreamError::from(FilesystemError::InvalidPath("../a".into()));
        assert_eq!(StatusCode::BAD_REQUEST, invalid.into_response().status());

        let closed = StreamError::SinkClosed(io::ErrorKind::BrokenPipe.into());
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, closed.into_response().status());
    }
}
