use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{pin_mut, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::file::{AsyncSeekStart, FilesystemError};
use crate::range::ByteRange;
use crate::StreamError;

/// Buffer size for whole-file pass-through.
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Largest chunk read for a partial response.
pub const PARTIAL_CHUNK_SIZE: usize = 8 * 1024;

/// Response body stream. Implements [`Stream`], [`Body`], and [`IntoResponse`].
///
/// In full mode the reader is consumed from its current position in
/// [`IO_BUFFER_SIZE`] pieces. In partial mode it is first seeked to the
/// range start and then read in [`PARTIAL_CHUNK_SIZE`] pieces, the last one
/// truncated so nothing past the range end is ever read. Either way the body
/// ends early if the reader hits end of file.
#[pin_project]
pub struct ChunkedBody<R> {
    state: StreamState,
    length: u64,
    chunk_size: usize,
    #[pin]
    reader: R,
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Done,
}

impl<R: AsyncRead + AsyncSeekStart> ChunkedBody<R> {
    /// Stream `length` bytes from the reader's current position.
    pub fn full(reader: R, length: u64) -> Self {
        ChunkedBody {
            state: StreamState::Reading { buffer: allocate_buffer(IO_BUFFER_SIZE), remaining: length },
            length,
            chunk_size: IO_BUFFER_SIZE,
            reader,
        }
    }

    /// Stream exactly the bytes covered by `range`.
    pub fn partial(reader: R, range: ByteRange) -> Self {
        ChunkedBody {
            state: StreamState::Seek { start: range.start() },
            length: range.len(),
            chunk_size: PARTIAL_CHUNK_SIZE,
            reader,
        }
    }

    /// Number of bytes the body will produce if the reader does not run dry.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<R: AsyncRead + AsyncSeekStart + Send + 'static> IntoResponse for ChunkedBody<R> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<R: AsyncRead + AsyncSeekStart> Body for ChunkedBody<R> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<R: AsyncRead + AsyncSeekStart> Stream for ChunkedBody<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if let StreamState::Seek { start } = *this.state {
            match this.reader.as_mut().start_seek(start) {
                Err(e) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
                Ok(()) => {
                    let remaining = *this.length;
                    *this.state = StreamState::Seeking { remaining };
                }
            }
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.reader.as_mut().poll_complete(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => {
                    *this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Ok(())) => {
                    let buffer = allocate_buffer(*this.chunk_size);
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        if let StreamState::Reading { buffer, remaining } = this.state {
            if *remaining == 0 {
                *this.state = StreamState::Done;
                return Poll::Ready(None);
            }

            let uninit = buffer.spare_capacity_mut();

            // the smaller of the chunk size and the bytes left in the range
            let nbytes = std::cmp::min(
                uninit.len(),
                usize::try_from(*remaining).unwrap_or(usize::MAX),
            );

            let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

            return match this.reader.as_mut().poll_read(cx, &mut read_buf) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Err(e)) => {
                    *this.state = StreamState::Done;
                    Poll::Ready(Some(Err(e)))
                }
                Poll::Ready(Ok(())) => match read_buf.filled().len() {
                    0 => {
                        *this.state = StreamState::Done;
                        Poll::Ready(None)
                    }
                    n => {
                        // SAFETY: poll_read has filled the buffer with `n`
                        // additional bytes. `buffer.len` is always 0 here.
                        unsafe { buffer.set_len(buffer.len() + n); }

                        let chunk = mem::replace(buffer, allocate_buffer(*this.chunk_size));

                        // n <= remaining because of the min above
                        *remaining -= n as u64;

                        Poll::Ready(Some(Ok(chunk.freeze())))
                    }
                },
            };
        }

        Poll::Ready(None)
    }
}

/// Drive `body` into `sink`, returning the number of bytes written.
///
/// Read failures surface as [`StreamError::StreamUnavailable`] and write or
/// flush failures as [`StreamError::SinkClosed`]; both stop the copy at once.
pub(crate) async fn copy_to_sink<R, W>(
    body: ChunkedBody<R>,
    sink: &mut W,
    flush_each_chunk: bool,
    path: &str,
) -> Result<u64, StreamError>
where
    R: AsyncRead + AsyncSeekStart,
    W: AsyncWrite + Unpin + ?Sized,
{
    pin_mut!(body);
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FilesystemError::io(path, e))?;
        sink.write_all(&chunk).await.map_err(StreamError::SinkClosed)?;
        if flush_each_chunk {
            sink.flush().await.map_err(StreamError::SinkClosed)?;
        }
        written += chunk.len() as u64;
    }

    sink.flush().await.map_err(StreamError::SinkClosed)?;
    Ok(written)
}

fn allocate_buffer(capacity: usize) -> BytesMut {
    BytesMut::with_capacity(capacity)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, SeekFrom};

    use assert_matches::assert_matches;
    use futures::TryStreamExt;
    use tokio::io::AsyncSeek;

    use super::*;

    /// Reader whose seeks or reads fail.
    struct BrokenReader {
        fail_seek: bool,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("read failed")))
        }
    }

    impl AsyncSeek for BrokenReader {
        fn start_seek(self: Pin<&mut Self>, _: SeekFrom) -> io::Result<()> {
            if self.fail_seek {
                Err(io::Error::other("seek failed"))
            } else {
                Ok(())
            }
        }

        fn poll_complete(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<u64>> {
            Poll::Ready(Ok(0))
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_partial_chunks_are_bounded() {
        let source = data(20_000);
        let body = ChunkedBody::partial(Cursor::new(source.clone()), ByteRange::new(100, 17_000).unwrap());
        assert_eq!(16_901, body.len());

        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(3, chunks.len());
        assert!(chunks.iter().all(|c| c.len() <= PARTIAL_CHUNK_SIZE));
        assert_eq!(&source[100..=17_000], &chunks.concat()[..]);
    }

    #[tokio::test]
    async fn test_partial_single_byte() {
        let source = data(20);
        let body = ChunkedBody::partial(Cursor::new(source), ByteRange::new(7, 7).unwrap());
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(vec![Bytes::from_static(&[7])], chunks);
    }

    #[tokio::test]
    async fn test_full_pass_through() {
        let source = data(150_000);
        let body = ChunkedBody::full(Cursor::new(source.clone()), 150_000);
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert!(chunks.iter().all(|c| c.len() <= IO_BUFFER_SIZE));
        assert_eq!(source, chunks.concat());
    }

    #[tokio::test]
    async fn test_stops_at_end_of_file() {
        let body = ChunkedBody::full(Cursor::new(data(10)), 100);
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(10, chunks.concat().len());

        let body = ChunkedBody::partial(Cursor::new(data(10)), ByteRange::new(5, 50).unwrap());
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(&data(10)[5..], &chunks.concat()[..]);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let body = ChunkedBody::full(Cursor::new(Vec::<u8>::new()), 0);
        assert!(body.is_empty());
        let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_size_hint_is_exact() {
        let body = ChunkedBody::partial(Cursor::new(data(20)), ByteRange::new(5, 14).unwrap());
        assert_eq!(Some(10), Body::size_hint(&body).exact());
    }

    #[tokio::test]
    async fn test_copy_to_sink() {
        let source = data(30_000);
        let body = ChunkedBody::partial(Cursor::new(source.clone()), ByteRange::new(1, 20_000).unwrap());
        let mut sink: Vec<u8> = Vec::new();
        let written = copy_to_sink(body, &mut sink, true, "data.bin").await.unwrap();
        assert_eq!(20_000, written);
        assert_eq!(&source[1..=20_000], &sink[..]);
    }

    #[tokio::test]
    async fn test_failed_seek_is_stream_unavailable() {
        let body = ChunkedBody::partial(BrokenReader { fail_seek: true }, ByteRange::new(5, 9).unwrap());
        let mut sink: Vec<u8> = Vec::new();
        let result = copy_to_sink(body, &mut sink, true, "clip.mp4").await;
        assert_matches!(
            result,
            Err(StreamError::StreamUnavailable(FilesystemError::Io { path, source }))
                if path == "clip.mp4" && source.to_string() == "seek failed"
        );
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_failed_read_is_stream_unavailable() {
        let body = ChunkedBody::partial(BrokenReader { fail_seek: false }, ByteRange::new(5, 9).unwrap());
        let mut sink: Vec<u8> = Vec::new();
        let result = copy_to_sink(body, &mut sink, true, "clip.mp4").await;
        assert_matches!(
            result,
            Err(StreamError::StreamUnavailable(FilesystemError::Io { source, .. }))
                if source.to_string() == "read failed"
        );
        assert!(sink.is_empty());

        let body = ChunkedBody::full(BrokenReader { fail_seek: false }, 10);
        let mut sink: Vec<u8> = Vec::new();
        let result = copy_to_sink(body, &mut sink, false, "clip.mp4").await;
        assert_matches!(result, Err(StreamError::StreamUnavailable(FilesystemError::Io { .. })));
        assert!(sink.is_empty());
    }
}
