//! Single-range `Range` header parsing (RFC 7233 subset).
//!
//! Accepted forms, after the `bytes=` unit:
//!
//! ```text
//! range-spec = first-byte-pos "-" [ last-byte-pos ]
//!            / "-" suffix-length
//! ```
//!
//! Multi-range sets are rejected outright.

use thiserror::Error;

const BYTES_UNIT: &str = "bytes";

/// An inclusive byte range `[start, end]` into a file. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

/// Why a `Range` header was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// The header bytes are not visible ASCII.
    #[error("range header is not visible ASCII")]
    Unreadable,

    #[error("unsupported range unit in {0:?}")]
    UnsupportedUnit(String),

    #[error("multiple ranges are not supported")]
    MultipleRanges,

    #[error("malformed range spec {0:?}")]
    Malformed(String),

    /// Well formed, but does not overlap the file. `start`/`end` are the
    /// requested values after clamping.
    #[error("range {start}-{end} outside of {total_size} bytes")]
    Unsatisfiable { start: u64, end: u64, total_size: u64 },

    /// Suffix range asking for zero bytes or more bytes than the file has.
    #[error("suffix length {suffix} not satisfiable for {total_size} bytes")]
    Suffix { suffix: u64, total_size: u64 },
}

impl ByteRange {
    /// Create a byte range with inclusive start and end, `None` if
    /// `start > end`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(ByteRange { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered by the range, at least 1.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Resolve a raw `Range` header value against a file of `total_size`
    /// bytes.
    ///
    /// Returns `Ok(None)` for an absent or blank header, meaning the whole
    /// file is served with status 200. Returns the clamped range otherwise.
    pub fn resolve(header: Option<&str>, total_size: u64) -> Result<Option<ByteRange>, RangeError> {
        let header = match header.map(str::trim) {
            None | Some("") => return Ok(None),
            Some(header) => header,
        };

        let spec = match header.split_once('=') {
            Some((unit, spec)) if unit.trim().eq_ignore_ascii_case(BYTES_UNIT) => spec.trim(),
            _ => return Err(RangeError::UnsupportedUnit(header.to_owned())),
        };

        if spec.contains(',') {
            return Err(RangeError::MultipleRanges);
        }

        let malformed = || RangeError::Malformed(spec.to_owned());

        let (start_part, end_part) = spec.split_once('-').ok_or_else(malformed)?;
        if end_part.contains('-') {
            return Err(malformed());
        }

        // bytes=-N, the last N bytes
        if start_part.is_empty() {
            let suffix = parse_pos(end_part).ok_or_else(malformed)?;
            if suffix == 0 || suffix > total_size {
                return Err(RangeError::Suffix { suffix, total_size });
            }
            return Ok(Some(ByteRange { start: total_size - suffix, end: total_size - 1 }));
        }

        let start = parse_pos(start_part).ok_or_else(malformed)?;
        let end = if end_part.is_empty() {
            total_size
        } else {
            parse_pos(end_part).ok_or_else(malformed)?
        };

        let last_byte = match total_size.checked_sub(1) {
            Some(last_byte) => last_byte,
            None => return Err(RangeError::Unsatisfiable { start, end, total_size }),
        };
        let end = end.min(last_byte);

        if start > end || start > last_byte {
            return Err(RangeError::Unsatisfiable { start, end, total_size });
        }

        Ok(Some(ByteRange { start, end }))
    }
}

/// Parse a byte position. Only plain ASCII digits are accepted, so signs,
/// whitespace and values overflowing `u64` are all rejected.
fn parse_pos(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
