//! SCGI request parsing.
//!
//! [`request::Parser`] is a sans-io state machine fed by the connection
//! task; the finished product is a [`Request`] holding the normalized
//! header environment and the raw body.

use std::collections::HashMap;
use std::fmt::Debug;
use std::iter::FusedIterator;

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol;

pub mod request;


/// Unrecoverable error types raised while parsing an SCGI request.
///
/// All of these are protocol errors in the sense of the server's error
/// policy: the connection is closed without writing a response.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A panic inside the parser code left the parser in an inconsistent
    /// state. The connection should be closed.
    #[error("SCGI parser state was lost due to an unexpected panic")]
    Paniced,

    /// The parser was consumed while in a non-final parsing state, for
    /// example via `Parser::into_request`.
    #[error("SCGI parser was consumed in the middle of parsing a request")]
    Interrupted,

    /// The header block does not carry the mandatory `CONTENT_LENGTH`
    /// variable.
    #[error("SCGI request lacks the mandatory CONTENT_LENGTH header")]
    MissingContentLength,

    /// The `CONTENT_LENGTH` value is not a decimal integer.
    #[error("SCGI request has a non-integer CONTENT_LENGTH header")]
    BadContentLength,

    /// The netstring framing around the header block is malformed.
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
}


const SMALLVEC_BASE_SIZE: usize = std::mem::size_of::<SmallVec<[u8; 0]>>();
// Maximum number of inline bytes before SmallVec exceeds SMALLVEC_BASE_SIZE.
// This derives from SmallVec's layout, which uses 1 usize as discriminant.
const INLINE_BYTES: usize = SMALLVEC_BASE_SIZE - std::mem::size_of::<usize>();
type SmallBytes = SmallVec<[u8; INLINE_BYTES]>;


/// A fully-parsed SCGI request.
///
/// Header names are normalized to uppercase during parsing, as CGI/1.1
/// treats variable names as case-insensitive. Values are kept as raw bytes;
/// upstream servers occasionally forward non-UTF-8 header contents.
#[derive(Debug, Clone, Default)]
pub struct Request {
    headers: HashMap<CompactString, SmallBytes>,
    body: Vec<u8>,
}

impl Request {
    /// Returns the number of header variables associated with this request.
    #[inline]
    #[must_use]
    pub fn env_len(&self) -> usize {
        self.headers.len()
    }

    /// Tests whether the given variable is part of this request's
    /// environment. The lookup name must already be uppercase.
    #[must_use]
    pub fn contains_var(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    /// Retrieves the value stored for the variable name, if there is one.
    #[must_use]
    pub fn get_var(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(AsRef::as_ref)
    }

    /// Attempts to retrieve the string value stored for the variable name.
    ///
    /// Returns [`None`] if there is no corresponding value *or if the value
    /// is not valid UTF-8*. Use `Request::get_var` for the raw bytes.
    #[must_use]
    pub fn get_var_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns an iterator over all header variables of this request.
    #[inline]
    #[must_use]
    pub fn env_iter(&self) -> impl ExactSizeIterator<Item = (&str, &[u8])>
            + FusedIterator + Clone + Debug + '_
    {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// The raw request body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}


#[cfg(test)]
mod test_support;
