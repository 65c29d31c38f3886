//! The SCGI wire format.
//!
//! An SCGI request is a netstring-framed header block followed by the raw
//! request body: `<len>:<headers>,<body>`. `<len>` is the decimal byte
//! length of `<headers>`, which is a sequence of `name\0value\0` pairs.
//! The body length is carried in the mandatory `CONTENT_LENGTH` header.

use std::io::{self, Write};


/// Error types that may occur while decoding SCGI framing.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The netstring length prefix contains a byte other than an ASCII
    /// digit before the `:` separator.
    #[error("invalid byte {0:#04x} in netstring length prefix")]
    BadLengthByte(u8),

    /// The netstring length prefix is empty (the stream starts with `:`)
    /// or longer than [`MAX_LENGTH_DIGITS`] digits.
    #[error("netstring length prefix is empty or oversized")]
    BadLength,

    /// The declared header block length exceeds [`MAX_HEAD_LEN`].
    #[error("declared header block length {0} exceeds limit")]
    OversizedHead(usize),

    /// The byte terminating the netstring is not the `,` the format
    /// requires.
    #[error("netstring terminated by {0:#04x} instead of a comma")]
    BadTerminator(u8),
}


/// Upper bound on the digits of the netstring length prefix.
///
/// Ten digits already cover every length below [`MAX_HEAD_LEN`]; a longer
/// prefix cannot introduce a valid request.
pub const MAX_LENGTH_DIGITS: usize = 10;

/// Upper bound on the declared header block length.
///
/// Real SCGI header blocks are a few kilobytes; the cap keeps a malicious
/// peer from ballooning the connection buffer.
pub const MAX_HEAD_LEN: usize = 1 << 20;


/// Scans the netstring length prefix at the start of `buf`.
///
/// Returns `Ok(None)` while the prefix is still incomplete. On success the
/// result is `(hlen, hbeg)`: the declared header block length and the byte
/// offset just past the `:` separator.
///
/// # Errors
/// Returns an [`Error`] if the prefix contains a non-digit, is empty or
/// oversized, or declares a header block longer than [`MAX_HEAD_LEN`].
pub fn parse_length(buf: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    for (i, &byte) in buf.iter().enumerate() {
        match byte {
            b'0'..=b'9' if i < MAX_LENGTH_DIGITS => {},
            b':' if i > 0 => {
                // At most 10 digits, so this cannot overflow u64
                let hlen = buf[..i]
                    .iter()
                    .fold(0u64, |acc, &d| acc * 10 + u64::from(d - b'0'));
                let hlen = usize::try_from(hlen).map_err(|_| Error::OversizedHead(usize::MAX))?;
                if hlen > MAX_HEAD_LEN {
                    return Err(Error::OversizedHead(hlen));
                }
                return Ok(Some((hlen, i + 1)));
            },
            b':' => return Err(Error::BadLength),
            _ if i >= MAX_LENGTH_DIGITS => return Err(Error::BadLength),
            _ => return Err(Error::BadLengthByte(byte)),
        }
    }
    Ok(None)
}


/// An iterator decoding `name\0value\0` pairs from an SCGI header block.
///
/// The returned pairs are carved out of the input slice. A trailing name
/// without a value terminator is not yielded; it remains accessible via
/// `PairIter::into_inner`.
#[derive(Debug, Clone)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct PairIter<'a> {
    data: &'a [u8],
}

impl<'a> PairIter<'a> {
    /// Creates a new [`PairIter`] over a header block.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Extracts the remaining undecodable input from the iterator.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for PairIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let name_end = self.data.iter().position(|&b| b == 0)?;
        let rest = &self.data[(name_end + 1)..];
        let val_end = rest.iter().position(|&b| b == 0)?;

        let name = &self.data[..name_end];
        let value = &rest[..val_end];
        self.data = &rest[(val_end + 1)..];
        Some((name, value))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        // A name-value pair always consists of at least 2 bytes
        (0, Some(self.data.len() / 2))
    }
}
impl std::iter::FusedIterator for PairIter<'_> {}


/// Encodes a complete SCGI request into the writer's output.
///
/// The header block is framed as a netstring and followed by the raw body.
/// Callers are responsible for including a `CONTENT_LENGTH` header that
/// matches `body.len()`, as the format demands.
///
/// # Errors
/// Any errors from [`Write::write_all`] are forwarded to the caller.
pub fn write<'a, I>(headers: I, body: &[u8], mut w: impl Write) -> io::Result<usize>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut block = Vec::with_capacity(256);
    for (name, value) in headers {
        block.extend(name);
        block.push(0);
        block.extend(value);
        block.push(0);
    }

    let prefix = format!("{}:", block.len());
    w.write_all(prefix.as_bytes())?;
    w.write_all(&block)?;
    w.write_all(b",")?;
    w.write_all(body)?;
    Ok(prefix.len() + block.len() + 1 + body.len())
}
