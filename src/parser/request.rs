use std::collections::HashMap;
use std::ops::ControlFlow::{self, Break, Continue};

use compact_str::CompactString;

use super::{Error, Request, SmallBytes};
use crate::protocol;


type Headers = HashMap<CompactString, SmallBytes>;

/// Lossily converts raw bytes into an uppercased CGI/1.1 variable name.
///
/// Valid CGI/1.1 variable names are ASCII-only, but we support invalid
/// ones as much as possible by replacing non-UTF-8 codepoints.
#[must_use]
fn make_cgivar(name: &[u8]) -> CompactString {
    let mut conv = CompactString::from_utf8_lossy(name);
    conv.as_mut_str().make_ascii_uppercase();
    conv
}


#[derive(Debug, Clone)]
enum State {
    /// Scanning the decimal netstring length prefix.
    ReadingLen,
    /// Waiting for the complete header block plus its `,` terminator.
    ReadingHead { hbeg: usize, hlen: usize },
    /// Waiting for `blen` body bytes following the terminator.
    ReadingBody { bbeg: usize, blen: usize, headers: Headers },
    Done(Request),
    Failed(Error),
}

impl State {
    /// Advances the state as far as the buffered bytes permit.
    ///
    /// A single call may traverse multiple states: a small request arriving
    /// in one read goes from `ReadingLen` to `Done` in one pass.
    fn drive(mut self, buffer: &[u8]) -> Self {
        loop {
            self = match self.step(buffer) {
                Continue(next) => next,
                Break(stalled) => return stalled,
            };
        }
    }

    fn step(self, buffer: &[u8]) -> ControlFlow<Self, Self> {
        match self {
            Self::ReadingLen => match protocol::parse_length(buffer) {
                Ok(Some((hlen, hbeg))) => Continue(Self::ReadingHead { hbeg, hlen }),
                Ok(None) => Break(Self::ReadingLen),
                Err(e) => Break(Self::Failed(e.into())),
            },

            Self::ReadingHead { hbeg, hlen } => {
                // The comma terminating the netstring is parsed together
                // with the header block.
                let Some(&term) = buffer.get(hbeg + hlen) else {
                    return Break(Self::ReadingHead { hbeg, hlen });
                };
                if term != b',' {
                    return Break(Self::Failed(protocol::Error::BadTerminator(term).into()));
                }

                let mut pairs = protocol::PairIter::new(&buffer[hbeg..(hbeg + hlen)]);
                let mut headers = Headers::with_capacity(40);
                headers.extend((&mut pairs).map(
                    |(n, v)| (make_cgivar(n), SmallBytes::from_slice(v)),
                ));
                if let bytes @ 1.. = pairs.into_inner().len() {
                    tracing::warn!(bytes, "header block ends with incomplete name-value pair");
                }

                let blen = match content_length(&headers) {
                    Ok(len) => len,
                    Err(e) => return Break(Self::Failed(e)),
                };
                Continue(Self::ReadingBody { bbeg: hbeg + hlen + 1, blen, headers })
            },

            Self::ReadingBody { bbeg, blen, headers } => {
                if buffer.len() < bbeg + blen {
                    return Break(Self::ReadingBody { bbeg, blen, headers });
                }
                let body = buffer[bbeg..(bbeg + blen)].to_vec();
                Break(Self::Done(Request { headers, body }))
            },

            terminal @ (Self::Done(_) | Self::Failed(_)) => Break(terminal),
        }
    }
}

fn content_length(headers: &Headers) -> Result<usize, Error> {
    let raw = headers.get(crate::cgi::CONTENT_LENGTH).ok_or(Error::MissingContentLength)?;
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::BadContentLength)
}


/// A parser which extracts an SCGI [`Request`] from a caller-provided
/// byte stream.
///
/// The caller appends newly-read bytes via `Parser::advance` until it
/// reports completion, then consumes the parser with
/// `Parser::into_request`. The parser accumulates the whole request; SCGI
/// carries exactly one request per connection, so the buffer is released
/// together with the parser at dispatch.
#[derive(Debug, Clone)]
#[must_use = "Parser must be invoked to consume input"]
pub struct Parser {
    buffer: Vec<u8>,
    state: State,
}

impl Parser {
    /// Creates a new [`Parser`] in its initial state.
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(1024), state: State::ReadingLen }
    }

    /// Appends freshly-read bytes and advances the parser.
    ///
    /// Returns `Ok(true)` once a complete request has been parsed. Calling
    /// `advance` again on a finished parser is a no-op.
    ///
    /// # Errors
    /// Returns an [`Error`] if the byte stream violates the SCGI framing.
    /// The error is terminal: the connection should be closed without a
    /// response.
    pub fn advance(&mut self, data: &[u8]) -> Result<bool, Error> {
        self.buffer.extend_from_slice(data);
        replace_with::replace_with(
            &mut self.state,
            || State::Failed(Error::Paniced),
            |s| s.drive(&self.buffer),
        );

        match &self.state {
            State::Done(_) => Ok(true),
            State::Failed(e) => Err(e.clone()),
            _ => Ok(false),
        }
    }

    /// Consumes the [`Parser`] to extract the parsed [`Request`].
    ///
    /// # Errors
    /// Returns the terminal [`Error`] if parsing failed, or
    /// [`Error::Interrupted`] if called before `Parser::advance` reported
    /// completion.
    pub fn into_request(self) -> Result<Request, Error> {
        match self.state {
            State::Done(r) => Ok(r),
            State::Failed(e) => Err(e),
            _ => Err(Error::Interrupted),
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
