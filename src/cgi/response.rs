//! The buffered CGI response.
//!
//! Headers and body accumulate in memory until [`Response::flush`]
//! serializes them in one shot: `Status` and `Content-type` defaults are
//! applied, each header is written as `Name: value` on its own line in
//! insertion order, a blank line separates the body, and the whole
//! sequence goes out in a single write. `Content-length` is deliberately
//! never set.

use std::io::Write;

use crate::cgi;


/// Default `Status` applied at flush time.
pub const STATUS_OK: &str = "200";
/// `Status` implied by setting a `Location` header.
pub const STATUS_FOUND: &str = "302 Found";
/// `Status` of a failed template resolution.
pub const STATUS_NOT_FOUND: &str = "404 Not found";
/// `Status` of a failed template execution.
pub const STATUS_SERVER_ERROR: &str = "500 Internal server error";

/// Default `Content-type` applied at flush time.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html;charset=utf-8";


/// A buffered CGI response writing to `W` on flush.
///
/// All mutation is gated on the monotonic `flushed` flag: once the
/// response has been written out, further header or body changes are
/// silently dropped.
#[derive(Debug)]
pub struct Response<W> {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    flushed: bool,
    sink: W,
}

impl<W: Write> Response<W> {
    /// Creates an empty response writing to `sink` on flush.
    pub fn new(sink: W) -> Self {
        Self { headers: Vec::new(), body: Vec::new(), flushed: false, sink }
    }

    /// Whether the response has already been written out.
    #[inline]
    #[must_use]
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Sets a response header.
    ///
    /// The name is whitespace-trimmed and title-cased, the value trimmed.
    /// With `replace` false an existing header of the same name wins.
    /// Setting `Location` implies `Status: 302 Found` unless a `Status`
    /// was already set. Dropped silently after a flush.
    pub fn set_header(&mut self, name: &str, value: &str, replace: bool) {
        if self.flushed {
            tracing::debug!(name, "header after flush dropped");
            return;
        }
        let name = cgi::title_case(name);
        if name.is_empty() {
            return;
        }
        let value = value.trim().to_owned();

        match self.headers.iter_mut().find(|(k, _)| *k == name) {
            Some((_, old)) if replace => *old = value,
            Some(_) => return,
            None => self.headers.push((name.clone(), value)),
        }
        if name == "Location" {
            self.set_header("Status", STATUS_FOUND, false);
        }
    }

    /// Appends data to the response body; dropped silently after a flush.
    pub fn append_body(&mut self, data: &[u8]) {
        if self.flushed {
            tracing::debug!(bytes = data.len(), "body after flush dropped");
            return;
        }
        self.body.extend(data);
    }

    /// Discards accumulated state and responds with the given status and
    /// body instead. Used for resolution and template failures.
    pub fn respond_error(&mut self, status: &str, body: &str) {
        if self.flushed {
            return;
        }
        self.set_header("Status", status, true);
        self.body.clear();
        self.body.extend(body.as_bytes());
        self.flush();
    }

    /// Serializes and writes the complete response.
    ///
    /// Idempotent: the first call writes, later calls do nothing. Missing
    /// `Status` and `Content-type` headers receive their defaults. Write
    /// errors are swallowed (the client is gone) but logged.
    pub fn flush(&mut self) {
        if self.flushed {
            return;
        }
        self.flushed = true;

        if !self.headers.iter().any(|(k, _)| k == "Status") {
            self.headers.insert(0, ("Status".to_owned(), STATUS_OK.to_owned()));
        }
        if !self.headers.iter().any(|(k, _)| k == "Content-type") {
            self.headers.push(("Content-type".to_owned(), DEFAULT_CONTENT_TYPE.to_owned()));
        }

        let mut out = Vec::with_capacity(self.body.len() + 128);
        for (name, value) in &self.headers {
            out.extend(name.as_bytes());
            out.extend(b": ");
            out.extend(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend(&self.body);

        if let Err(e) = self.sink.write_all(&out).and_then(|()| self.sink.flush()) {
            tracing::debug!(error = %e, "response write failed");
        }
    }

    /// Consumes the response, returning the output sink.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.sink
    }
}
