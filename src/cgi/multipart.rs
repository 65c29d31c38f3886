//! A boundary-delimited `multipart/form-data` body parser.
//!
//! The parser is an iterator carving [`Part`]s out of the request body.
//! Header parsing is deliberately minimal: only `Content-Disposition`'s
//! `name`/`filename` tokens and the part's `Content-Type` are extracted,
//! which is what form submissions carry.

/// A single decoded multipart field.
#[derive(Debug, PartialEq, Eq)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// The body ended before the closing boundary of the current part.
#[derive(Debug, Clone, thiserror::Error)]
#[error("multipart body ends before the closing boundary")]
pub struct Truncated;


/// An iterator over the parts of a `multipart/form-data` body.
#[derive(Debug, Clone)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Multipart<'a> {
    body: &'a [u8],
    marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    /// Creates a parser over `body` using the unprefixed `boundary` token
    /// from the `Content-Type` header.
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend(b"--");
        marker.extend(boundary.as_bytes());
        Self { body, marker }
    }
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len()).position(|w| w == needle)
}

/// Extracts a quoted token like `name="value"` from a header line.
///
/// `lower` must be the ASCII-lowercased copy of `line`; indices found in
/// it are valid in `line`, which keeps the original value casing.
fn quoted<'a>(line: &'a str, lower: &str, key: &str) -> Option<&'a str> {
    let idx = lower.find(key)?;
    line[(idx + key.len())..].split('"').next()
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, Truncated>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let mut start = find(self.body, &self.marker)? + self.marker.len();
        if self.body.get(start..(start + 2)) == Some(b"--".as_slice()) {
            // Closing boundary
            self.body = &[];
            return None;
        }
        if self.body.get(start..(start + 2)) == Some(b"\r\n".as_slice()) {
            start += 2;
        }

        let head_end = find(&self.body[start..], b"\r\n\r\n")?;
        let head = &self.body[start..(start + head_end)];
        let body_start = start + head_end + 4;

        let Some(pos) = find(&self.body[body_start..], &self.marker) else {
            self.body = &[];
            return Some(Err(Truncated));
        };
        let mut body_end = body_start + pos;
        // The part body ends with a CRLF that belongs to the boundary line
        if self.body.get((body_end - 2)..body_end) == Some(b"\r\n".as_slice()) {
            body_end -= 2;
        }

        let part_body = &self.body[body_start..body_end];
        self.body = &self.body[(body_start + pos)..];

        let mut part = Part { name: None, filename: None, content_type: None, body: part_body };
        for line in head.split(|&b| b == b'\n') {
            let Ok(line) = std::str::from_utf8(line) else { continue };
            let line = line.trim_end_matches('\r');
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                part.filename = quoted(line, &lower, "filename=\"");
                // Search for the name before any filename token, since
                // `name="` is a substring of `filename="`
                let end = lower.find("filename=\"").unwrap_or(line.len());
                part.name = quoted(&line[..end], &lower[..end], "name=\"");
            } else if let Some(value) = lower.strip_prefix("content-type:") {
                let start = line.len() - value.len();
                part.content_type = Some(line[start..].trim());
            }
        }
        Some(Ok(part))
    }
}
