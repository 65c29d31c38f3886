//! CGI/1.1 helpers: well-known variable names, header-name casing, URL
//! encoding, and request parameter extraction.

use crate::parser::Request;

pub mod multipart;
pub mod response;


/// Well-known CGI/1.1 variable names consumed by the server.
///
/// Variable names are normalized to uppercase by the parser, so lookups
/// against these constants are exact.
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const HTTP_CONTENT_TYPE: &str = "HTTP_CONTENT_TYPE";
pub const DOCUMENT_ROOT: &str = "DOCUMENT_ROOT";
pub const DOCUMENT_URI: &str = "DOCUMENT_URI";
pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
pub const PATH_INFO: &str = "PATH_INFO";

/// The form media type whose body extends the query-string parameters.
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
/// The media type prefix handled by the [`multipart`] parser.
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";


/// Title-cases a response header name: first character uppercased, the
/// rest lowercased, surrounding whitespace trimmed.
///
/// This matches the header normalization of the CGI responses this server
/// produces (`Content-type`, `Status`, `Location`).
#[must_use]
pub fn title_case(name: &str) -> String {
    let name = name.trim();
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
        out.extend(chars.flat_map(char::to_lowercase));
    }
    out
}


/// Decodes a URL-encoded token into raw bytes.
///
/// `+` becomes a space and `%XX` becomes the byte it names. A `%` not
/// followed by two hex digits is passed through literally.
#[must_use]
pub fn url_decode_bytes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = input.get((i + 1)..(i + 3)).and_then(|p| {
                    let hi = (p[0] as char).to_digit(16)?;
                    let lo = (p[1] as char).to_digit(16)?;
                    Some((hi * 16 + lo) as u8)
                });
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    },
                    None => out.push(b'%'),
                }
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    out
}

/// Decodes a URL-encoded token, interpreting the resulting bytes as UTF-8.
#[must_use]
pub fn url_decode(input: &str) -> String {
    String::from_utf8_lossy(&url_decode_bytes(input.as_bytes())).into_owned()
}

/// Encodes raw bytes for use in a URL-encoded token: alphanumerics pass
/// through, a space becomes `+`, everything else becomes `%XX`.
#[must_use]
pub fn url_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        match byte {
            b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z' => out.push(byte as char),
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(char::from_digit(u32::from(byte >> 4), 16)
                    .map_or('0', |c| c.to_ascii_uppercase()));
                out.push(char::from_digit(u32::from(byte & 0xf), 16)
                    .map_or('0', |c| c.to_ascii_uppercase()));
            },
        }
    }
    out
}


/// Splits a query-string-shaped input on any of `&`, `=` and space.
fn split_tokens(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(['&', '=', ' '])
}

/// Pairs decoded tokens into name-value parameters.
///
/// Tokens pair up in order; a trailing name without a value receives an
/// empty one.
fn pair_tokens<I: Iterator<Item = String>>(mut tokens: I, out: &mut Vec<(String, String)>) {
    while let Some(name) = tokens.next() {
        let value = tokens.next().unwrap_or_default();
        out.push((name, value));
    }
}

/// Extracts the request parameters from the query string, extended by the
/// body for `application/x-www-form-urlencoded` requests.
///
/// Each token is URL-decoded individually, then consecutive tokens pair up
/// as name-value entries. Multipart bodies are not handled here; see
/// [`multipart`].
#[must_use]
pub fn request_params(request: &Request) -> Vec<(String, String)> {
    let query = request
        .get_var(QUERY_STRING)
        .map(|raw| String::from_utf8_lossy(raw).into_owned())
        .unwrap_or_default();

    let mut raw = query;
    if is_form_request(request) && !request.body().is_empty() {
        if !raw.is_empty() {
            raw.push('&');
        }
        raw.push_str(&String::from_utf8_lossy(request.body()));
    }

    let mut params = Vec::new();
    if !raw.is_empty() {
        pair_tokens(split_tokens(&raw).map(url_decode), &mut params);
    }
    params
}

/// Tests whether the request body is an URL-encoded form.
#[must_use]
pub fn is_form_request(request: &Request) -> bool {
    request.get_var(HTTP_CONTENT_TYPE) == Some(FORM_URLENCODED.as_bytes())
}

/// Returns the multipart boundary if the request is `multipart/form-data`.
#[must_use]
pub fn multipart_boundary(request: &Request) -> Option<&str> {
    let ctype = request.get_var_str(HTTP_CONTENT_TYPE)?;
    if !ctype.starts_with(MULTIPART_FORM_DATA) {
        return None;
    }
    let (_, boundary) = ctype.split_once("boundary=")?;
    let boundary = boundary.split(';').next().unwrap_or(boundary).trim();
    let boundary = boundary.trim_matches('"');
    (!boundary.is_empty()).then_some(boundary)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_casing() {
        assert_eq!(title_case("content-type"), "Content-type");
        assert_eq!(title_case("LOCATION"), "Location");
        assert_eq!(title_case("  x-powered-by "), "X-powered-by");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn decode_spec() {
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("%41%6f"), "Ao");
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%2"), "%2");
        assert_eq!(url_decode("%zz"), "%zz");
        assert_eq!(url_decode("caf%C3%A9"), "café");
    }

    #[test]
    fn encode_spec() {
        assert_eq!(url_encode(b"abc XYZ 09"), "abc+XYZ+09");
        assert_eq!(url_encode(b"a/b?c"), "a%2Fb%3Fc");
        assert_eq!(url_encode(b"\x00\xff"), "%00%FF");
    }

    #[test]
    fn codec_roundtrip() {
        // Every byte value must survive an encode-decode cycle
        let all: Vec<u8> = (0..=u8::MAX).collect();
        assert_eq!(url_decode_bytes(url_encode(&all).as_bytes()), all);

        for _ in 0..20 {
            let len = fastrand::usize(1..200);
            let raw: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..)).take(len).collect();
            assert_eq!(url_decode_bytes(url_encode(&raw).as_bytes()), raw);
        }
    }

    #[test]
    fn token_pairing() {
        let mut params = Vec::new();
        pair_tokens(split_tokens("a=1&b=2").map(url_decode), &mut params);
        assert_eq!(params, [
            ("a".to_owned(), "1".to_owned()),
            ("b".to_owned(), "2".to_owned()),
        ]);

        params.clear();
        pair_tokens(split_tokens("key only").map(url_decode), &mut params);
        assert_eq!(params, [("key".to_owned(), "only".to_owned())]);

        params.clear();
        pair_tokens(split_tokens("odd=1&trailer").map(url_decode), &mut params);
        assert_eq!(params, [
            ("odd".to_owned(), "1".to_owned()),
            ("trailer".to_owned(), String::new()),
        ]);
    }

    #[test]
    fn boundary_extraction() {
        use crate::parser::request::Parser;
        use crate::protocol;

        let build = |ctype: &str| {
            let pairs: [(&[u8], &[u8]); 2] =
                [(b"CONTENT_LENGTH", b"0"), (b"HTTP_CONTENT_TYPE", ctype.as_bytes())];
            let mut buf = Vec::new();
            protocol::write(pairs.iter().copied(), b"", &mut buf).expect("write to Vec");
            let mut parser = Parser::new();
            assert!(parser.advance(&buf).expect("valid request"));
            parser.into_request().expect("complete request")
        };

        let req = build("multipart/form-data; boundary=----wk42");
        assert_eq!(multipart_boundary(&req), Some("----wk42"));

        let req = build("multipart/form-data; boundary=\"quoted\"; charset=utf-8");
        assert_eq!(multipart_boundary(&req), Some("quoted"));

        let req = build("application/x-www-form-urlencoded");
        assert_eq!(multipart_boundary(&req), None);
        assert!(is_form_request(&req));
    }
}
