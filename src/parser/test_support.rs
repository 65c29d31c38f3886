use crate::protocol;


pub(super) const HEADERS: &[(&str, &[u8])] = &[
    ("CONTENT_LENGTH", b"27"),
    ("SCGI", b"1"),
    ("REQUEST_METHOD", b"POST"),
    ("QUERY_STRING", b"a=1&b=two"),
    ("DOCUMENT_ROOT", b"/var/www"),
    ("DOCUMENT_URI", b"/hello.tcl"),
    ("HTTP_CONTENT_TYPE", b"application/x-www-form-urlencoded"),
    ("HTTP_X_OPAQUE", b"\x1f\x9a\xdaM\xeb\x82U\xb8\xfe\xf4\xb0\xc7"),
];

/// Encodes the standard header set of [`HEADERS`] plus the given body.
///
/// The `CONTENT_LENGTH` entry of [`HEADERS`] assumes a 27-byte body.
pub(super) fn request_bytes(body: &[u8]) -> Vec<u8> {
    let pairs: Vec<(&[u8], &[u8])> =
        HEADERS.iter().map(|&(n, v)| (n.as_bytes(), v)).collect();
    encode(&pairs, body)
}

/// Encodes arbitrary header pairs and a body into SCGI framing.
pub(super) fn encode(pairs: &[(&[u8], &[u8])], body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    protocol::write(pairs.iter().copied(), body, &mut buf).expect("write to Vec");
    buf
}

/// Frames a raw (possibly malformed) header block as a netstring.
pub(super) fn encode_raw(block: &[u8], body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block.len() + body.len() + 16);
    buf.extend(format!("{}:", block.len()).into_bytes());
    buf.extend(block);
    buf.push(b',');
    buf.extend(body);
    buf
}
