//! Minimal HTTP/3 client plumbing over quinn.
//!
//! Only what one extended-CONNECT session needs: QUIC varints, the control
//! stream SETTINGS exchange, QPACK field sections restricted to the static
//! table, and frame reading on the request stream. A dynamic table is never
//! negotiated in either direction, which keeps the encoder literal-only and
//! the decoder free of encoder-stream state. The vendor settings this edge
//! requires cannot be expressed through a stock HTTP/3 client, hence this
//! layer.

use std::io::{self, ErrorKind};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quinn::RecvStream;

use crate::transport::masque::tunnel::map_connection_error;

pub(crate) const STREAM_TYPE_CONTROL: u64 = 0x00;
pub(crate) const STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
pub(crate) const STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

pub(crate) const FRAME_DATA: u64 = 0x00;
pub(crate) const FRAME_HEADERS: u64 = 0x01;
pub(crate) const FRAME_SETTINGS: u64 = 0x04;

pub(crate) const SETTING_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub(crate) const SETTING_QPACK_BLOCKED_STREAMS: u64 = 0x07;
pub(crate) const SETTING_ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
pub(crate) const SETTING_H3_DATAGRAM: u64 = 0x33;

const MAX_FRAME_PAYLOAD: u64 = 65536;

pub(crate) fn put_varint(buf: &mut BytesMut, value: u64) {
    if value < 1 << 6 {
        buf.put_u8(value as u8);
    } else if value < 1 << 14 {
        buf.put_u16(value as u16 | 0x4000);
    } else if value < 1 << 30 {
        buf.put_u32(value as u32 | 0x8000_0000);
    } else {
        buf.put_u64(value | 0xc000_0000_0000_0000);
    }
}

pub(crate) fn get_varint(buf: &mut Bytes) -> io::Result<u64> {
    if buf.is_empty() {
        return Err(truncated());
    }
    let first = buf[0];
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return Err(truncated());
    }
    buf.advance(1);
    let mut value = (first & 0x3f) as u64;
    for _ in 1..len {
        value = (value << 8) | buf.get_u8() as u64;
    }
    Ok(value)
}

pub(crate) async fn read_varint(stream: &mut RecvStream) -> io::Result<u64> {
    let mut first = [0u8; 1];
    read_exact(stream, &mut first).await?;
    let len = 1usize << (first[0] >> 6);
    let mut rest = [0u8; 7];
    let rest = &mut rest[..len - 1];
    read_exact(stream, rest).await?;
    let mut value = (first[0] & 0x3f) as u64;
    for byte in rest.iter() {
        value = (value << 8) | *byte as u64;
    }
    Ok(value)
}

pub(crate) async fn read_frame(stream: &mut RecvStream) -> io::Result<(u64, Bytes)> {
    let kind = read_varint(stream).await?;
    let len = read_varint(stream).await?;
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("oversized http/3 frame ({} bytes)", len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    read_exact(stream, &mut payload).await?;
    Ok((kind, Bytes::from(payload)))
}

async fn read_exact(stream: &mut RecvStream, buf: &mut [u8]) -> io::Result<()> {
    match stream.read_exact(buf).await {
        Ok(()) => Ok(()),
        Err(quinn::ReadExactError::FinishedEarly(_)) => Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "http/3 stream ended early",
        )),
        Err(quinn::ReadExactError::ReadError(err)) => Err(map_read_error(err)),
    }
}

fn map_read_error(err: quinn::ReadError) -> io::Error {
    match err {
        quinn::ReadError::ConnectionLost(err) => map_connection_error(err),
        other => io::Error::new(ErrorKind::BrokenPipe, other.to_string()),
    }
}

fn truncated() -> io::Error {
    io::Error::new(ErrorKind::UnexpectedEof, "truncated http/3 payload")
}

pub(crate) fn settings_frame(settings: &[(u64, u64)]) -> Bytes {
    let mut payload = BytesMut::new();
    for (id, value) in settings {
        put_varint(&mut payload, *id);
        put_varint(&mut payload, *value);
    }
    let mut frame = BytesMut::new();
    put_varint(&mut frame, FRAME_SETTINGS);
    put_varint(&mut frame, payload.len() as u64);
    frame.extend_from_slice(&payload);
    frame.freeze()
}

pub(crate) fn headers_frame(fields: &[(&str, &str)]) -> Bytes {
    let section = encode_field_section(fields);
    let mut frame = BytesMut::new();
    put_varint(&mut frame, FRAME_HEADERS);
    put_varint(&mut frame, section.len() as u64);
    frame.extend_from_slice(&section);
    frame.freeze()
}

/// Literal-only encoding: valid against any decoder and requires no insert
/// count bookkeeping. Pseudo-header ordering is the caller's concern.
pub(crate) fn encode_field_section(fields: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::new();
    // Required insert count 0, delta base 0: no dynamic table.
    buf.put_u8(0);
    buf.put_u8(0);
    for (name, value) in fields {
        put_prefix_int(&mut buf, 0b0010_0000, 3, name.len() as u64);
        buf.extend_from_slice(name.as_bytes());
        put_prefix_int(&mut buf, 0, 7, value.len() as u64);
        buf.extend_from_slice(value.as_bytes());
    }
    buf.freeze()
}

/// Decodes a response field section. Static-table references and raw
/// literals are understood; Huffman-coded literals are skipped, which is
/// sound because every field this client inspects (the status) arrives as an
/// exact static-table match.
pub(crate) fn decode_field_section(mut buf: Bytes) -> io::Result<Vec<(String, String)>> {
    let (_, required_insert_count) = get_prefix_int(&mut buf, 8)?;
    if required_insert_count != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "peer requires a qpack dynamic table",
        ));
    }
    let (_, _delta_base) = get_prefix_int(&mut buf, 7)?;

    let mut fields = Vec::new();
    while !buf.is_empty() {
        let first = buf[0];
        if first & 0x80 != 0 {
            // Indexed field line.
            if first & 0x40 == 0 {
                return Err(dynamic_table_reference());
            }
            let (_, index) = get_prefix_int(&mut buf, 6)?;
            let (name, value) = static_entry(index)?;
            fields.push((name.to_string(), value.to_string()));
        } else if first & 0x40 != 0 {
            // Literal field line with name reference.
            if first & 0x10 == 0 {
                return Err(dynamic_table_reference());
            }
            let (_, index) = get_prefix_int(&mut buf, 4)?;
            let (name, _) = static_entry(index)?;
            if let Some(value) = get_string(&mut buf, 7)? {
                fields.push((name.to_string(), value));
            }
        } else if first & 0x20 != 0 {
            // Literal field line with literal name.
            let name = get_string(&mut buf, 3)?;
            let value = get_string(&mut buf, 7)?;
            if let (Some(name), Some(value)) = (name, value) {
                fields.push((name, value));
            }
        } else {
            return Err(dynamic_table_reference());
        }
    }
    Ok(fields)
}

fn dynamic_table_reference() -> io::Error {
    io::Error::new(
        ErrorKind::InvalidData,
        "qpack field line references a dynamic table",
    )
}

fn put_prefix_int(buf: &mut BytesMut, flags: u8, prefix: u32, value: u64) {
    let max = (1u64 << prefix) - 1;
    if value < max {
        buf.put_u8(flags | value as u8);
    } else {
        buf.put_u8(flags | max as u8);
        let mut rest = value - max;
        while rest >= 128 {
            buf.put_u8((rest % 128) as u8 | 0x80);
            rest /= 128;
        }
        buf.put_u8(rest as u8);
    }
}

fn get_prefix_int(buf: &mut Bytes, prefix: u32) -> io::Result<(u8, u64)> {
    if buf.is_empty() {
        return Err(truncated());
    }
    let first = buf.get_u8();
    let max = (1u64 << prefix) - 1;
    let mut value = first as u64 & max;
    if value == max {
        let mut shift = 0u32;
        loop {
            if buf.is_empty() {
                return Err(truncated());
            }
            let byte = buf.get_u8();
            value += ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 56 {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "qpack prefix integer overflow",
                ));
            }
        }
    }
    Ok((first, value))
}

/// Returns `None` for Huffman-coded strings; the bytes are still consumed so
/// decoding can continue past fields nobody inspects.
fn get_string(buf: &mut Bytes, prefix: u32) -> io::Result<Option<String>> {
    let (first, len) = get_prefix_int(buf, prefix)?;
    if len as usize > buf.len() {
        return Err(truncated());
    }
    let raw = buf.split_to(len as usize);
    if first & (1u8 << prefix) != 0 {
        return Ok(None);
    }
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "field line is not valid utf-8"))
}

fn static_entry(index: u64) -> io::Result<(&'static str, &'static str)> {
    STATIC_TABLE.get(index as usize).copied().ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("qpack static index {} out of range", index),
        )
    })
}

// RFC 9204 Appendix A.
const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, u64::MAX >> 2] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(get_varint(&mut bytes).unwrap(), value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn varint_rejects_truncation() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 16384);
        let mut short = buf.freeze().slice(..2);
        assert!(get_varint(&mut short).is_err());
    }

    #[test]
    fn settings_frame_carries_the_vendor_switch() {
        let frame = settings_frame(&[(0x276, 1)]);
        assert_eq!(frame.as_ref(), &[0x04, 0x03, 0x42, 0x76, 0x01]);
    }

    #[test]
    fn prefix_int_matches_the_rfc_example() {
        // 1337 on a 5-bit prefix.
        let mut buf = BytesMut::new();
        put_prefix_int(&mut buf, 0, 5, 1337);
        assert_eq!(buf.as_ref(), &[0x1f, 0x9a, 0x0a]);
        let mut bytes = buf.freeze();
        assert_eq!(get_prefix_int(&mut bytes, 5).unwrap().1, 1337);
    }

    #[test]
    fn field_section_roundtrip() {
        let fields = [
            (":method", "CONNECT"),
            (":protocol", "cf-connect-ip"),
            ("user-agent", ""),
        ];
        let section = encode_field_section(&fields);
        let decoded = decode_field_section(section).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], (":method".to_string(), "CONNECT".to_string()));
        assert_eq!(decoded[2], ("user-agent".to_string(), String::new()));
    }

    #[test]
    fn decodes_an_indexed_status_line() {
        // 0x80 | 0x40 | 25: static table entry 25, ":status: 200".
        let decoded = decode_field_section(Bytes::from_static(&[0, 0, 0xd9])).unwrap();
        assert_eq!(decoded, vec![(":status".to_string(), "200".to_string())]);
    }

    #[test]
    fn skips_huffman_coded_literals() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0);
        // Literal with name reference to :status (static 24), Huffman value.
        put_prefix_int(&mut buf, 0b0101_0000, 4, 24);
        put_prefix_int(&mut buf, 0x80, 7, 2);
        buf.extend_from_slice(&[0xaa, 0xbb]);
        // Followed by a raw indexed line that must still decode.
        buf.put_u8(0xd9);
        let decoded = decode_field_section(buf.freeze()).unwrap();
        assert_eq!(decoded, vec![(":status".to_string(), "200".to_string())]);
    }

    #[test]
    fn rejects_dynamic_table_references() {
        // Indexed field line with T=0.
        assert!(decode_field_section(Bytes::from_static(&[0, 0, 0x80])).is_err());
        // Non-zero required insert count.
        assert!(decode_field_section(Bytes::from_static(&[5, 0, 0xd9])).is_err());
    }
}
