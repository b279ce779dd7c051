//! Request framing and response frame parsing
//!
//! A request frame is `len:u32 | header | body`, where the header version
//! (and with it the client-id encoding and tag section) depends on the api
//! key and the negotiated body version. A response frame is
//! `len:u32 | correlation_id:i32 | [tags if flexible header] | body`.
//!
//! ApiVersions (key 18) is irregular: its response header is never
//! flexible even when the body is, so clients can parse the v0 fallback
//! before version negotiation has happened. That choice is made where the
//! response is enqueued, not here; this module just honors the
//! `flexible_header` bit it is handed.

use bytes::{Buf, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};

use crate::error::{KaflinkError, ProtocolError, ReadSizeError, Result};
use crate::protocol::request::AnyRequest;

/// Serialize one request frame into `buf`, returning the frame length in
/// bytes. The caller owns correlation-id assignment; this function only
/// writes what it is told.
pub(crate) fn append_request(
    buf: &mut BytesMut,
    req: &dyn AnyRequest,
    version: i16,
    corr_id: i32,
    client_id: Option<&str>,
) -> Result<usize> {
    let api_key = ApiKey::try_from(req.api_key())
        .map_err(|_| KaflinkError::UnknownRequestKey(req.api_key()))?;
    let header_version = api_key.request_header_version(version);

    let header = RequestHeader::default()
        .with_request_api_key(req.api_key())
        .with_request_api_version(version)
        .with_correlation_id(corr_id)
        .with_client_id(client_id.map(|id| StrBytes::from_string(id.to_string())));

    let start = buf.len();
    buf.extend_from_slice(&[0, 0, 0, 0]);
    header
        .encode(buf, header_version)
        .map_err(|e| KaflinkError::protocol("encode request header", e.to_string()))?;
    req.encode(buf, version)?;

    let frame_len = (buf.len() - start - 4) as i32;
    buf[start..start + 4].copy_from_slice(&frame_len.to_be_bytes());
    Ok(buf.len() - start)
}

/// Whether the response header for `api_key` at `version` carries a tag
/// block. ApiVersions always answers no here, even for flexible bodies.
pub(crate) fn response_header_is_flexible(api_key: i16, version: i16) -> bool {
    ApiKey::try_from(api_key)
        .map(|key| key.response_header_version(version) >= 1)
        .unwrap_or(false)
}

/// Decode a response length prefix, enforcing the configured ceiling.
///
/// Oversized prefixes are inspected for the two classic misconfigurations:
/// the bytes spelling `HTTP` (the broker port is actually an HTTP
/// listener) and a TLS alert record (the endpoint expects TLS on this
/// port).
pub(crate) fn parse_read_size(size_bytes: [u8; 4], max_size: i32) -> Result<i32> {
    let size = i32::from_be_bytes(size_bytes);
    if size < 0 {
        return Err(ReadSizeError::Negative(size).into());
    }
    if size > max_size {
        if size == 0x4854_5450 {
            return Err(ReadSizeError::LooksLikeHttp { size, limit: max_size }.into());
        }
        // A TLS alert is content type 21 followed by the record version,
        // 0x0300 (SSLv3) through 0x0304 (TLS 1.3).
        let tls_version = u16::from_be_bytes([size_bytes[1], size_bytes[2]]);
        if size_bytes[0] == 21 && (0x0300..=0x0304).contains(&tls_version) {
            let version = match tls_version {
                0x0300 => "SSL v3",
                0x0301 => "TLS v1.0",
                0x0302 => "TLS v1.1",
                0x0303 => "TLS v1.2",
                0x0304 => "TLS v1.3",
                _ => unreachable!(),
            };
            return Err(ReadSizeError::LooksLikeTls { size, limit: max_size, version }.into());
        }
        return Err(ReadSizeError::TooLarge { size, limit: max_size }.into());
    }
    Ok(size)
}

/// Verify the correlation id at the front of a response payload and strip
/// the response header, including the tag block when the header is
/// flexible. Returns the remaining body bytes.
pub(crate) fn strip_response_header(
    payload: Bytes,
    expected_corr_id: i32,
    flexible_header: bool,
) -> Result<Bytes> {
    if payload.len() < 4 {
        return Err(ProtocolError::ShortResponse(payload.len()).into());
    }
    let got = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if got != expected_corr_id {
        return Err(KaflinkError::CorrelationIdMismatch {
            expected: expected_corr_id,
            got,
        });
    }

    let mut body = payload;
    if flexible_header {
        ResponseHeader::decode(&mut body, 1)
            .map_err(|e| KaflinkError::protocol("decode response header", e.to_string()))?;
    } else {
        body.advance(4);
    }
    Ok(body)
}
