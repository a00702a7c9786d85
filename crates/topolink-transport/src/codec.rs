use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io::{Read, Write};
use topolink_core::TopologyError;

pub const GZIP: &str = "gzip";

/// Everything but RFC 3986 unreserved characters is escaped in a selector.
const SELECTOR: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Escapes an instance id for use in the `<prefix>.<id>.json` path segment.
pub fn encode_selector(instance_id: &str) -> String {
    utf8_percent_encode(instance_id, SELECTOR).to_string()
}

/// Inverse of [`encode_selector`]. Ids that are empty, not utf-8 or that
/// contain `/` once decoded are refused.
pub fn decode_selector(raw: &str) -> Option<String> {
    let id = percent_decode_str(raw).decode_utf8().ok()?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id.into_owned())
}

/// How a body travelled on the wire, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Plaintext,
    Gzip,
}

impl BodyEncoding {
    pub fn from_header(content_encoding: Option<&str>) -> Self {
        match content_encoding {
            Some(value) if value.trim().eq_ignore_ascii_case(GZIP) => BodyEncoding::Gzip,
            _ => BodyEncoding::Plaintext,
        }
    }
}

pub fn gzip(body: &[u8]) -> Result<Vec<u8>, TopologyError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

/// Decompresses at most `limit` bytes. A body that inflates past the limit
/// is rejected rather than truncated.
pub fn gunzip_bounded(body: &[u8], limit: usize) -> Result<Vec<u8>, TopologyError> {
    let mut out = Vec::new();
    GzDecoder::new(body)
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| TopologyError::Protocol(format!("invalid gzip body: {}", e)))?;
    if out.len() > limit {
        return Err(TopologyError::PayloadTooLarge { limit });
    }
    Ok(out)
}

/// Undoes the content encoding of a received body.
pub fn decode_body(body: &[u8], encoding: BodyEncoding, limit: usize) -> Result<Vec<u8>, TopologyError> {
    match encoding {
        BodyEncoding::Gzip => gunzip_bounded(body, limit),
        BodyEncoding::Plaintext if body.len() > limit => Err(TopologyError::PayloadTooLarge { limit }),
        BodyEncoding::Plaintext => Ok(body.to_vec()),
    }
}

/// True if an `Accept-Encoding` value lists gzip with a non-zero q-value.
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    let Some(value) = accept_encoding else {
        return false;
    };
    value.split(',').any(|part| {
        let mut pieces = part.split(';');
        let coding = pieces.next().unwrap_or("").trim();
        if !coding.eq_ignore_ascii_case(GZIP) {
            return false;
        }
        !pieces.any(|p| {
            let p = p.trim();
            p.strip_prefix("q=")
                .map_or(false, |q| q.trim().parse::<f32>().map_or(false, |q| q <= 0.0))
        })
    })
}
