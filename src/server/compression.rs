// Response compression with cost/ratio gating.
//
// Sits after body generation: picks the first encoding the client accepts
// from the per-content-type registry, compresses the buffered body, and
// keeps the original unless the compressed form is meaningfully smaller
// (ratio > ~1.11). Small responses are never compressed. Timing and ratio
// are reported through Server-Timing.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::Result;

const RATIO_THRESHOLD: f64 = 1.0 / 0.9;

pub const GZIP: &str = "gzip";
pub const ZSTD: &str = "zstd";
pub const LZ4: &str = "lz4";

pub struct CompressionSettings {
    /// content type -> encodings, in server preference order.
    registry: HashMap<String, Vec<String>>,
    pub minimum_size: usize,
}

impl CompressionSettings {
    pub fn new(minimum_size: usize) -> Self {
        let mut registry = HashMap::new();
        for content_type in [
            "application/json",
            "application/x-msgpack",
            "text/csv",
        ] {
            registry.insert(
                content_type.to_string(),
                vec![ZSTD.to_string(), GZIP.to_string()],
            );
        }
        registry.insert(
            "application/octet-stream".to_string(),
            vec![ZSTD.to_string(), LZ4.to_string(), GZIP.to_string()],
        );
        Self {
            registry,
            minimum_size,
        }
    }

    /// First registered encoding for this content type that the client
    /// accepts.
    pub fn pick_encoding(&self, content_type: &str, accept_encoding: &str) -> Option<&str> {
        // Strip MIME arguments, as in 'text/plain; charset=utf-8'.
        let content_type = content_type.split(';').next().unwrap_or("").trim();
        let accepted: Vec<&str> = accept_encoding
            .split(',')
            .map(|item| item.trim().split(';').next().unwrap_or("").trim())
            .filter(|item| !item.is_empty())
            .collect();
        let encodings = self.registry.get(content_type)?;
        encodings
            .iter()
            .find(|encoding| accepted.contains(&encoding.as_str()))
            .map(|encoding| encoding.as_str())
    }
}

pub fn compress(encoding: &str, data: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        GZIP => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(anyhow::Error::from)?;
            Ok(encoder.finish().map_err(anyhow::Error::from)?)
        }
        ZSTD => Ok(zstd::stream::encode_all(data, 0).map_err(anyhow::Error::from)?),
        LZ4 => Ok(lz4::block::compress(data, None, true).map_err(anyhow::Error::from)?),
        other => Err(crate::errors::TreeError::Internal(anyhow::anyhow!(
            "unknown encoding {other:?}"
        ))),
    }
}

pub async fn compression_middleware(
    State(settings): State<Arc<CompressionSettings>>,
    request: Request,
    next: Next,
) -> Response {
    let accept_encoding = request
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let response = next.run(request).await;
    if accept_encoding.is_empty() || !response.status().is_success() {
        return response;
    }
    let Some(content_type) = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
    else {
        return response;
    };
    let Some(encoding) = settings
        .pick_encoding(&content_type, &accept_encoding)
        .map(|encoding| encoding.to_string())
    else {
        return response;
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };
    if bytes.len() < settings.minimum_size {
        return Response::from_parts(parts, Body::from(bytes));
    }
    let start = Instant::now();
    let compressed = match compress(&encoding, &bytes) {
        Ok(compressed) => compressed,
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };
    let elapsed = start.elapsed().as_secs_f64();
    let ratio = bytes.len() as f64 / compressed.len() as f64;
    if ratio <= RATIO_THRESHOLD {
        // The savings is not worth the client's decompression time.
        return Response::from_parts(parts, Body::from(bytes));
    }
    parts.headers.insert(
        header::CONTENT_ENCODING,
        encoding.parse().unwrap_or(header::HeaderValue::from_static("identity")),
    );
    parts
        .headers
        .append(header::VARY, header::HeaderValue::from_static("Accept-Encoding"));
    parts.headers.remove(header::CONTENT_LENGTH);
    if let Ok(value) =
        format!("compress;dur={:.1};ratio={ratio:.1}", elapsed * 1000.0).parse()
    {
        parts.headers.insert("server-timing", value);
    }
    Response::from_parts(parts, Body::from(compressed))
}
