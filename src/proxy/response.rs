//! Inbound response transformation
//!
//! Logs every upstream response and, when obfuscation is enabled, decodes
//! the frame back into the original body. Decode failures fall open: the
//! body passes through unmodified rather than aborting the response.

use super::ProxyError;
use crate::obfuscation::{Direction, Obfuscator};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::Response;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tracing::{info, warn};

/// Transform an upstream response into the response returned to the caller
pub(crate) async fn transform(
    response: Response<Incoming>,
    obfuscator: Option<&Obfuscator>,
) -> Result<Response<Full<Bytes>>, ProxyError> {
    info!("upstream response: {}", response.status());

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| ProxyError::Body(e.to_string()))?
        .to_bytes();

    let body = match obfuscator {
        Some(obfuscator) => match obfuscator.decode(Direction::Response, &body) {
            Ok(plain) => Bytes::from(plain),
            Err(e) => {
                warn!("response decode failed, passing body through: {}", e);
                body
            }
        },
        None => body,
    };

    Ok(finish(parts, body))
}

/// Rebuild the response around a fully buffered body, correcting the
/// length headers
pub(crate) fn finish(
    mut parts: http::response::Parts,
    body: Bytes,
) -> Response<Full<Bytes>> {
    parts.headers.remove(TRANSFER_ENCODING);
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    Response::from_parts(parts, Full::new(body))
}
