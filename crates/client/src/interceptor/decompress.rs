use super::{DECOMPRESS_PRIORITY, Interceptor, Next};
use crate::{ClientError, ClientRequest, ClientResponse};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::{HeaderValue, header};
use std::io::{self, Read};
use tracing::trace;

const ACCEPT_ENCODING: &str = "gzip, deflate, br, zstd";

/// Advertises the supported content codings and decodes the response body.
///
/// Codings are undone last-applied first. A coding this client does not know
/// leaves the body and the remaining `Content-Encoding` untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecompressInterceptor;

#[async_trait]
impl Interceptor for DecompressInterceptor {
    fn priority(&self) -> i32 {
        DECOMPRESS_PRIORITY
    }

    async fn proceed(&self, mut request: ClientRequest, next: Next<'_>) -> Result<ClientResponse, ClientError> {
        if !request.headers().contains_key(header::ACCEPT_ENCODING) {
            request.headers_mut().insert(header::ACCEPT_ENCODING, HeaderValue::from_static(ACCEPT_ENCODING));
        }
        let response = next.run(request).await?;
        decompress(response)
    }
}

fn decompress(mut response: ClientResponse) -> Result<ClientResponse, ClientError> {
    let Some(encodings) = response.headers().get(header::CONTENT_ENCODING).and_then(|value| value.to_str().ok()) else {
        return Ok(response);
    };
    if response.body().is_empty() {
        return Ok(response);
    }

    let mut codings: Vec<String> =
        encodings.split(',').map(|coding| coding.trim().to_ascii_lowercase()).filter(|coding| !coding.is_empty()).collect();
    let mut body = response.body().clone();
    while let Some(coding) = codings.last() {
        let decoded = match coding.as_str() {
            "identity" => Ok(body.clone()),
            "gzip" | "x-gzip" => read_all(GzDecoder::new(&body[..])),
            "deflate" => read_all(ZlibDecoder::new(&body[..])).or_else(|_e| read_all(DeflateDecoder::new(&body[..]))),
            "br" => read_all(brotli::Decompressor::new(&body[..], 4096)),
            "zstd" => zstd::stream::decode_all(&body[..]).map(Bytes::from),
            _ => break,
        }
        .map_err(|e| ClientError::protocol(format!("can't decode {coding} response body: {e}")))?;
        trace!(coding = %coding, encoded = body.len(), decoded = decoded.len(), "decoded response body");
        body = decoded;
        codings.pop();
    }

    let headers = response.headers_mut();
    if codings.is_empty() {
        headers.remove(header::CONTENT_ENCODING);
    } else {
        let rest = HeaderValue::from_str(&codings.join(", ")).map_err(|_e| ClientError::protocol("invalid content-encoding"))?;
        headers.insert(header::CONTENT_ENCODING, rest);
    }
    headers.remove(header::CONTENT_LENGTH);
    response.set_body(body);
    Ok(response)
}

fn read_all(mut reader: impl Read) -> io::Result<Bytes> {
    let mut decoded = Vec::new();
    reader.read_to_end(&mut decoded)?;
    Ok(Bytes::from(decoded))
}
