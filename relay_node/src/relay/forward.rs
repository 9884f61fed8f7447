//! Outbound HTTP to hosted backing chains.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Method};
use std::io::{Read, Write};
use std::time::Duration;

use crate::chains::HostedBlockchain;
use crate::error::{Error, Result};
use crate::types::Payload;

// never forwarded as-is
const HOP_HEADERS: &[&str] = &["content-encoding", "content-length", "host", "connection", "transfer-encoding"];

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Codec(format!("gzip: {}", e)))
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::MalformedRelay(format!("gunzip: {}", e)))?;
    Ok(out)
}

fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// HTTP client shared by all relay tasks.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
    timeout: Duration,
    retries: u32,
}

impl Forwarder {
    pub fn new(timeout: Duration, retries: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("building http client: {}", e)))?;
        Ok(Self {
            client,
            timeout,
            retries,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Request body as sent upstream: gzipped payloads arrive base64
    /// encoded and are decompressed first.
    pub fn request_body(payload: &Payload) -> Result<Vec<u8>> {
        if payload.is_gzipped() {
            let compressed = STANDARD
                .decode(payload.data.trim())
                .map_err(|e| Error::MalformedRelay(format!("gzipped payload is not base64: {}", e)))?;
            gunzip(&compressed)
        } else {
            Ok(payload.data.clone().into_bytes())
        }
    }

    fn headers(payload: &Payload) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &payload.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::MalformedRelay(format!("header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::MalformedRelay(format!("header value for {}: {}", name, e)))?;
            headers.insert(name, value);
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(headers)
    }

    /// Sends the payload to `chain` and returns the response body, gzipped
    /// and base64 encoded again when the request was.
    pub async fn forward(&self, chain: &HostedBlockchain, payload: &Payload) -> Result<String> {
        let method = if payload.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(payload.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| Error::MalformedRelay(format!("bad http method {:?}", payload.method)))?
        };
        let url = join_url(&chain.http_url, &payload.path);
        let headers = Self::headers(payload)?;
        let body = Self::request_body(payload)?;

        let mut attempt = 0;
        let response = loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone());
            if let Some(auth) = &chain.basic_auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }
            match request.send().await {
                Ok(response) => break response,
                Err(e) if e.is_timeout() => {
                    return Err(Error::UpstreamTimeout(self.timeout.as_millis() as u64));
                }
                Err(e) if attempt < self.retries && (e.is_connect() || e.is_request()) => {
                    attempt += 1;
                    warn!("retrying chain {} after network error: {}", chain.id, e);
                }
                Err(e) => return Err(Error::UpstreamNetwork(e)),
            }
        };

        let status = response.status();
        let gzipped_response = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                Error::UpstreamTimeout(self.timeout.as_millis() as u64)
            } else {
                Error::UpstreamNetwork(e)
            }
        })?;
        let bytes = if gzipped_response {
            gunzip(&bytes).map_err(|e| Error::Codec(e.to_string()))?
        } else {
            bytes.to_vec()
        };
        if !status.is_success() {
            debug!("chain {} answered HTTP {}", chain.id, status);
            return Err(Error::UpstreamHttp {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        if payload.is_gzipped() {
            return Ok(STANDARD.encode(gzip(&bytes)?));
        }
        // the body is signed as text, so it must round-trip exactly
        String::from_utf8(bytes).map_err(|e| {
            debug!("chain {} answered with a non UTF-8 body", chain.id);
            Error::UpstreamHttp {
                status: status.as_u16(),
                body: format!("response body is not valid UTF-8: {}", e.utf8_error()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_gzip_roundtrip() {
        let data = br#"{"jsonrpc":"2.0","method":"eth_blockNumber"}"#;
        assert_eq!(gunzip(&gzip(data).unwrap()).unwrap(), data.to_vec());
        assert!(gunzip(b"not gzip").is_err());
    }

    #[test]
    fn test_gzipped_payload_body() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Encoding".to_string(), "gzip".to_string());
        let payload = Payload {
            data: STANDARD.encode(gzip(b"hello").unwrap()),
            method: "POST".into(),
            path: String::new(),
            headers,
        };
        assert_eq!(Forwarder::request_body(&payload).unwrap(), b"hello".to_vec());
        let forwarded = Forwarder::headers(&payload).unwrap();
        assert!(forwarded.get(CONTENT_ENCODING).is_none());
        assert_eq!(forwarded.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a:1/", "/v1/x"), "http://a:1/v1/x");
        assert_eq!(join_url("http://a:1", ""), "http://a:1");
    }

    #[tokio::test]
    async fn test_unreachable_chain_is_network_error() {
        let forwarder = Forwarder::new(Duration::from_millis(1000), 0).unwrap();
        let chain = HostedBlockchain {
            id: "0001".into(),
            http_url: "http://127.0.0.1:1".into(),
            websocket_url: None,
            basic_auth: None,
        };
        let payload = Payload {
            data: "{}".into(),
            method: "POST".into(),
            path: String::new(),
            headers: BTreeMap::new(),
        };
        let err = forwarder.forward(&chain, &payload).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamNetwork(_) | Error::UpstreamTimeout(_)));
    }

    const BINARY_BODY: &[u8] = &[0x7b, 0xff, 0xfe, 0x7d];

    async fn binary_chain() -> HostedBlockchain {
        use axum::{routing::post, Router};
        let app = Router::new().route("/", post(|| async { BINARY_BODY.to_vec() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        HostedBlockchain {
            id: "0001".into(),
            http_url: format!("http://{}", addr),
            websocket_url: None,
            basic_auth: None,
        }
    }

    #[tokio::test]
    async fn test_non_utf8_body_is_rejected() {
        let forwarder = Forwarder::new(Duration::from_millis(2000), 0).unwrap();
        let chain = binary_chain().await;
        let payload = Payload {
            data: "{}".into(),
            method: "POST".into(),
            path: String::new(),
            headers: BTreeMap::new(),
        };
        let err = forwarder.forward(&chain, &payload).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamHttp { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_gzipped_binary_body_is_kept_exact() {
        let forwarder = Forwarder::new(Duration::from_millis(2000), 0).unwrap();
        let chain = binary_chain().await;
        let mut headers = BTreeMap::new();
        headers.insert("Content-Encoding".to_string(), "gzip".to_string());
        let payload = Payload {
            data: STANDARD.encode(gzip(b"{}").unwrap()),
            method: "POST".into(),
            path: String::new(),
            headers,
        };
        let body = forwarder.forward(&chain, &payload).await.unwrap();
        let raw = gunzip(&STANDARD.decode(body).unwrap()).unwrap();
        assert_eq!(raw, BINARY_BODY.to_vec());
    }
}
