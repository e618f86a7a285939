//! HTTP(S) transport over a blocking `reqwest` client.

use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use std::time::Duration;

use super::{HttpResponse, Transport, TransportError};
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("srsforge/", env!("CARGO_PKG_VERSION"));

/// Production transport.
///
/// Bodies are returned as sent; gzip decoding happens in the fetcher so
/// that `.gz` files served without `Content-Encoding` are handled too.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        url: &str,
        timeout: Duration,
        etag: Option<&str>,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().map_err(classify)?;
        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().map_err(classify)?.to_vec();

        Ok(HttpResponse { status, body, etag })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}
