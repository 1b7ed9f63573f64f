//! Reqwest-based implementation of the [`Transport`] trait.
//!
//! A thin adapter around `reqwest::Client` that presents the session's
//! profile headers and maps anti-bot responses onto the transport error
//! taxonomy.

use async_trait::async_trait;
use http::HeaderMap;
use reqwest::{Client, Method, redirect::Policy};

use super::{LogicalRequest, TierResponse, Transport, TransportError};
use crate::modules::profiles::Profile;

/// Body markers that identify an interactive verification page. Matches the
/// indicator set commonly served alongside 403/503 anti-bot interstitials.
const CHALLENGE_MARKERS: &[&str] = &[
    "challenge-platform",
    "jschl-answer",
    "cf-challenge",
    "__cf_chl_jschl_tk__",
    "Checking your browser",
    "DDoS protection by",
];

/// Default tier backend built on reqwest.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a client with redirects disabled so the chain observes
    /// intermediate responses instead of silently following them.
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .redirect(Policy::none())
            .cookie_store(true)
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing reqwest client, e.g. one configured with a proxy or
    /// custom TLS settings.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        profile: &Profile,
        headers: &HeaderMap,
        request: &LogicalRequest,
    ) -> Result<TierResponse, TransportError> {
        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let mut req_headers = reqwest::header::HeaderMap::new();
        for (name, value) in profile.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                req_headers.insert(name, value);
            }
        }
        for (name, value) in headers.iter() {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                req_headers.insert(name, value);
            }
        }

        let mut builder = self
            .client
            .request(method, request.url.as_str())
            .headers(req_headers);
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status().as_u16();
        let resp_headers = convert_headers(response.headers())?;
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        if matches!(status, 403 | 503) {
            let text = String::from_utf8_lossy(&body);
            if let Some(marker) = CHALLENGE_MARKERS.iter().find(|m| text.contains(*m)) {
                return Err(TransportError::Challenge((*marker).to_string()));
            }
        }
        if status >= 400 {
            return Err(TransportError::Status(status));
        }

        Ok(TierResponse {
            status,
            headers: resp_headers,
            body,
        })
    }
}

fn convert_headers(map: &reqwest::header::HeaderMap) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in map.iter() {
        let name = http::HeaderName::from_bytes(name.as_str().as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let value = http::HeaderValue::from_bytes(value.as_bytes())
            .map_err(|err| TransportError::Network(err.to_string()))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
