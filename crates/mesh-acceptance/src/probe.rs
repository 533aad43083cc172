//! HTTP client for the product page behind the ingress.

use crate::errors::HarnessError;
use reqwest::header::COOKIE;
use reqwest::Client;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Path of the product page on the ingress.
pub const PRODUCT_PAGE_PATH: &str = "/productpage";

/// Per-request timeout. Must exceed the largest delay window checked.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A fetched product page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Wall-clock time from send until the body was fully read.
    pub elapsed: Duration,
}

/// Client for the sample app's product page.
pub struct ProductPageClient {
    base_url: String,
    http_client: Client,
}

impl ProductPageClient {
    /// Create a client for `base_url` (scheme and authority, no path).
    pub fn new(base_url: impl Into<String>) -> Result<Self, HarnessError> {
        let http_client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Client for an ingress address as returned by the cluster (IP or host).
    ///
    /// IPv6 addresses are bracketed in the URL authority.
    pub fn for_ingress(address: &str) -> Result<Self, HarnessError> {
        if address.starts_with("http://") || address.starts_with("https://") {
            return Self::new(address);
        }
        match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => Self::new(format!("http://[{ip}]")),
            _ => Self::new(format!("http://{address}")),
        }
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, PRODUCT_PAGE_PATH)
    }

    /// Status code of an untagged GET.
    pub async fn status(&self) -> Result<u16, reqwest::Error> {
        let response = self.http_client.get(self.url()).send().await?;
        Ok(response.status().as_u16())
    }

    /// GET tagged with `Cookie: user=<user>`, timing the full round trip.
    pub async fn fetch_as(&self, user: &str) -> Result<PageResponse, reqwest::Error> {
        let start = Instant::now();
        let response = self
            .http_client
            .get(self.url())
            .header(COOKIE, format!("user={user}"))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();

        Ok(PageResponse {
            status,
            body,
            elapsed: start.elapsed(),
        })
    }
}
