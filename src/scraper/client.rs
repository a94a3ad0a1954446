use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Client;

use crate::config::Config;
use crate::error::{AppError, Result};

const SUBSCRIPTION_KEY_HEADER: &str = "ocp-apim-subscription-key";

/// Something the poller can pull raw timing frames from.
pub trait TimingSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<String>> + Send;
}

pub struct TimingClient {
    client: Client,
    endpoint_url: String,
}

impl TimingClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut key = HeaderValue::from_str(config.subscription_key()?)
            .map_err(|e| AppError::Config(format!("invalid subscription key: {}", e)))?;
        key.set_sensitive(true);
        headers.insert(HeaderName::from_static(SUBSCRIPTION_KEY_HEADER), key);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .user_agent("imsa-scraper/1.0")
            .build()?;

        Ok(Self {
            client,
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    /// Fetches the current results document. The body is returned as-is
    /// whatever the HTTP status; only transport failures are errors.
    pub async fn fetch_timing_frame(&self) -> Result<String> {
        let response = self.client.get(&self.endpoint_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("{} answered HTTP {}", self.endpoint_url, status);
        }

        Ok(response.text().await?)
    }
}

impl TimingSource for TimingClient {
    fn fetch(&self) -> impl Future<Output = Result<String>> + Send {
        self.fetch_timing_frame()
    }
}
