use super::HealthChecker;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

/// Per-attempt request timeout. An attempt that hangs longer than this counts
/// as "not ready" and the poll loop moves on to its next tick.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared HTTP client for health checks.
///
/// One pooled client serves every checker; the client-level timeout is a
/// fallback only, individual requests apply [`ATTEMPT_TIMEOUT`].
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .build()
            .expect("Failed to create shared HTTP client")
    })
}

/// HTTP-based health checker: healthy iff a GET returns a 2xx status.
pub struct HttpChecker {
    url: String,
    client: Client,
}

impl HttpChecker {
    /// Create a checker for `url` using the shared pooled client.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or uses a non-HTTP scheme.
    pub fn new(url: String) -> Result<Self> {
        Self::validate_url(&url)?;
        Ok(Self {
            url,
            client: shared_client().clone(),
        })
    }

    fn validate_url(url: &str) -> Result<()> {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let scheme = parsed.scheme();
                if scheme != "http" && scheme != "https" {
                    return Err(crate::error::Error::Config(format!(
                        "Invalid health URL '{}': scheme must be http or https, got '{}'",
                        url, scheme
                    )));
                }
                Ok(())
            }
            Err(e) => Err(crate::error::Error::Config(format!(
                "Invalid health URL '{}': {}",
                url, e
            ))),
        }
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> Result<bool> {
        // Transport errors and non-2xx statuses are both "not ready"; the
        // caller's poll loop decides when to give up.
        match self
            .client
            .get(&self.url)
            .timeout(ATTEMPT_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn target(&self) -> &str {
        &self.url
    }
}
