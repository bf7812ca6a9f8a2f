//! Capability probe for remote and cloud runtimes.

use std::time::Duration;

use log::debug;

use crate::error::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    capabilities_path: String,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(capabilities_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            capabilities_path: capabilities_path.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn capabilities_url(&self, base_url: &str) -> String {
        let path = self.capabilities_path.trim_start_matches('/');
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }

    /// Succeeds if the capabilities endpoint answers with a 2xx within the timeout.
    pub async fn check(&self, base_url: &str) -> RuntimeResult<()> {
        let url = self.capabilities_url(base_url);
        debug!("Probing {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RuntimeError::UnreachableRemote {
                url: url.clone(),
                message: if e.is_timeout() {
                    format!("no answer within {}ms", self.timeout.as_millis())
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::UnreachableRemote {
                url,
                message: format!("capabilities endpoint returned {status}"),
            });
        }
        Ok(())
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new("/api/capabilities", Duration::from_secs(3))
    }
}
