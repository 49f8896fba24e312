//! Health probe for the optional local speaker-naming service.
//!
//! Absence of the service degrades to `Unavailable` and never fails a core
//! operation.

use std::time::Duration;

pub const NAMING_SERVICE_URL: &str = "http://localhost:11434/api/tags";
pub const NAMING_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingServiceStatus {
    Available,
    Unavailable,
}

pub async fn probe_naming_service() -> NamingServiceStatus {
    probe_url(NAMING_SERVICE_URL).await
}

async fn probe_url(url: &str) -> NamingServiceStatus {
    let client = match reqwest::Client::builder()
        .timeout(NAMING_PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(_) => return NamingServiceStatus::Unavailable,
    };
    match client.get(url).send().await {
        Ok(response) if response.status().is_success() => NamingServiceStatus::Available,
        Ok(response) => {
            tracing::debug!(status = %response.status(), "naming service probe rejected");
            NamingServiceStatus::Unavailable
        }
        Err(e) => {
            tracing::debug!("naming service unreachable: {e}");
            NamingServiceStatus::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades() {
        // Nothing listens on this port in the test environment.
        let status = probe_url("http://127.0.0.1:1/api/tags").await;
        assert_eq!(status, NamingServiceStatus::Unavailable);
    }
}
