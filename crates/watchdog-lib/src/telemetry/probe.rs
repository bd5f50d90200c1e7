//! HTTP liveness probe against a worker's health endpoint
//!
//! Workers answer their health endpoint with 503 until the inference
//! engine reports ready, so only a 2xx counts as responsive.

use super::{LivenessProbe, ProbeResult};
use crate::models::Unit;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Liveness probe issuing `GET <health_url>`
#[derive(Clone)]
pub struct HttpLivenessProbe {
    client: reqwest::Client,
}

impl HttpLivenessProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("gpu-watchdog/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Probe a URL with a bounded timeout
    pub async fn probe_url(&self, url: &str, timeout: Duration) -> ProbeResult {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %url, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %url, timeout = e.is_timeout(), "health probe failed");
                ProbeResult::Failed
            }
        }
    }
}

impl Default for HttpLivenessProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn probe(&self, unit: &Unit, timeout: Duration) -> ProbeResult {
        match unit.health_url.as_deref() {
            Some(url) => self.probe_url(url, timeout).await,
            None => ProbeResult::Healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on an ephemeral port
    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/health", addr)
    }

    fn unit(health_url: Option<String>) -> Unit {
        Unit {
            id: 0,
            gpu_index: 0,
            processes: vec!["gpu-server-0".into()],
            health_url,
        }
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let url = serve_once("HTTP/1.1 200 OK").await;
        let probe = HttpLivenessProbe::new();
        let result = probe.probe(&unit(Some(url)), Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn test_probe_model_not_ready() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let probe = HttpLivenessProbe::new();
        let result = probe.probe(&unit(Some(url)), Duration::from_secs(2)).await;
        assert_eq!(result, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn test_probe_hung_worker_times_out() {
        // accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let probe = HttpLivenessProbe::new();
        let result = probe
            .probe_url(&format!("http://{}/health", addr), Duration::from_millis(200))
            .await;
        assert_eq!(result, ProbeResult::Failed);
    }

    #[tokio::test]
    async fn test_unit_without_endpoint_is_healthy() {
        let probe = HttpLivenessProbe::new();
        let result = probe.probe(&unit(None), Duration::from_millis(10)).await;
        assert!(result.is_healthy());
    }
}
