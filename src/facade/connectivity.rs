//! Network reachability probing.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::net::{Network, Request};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
  #[default]
  Offline,
  Poor,
  Good,
}

impl NetworkQuality {
  pub fn is_online(&self) -> bool {
    !matches!(self, Self::Offline)
  }
}

#[async_trait]
pub trait Connectivity: Send + Sync {
  async fn check(&self) -> NetworkQuality;
}

/// Probes a health endpoint and grades the answer by latency.
pub struct ProbeConnectivity {
  network: Arc<dyn Network>,
  health_url: String,
  timeout: Duration,
  poor_latency: Duration,
}

impl ProbeConnectivity {
  pub fn new(network: Arc<dyn Network>, health_url: impl Into<String>) -> Self {
    Self {
      network,
      health_url: health_url.into(),
      timeout: Duration::from_secs(5),
      poor_latency: Duration::from_millis(1500),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Responses slower than this count as a poor connection.
  pub fn with_poor_latency(mut self, latency: Duration) -> Self {
    self.poor_latency = latency;
    self
  }
}

#[async_trait]
impl Connectivity for ProbeConnectivity {
  async fn check(&self) -> NetworkQuality {
    let Ok(request) = Request::get(&self.health_url) else {
      return NetworkQuality::Offline;
    };

    let started = Instant::now();
    let quality = match tokio::time::timeout(self.timeout, self.network.fetch(&request)).await {
      Ok(Ok(resp)) if resp.is_success() && started.elapsed() <= self.poor_latency => {
        NetworkQuality::Good
      }
      // Reachable but slow or unhealthy
      Ok(Ok(_)) => NetworkQuality::Poor,
      Ok(Err(_)) | Err(_) => NetworkQuality::Offline,
    };

    debug!(?quality, elapsed = ?started.elapsed(), "Connectivity probe");
    quality
  }
}
