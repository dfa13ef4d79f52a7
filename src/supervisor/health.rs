//! Port and health checks

use crate::registry::HealthCheckSpec;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::trace;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Whether anything currently holds a local port.
///
/// Bound if we cannot bind it ourselves, or if a connection succeeds
/// (covers listeners on other local addresses that allow address reuse).
pub async fn port_is_bound(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    if TcpListener::bind(addr).await.is_err() {
        return true;
    }

    matches!(timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Asks a service whether it is serving
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, spec: &HealthCheckSpec) -> bool;
}

/// Plain HTTP GET against the health URL
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new() -> crate::errors::Result<Self> {
        // Localhost only; a system proxy must never see these requests.
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, spec: &HealthCheckSpec) -> bool {
        match self.client.get(&spec.url).timeout(spec.timeout).send().await {
            Ok(response) => {
                let healthy = response.status().as_u16() == spec.expected_status;
                trace!(url = %spec.url, status = response.status().as_u16(), healthy, "health check");
                healthy
            }
            Err(e) => {
                trace!(url = %spec.url, error = %e, "health check failed");
                false
            }
        }
    }
}
