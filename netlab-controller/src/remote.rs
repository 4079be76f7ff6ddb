use std::net::IpAddr;

use async_trait::async_trait;

use crate::{
    endpoint::{DEFAULT_PORT, LEGACY_PORT},
    probe::{self, PROBE_TIMEOUT},
    Controller, ControllerEndpoint, Result,
};

/// A controller running outside the emulator. Starting and stopping it does nothing.
#[derive(Debug, Clone)]
pub struct RemoteController {
    endpoint: ControllerEndpoint,
}

impl RemoteController {
    /// Probes the controller and warns when it does not answer. Without an explicit port, the
    /// standard port is tried before the legacy one; if neither answers the standard port is used.
    pub async fn new(name: impl Into<String>, ip: IpAddr, port: Option<u16>) -> Self {
        let name = name.into();

        let port = match port {
            Some(port) => {
                if !probe::is_listening((ip, port).into(), PROBE_TIMEOUT).await {
                    tracing::warn!(controller = %name, %ip, port, "unable to contact the remote controller");
                }
                port
            }
            None => Self::discover(&name, ip).await,
        };

        Self { endpoint: ControllerEndpoint::new(name, ip, port).remote() }
    }

    async fn discover(name: &str, ip: IpAddr) -> u16 {
        for port in [DEFAULT_PORT, LEGACY_PORT] {
            if probe::is_listening((ip, port).into(), PROBE_TIMEOUT).await {
                tracing::info!(controller = name, %ip, port, "connecting to remote controller");
                return port;
            }
            tracing::warn!(controller = name, %ip, port, "unable to contact the remote controller");
        }

        tracing::warn!(controller = name, %ip, port = DEFAULT_PORT, "setting remote controller");
        DEFAULT_PORT
    }
}

#[async_trait]
impl Controller for RemoteController {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    fn endpoint(&self) -> &ControllerEndpoint {
        &self.endpoint
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn explicit_port_is_kept_even_when_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut remote = RemoteController::new("c0", "127.0.0.1".parse().unwrap(), Some(port)).await;

        assert_eq!(remote.endpoint().port, port);
        assert!(remote.endpoint().remote);
        assert!(!remote.is_listening().await);

        remote.start().await.unwrap();
        remote.stop().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_port_that_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = RemoteController::new("c0", "127.0.0.1".parse().unwrap(), Some(port)).await;

        assert!(remote.is_listening().await);
        assert_eq!(remote.endpoint().target(), format!("tcp:127.0.0.1:{port}"));
    }
}
