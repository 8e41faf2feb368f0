//! Server readiness detection
//!
//! Backends without a native "server is listening" event poll the preview
//! port until it accepts a connection, then publish a [`ServerReady`]. Only
//! the server process is probed.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ServerReady;

/// Announces readiness of one server process
#[derive(Debug, Clone)]
pub(crate) struct ReadyProbe {
    /// Signal payload sent on success
    pub ready: ServerReady,
    /// Delay between attempts
    pub interval: Duration,
    /// Where the signal is published
    pub signal: broadcast::Sender<ServerReady>,
}

impl ReadyProbe {
    /// Resolve once `addr` accepts a connection
    pub async fn wait_for_listener(&self, addr: SocketAddr) {
        loop {
            match TcpStream::connect(addr).await {
                Ok(_) => return,
                Err(e) => debug!("Port {} not accepting yet: {}", addr, e),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Publish the ready signal
    pub fn announce(&self) {
        info!("Server ready on {}", self.ready.url);
        // No subscribers just means nobody is waiting on this server.
        let _ = self.signal.send(self.ready.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (signal, mut rx) = broadcast::channel(4);

        let probe = ReadyProbe {
            ready: ServerReady {
                port: addr.port(),
                url: format!("http://localhost:{}", addr.port()),
            },
            interval: Duration::from_millis(10),
            signal,
        };

        tokio::time::timeout(Duration::from_secs(5), probe.wait_for_listener(addr))
            .await
            .unwrap();
        probe.announce();

        assert_eq!(rx.recv().await.unwrap().port, addr.port());
    }
}
