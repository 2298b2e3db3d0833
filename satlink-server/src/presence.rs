///! Best-effort UDP presence heartbeats.
///!
///! Each datagram is a JSON `PresenceReport` (`{"fu_id": ..., "occupied_slots": [...]}`).
///! Lost datagrams are tolerated up to the liveness timeout.
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use satlink_common::PresenceReport;
use tokio::net::UdpSocket;

use crate::error::GroundResult;
use crate::registry::{Announcer, FieldUnitRegistry, Registration};

const MAX_DATAGRAM: usize = 8 * 1024;

pub struct PresenceListener {
    socket: UdpSocket,
    registry: Arc<FieldUnitRegistry>,
}

impl PresenceListener {
    pub async fn bind(address: &str, registry: Arc<FieldUnitRegistry>) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("Failed to bind presence socket on {}", address))?;
        tracing::info!("Presence listener on udp://{}", socket.local_addr()?);
        Ok(Self { socket, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until the task is aborted. Only fatal storage errors stop it.
    pub async fn run(self) -> GroundResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Presence socket receive failed: {}", e);
                    continue;
                }
            };

            match handle_datagram(&self.registry, &buf[..len], peer).await {
                Ok(Some(outcome)) if outcome.created => {
                    tracing::info!("New field unit announced itself over UDP from {}", peer)
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("Presence datagram from {} rejected: {}", peer, e),
            }
        }
    }
}

/// `Ok(None)` for a datagram that is not a presence report.
async fn handle_datagram(
    registry: &FieldUnitRegistry,
    payload: &[u8],
    peer: SocketAddr,
) -> GroundResult<Option<Registration>> {
    let report: PresenceReport = match serde_json::from_slice(payload) {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!("Malformed presence datagram from {}: {}", peer, e);
            return Ok(None);
        }
    };

    let outcome = registry
        .register(
            &report.fu_id,
            &peer.ip().to_string(),
            report.occupied_slots,
            Announcer::Unit,
        )
        .await?;
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_registers_unit() {
        let registry = Arc::new(FieldUnitRegistry::in_memory());
        let listener = PresenceListener::bind("127.0.0.1:0", registry.clone()).await.unwrap();
        let target = listener.local_addr().unwrap();
        let task = tokio::spawn(listener.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"garbage", target).await.unwrap();
        client
            .send_to(br#"{"fu_id":"FU7","occupied_slots":[]}"#, target)
            .await
            .unwrap();

        let mut unit = None;
        for _ in 0..50 {
            unit = registry.get("FU7").await;
            if unit.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        task.abort();

        let unit = unit.unwrap();
        assert_eq!(unit.address, "127.0.0.1");
        assert!(unit.slots.is_empty());
    }

    #[tokio::test]
    async fn test_empty_id_is_rejected() {
        let registry = FieldUnitRegistry::in_memory();
        let peer: SocketAddr = "10.0.0.3:9000".parse().unwrap();
        let result = handle_datagram(&registry, br#"{"fu_id":""}"#, peer).await;
        assert!(result.is_err());
        assert!(registry.is_empty().await);
    }
}
