use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::core::protocol::Message;

struct Connection {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Outbound side of every live robot connection, keyed by robot id.
///
/// Sending never waits on the robot: messages are queued on the
/// connection's channel and its socket task writes them out.
#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Connection>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for a new socket, used to detach only the connection that attached.
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Binds a robot to a connection, replacing any previous one.
    pub async fn attach(
        &self,
        robot_id: &str,
        connection_id: u64,
        outbound: mpsc::UnboundedSender<Message>,
    ) {
        let previous = self.connections.write().await.insert(
            robot_id.to_string(),
            Connection {
                id: connection_id,
                outbound,
            },
        );
        if let Some(prev) = previous
            && prev.id != connection_id
        {
            warn!(robot_id = %robot_id, "Robot reconnected, replacing previous connection");
        }
    }

    /// Returns false when another connection has since taken over the robot id.
    pub async fn detach(&self, robot_id: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(robot_id) {
            Some(conn) if conn.id == connection_id => {
                connections.remove(robot_id);
                debug!(robot_id = %robot_id, "Robot connection detached");
                true
            }
            _ => false,
        }
    }

    pub async fn send(&self, robot_id: &str, message: Message) -> bool {
        let connections = self.connections.read().await;
        let Some(conn) = connections.get(robot_id) else {
            return false;
        };
        if conn.outbound.send(message).is_err() {
            debug!(robot_id = %robot_id, "Robot connection closed while sending");
            return false;
        }
        true
    }

    pub async fn is_connected(&self, robot_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(robot_id)
            .is_some_and(|c| !c.outbound.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::MessageBuilder;

    #[tokio::test]
    async fn stale_connection_cannot_detach_its_replacement() {
        let hub = ConnectionHub::new();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let old = hub.next_connection_id();
        let new = hub.next_connection_id();

        hub.attach("r1", old, old_tx).await;
        hub.attach("r1", new, new_tx).await;
        assert!(!hub.detach("r1", old).await);

        assert!(hub.send("r1", MessageBuilder::pause("r1")).await);
        assert!(new_rx.try_recv().is_ok());

        assert!(hub.detach("r1", new).await);
        assert!(!hub.send("r1", MessageBuilder::resume("r1")).await);
    }

    #[tokio::test]
    async fn closed_receiver_reports_send_failure() {
        let hub = ConnectionHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.next_connection_id();
        hub.attach("r1", id, tx).await;
        drop(rx);
        assert!(!hub.is_connected("r1").await);
        assert!(!hub.send("r1", MessageBuilder::pause("r1")).await);
    }
}
