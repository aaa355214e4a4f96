//! In-memory connection pairs

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::{next_connection_id, ConnectionInfo, ConnectionKind, ConnectionSink, TunnelConnection};

const CHANNEL_DEPTH: usize = 256;

/// One end of a connected in-process pair
pub struct MemoryConnection {
    id: u64,
    info: ConnectionInfo,
    connected: Arc<AtomicBool>,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    shutdown: Arc<Notify>,
}

impl MemoryConnection {
    /// Two connected ends: `a` talks to machine `b_id` and the reverse
    pub fn pair(
        a_id: &str,
        b_id: &str,
        transaction_id: &str,
        kind: ConnectionKind,
    ) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let endpoint: SocketAddr = SocketAddr::from(([127, 0, 0, 1], 0));

        let info = |remote: &str| ConnectionInfo {
            remote_machine_id: remote.to_string(),
            remote_machine_name: remote.to_string(),
            transaction_id: transaction_id.to_string(),
            transport_name: "memory".to_string(),
            kind,
            remote_endpoint: endpoint,
        };

        let a = Arc::new(MemoryConnection::new(info(b_id), a_tx, a_rx));
        let b = Arc::new(MemoryConnection::new(info(a_id), b_tx, b_rx));
        (a, b)
    }

    fn new(info: ConnectionInfo, tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            id: next_connection_id(),
            info,
            connected: Arc::new(AtomicBool::new(true)),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl TunnelConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> std::io::Result<()> {
        let tx = self.tx.lock().clone();
        let tx = match tx {
            Some(tx) if self.connected() => tx,
            _ => return Err(std::io::ErrorKind::NotConnected.into()),
        };
        tx.send(data)
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    fn begin_receive(&self, sink: Arc<dyn ConnectionSink>) {
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        let shutdown = self.shutdown.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = rx.recv() => match data {
                        Some(data) => sink.receive(data).await,
                        None => break,
                    },
                    _ = shutdown.notified() => break,
                }
            }
            connected.store(false, Ordering::SeqCst);
            sink.closed().await;
        });
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tx.lock().take();
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedSender;

    struct ChannelSink(UnboundedSender<Option<Bytes>>);

    #[async_trait]
    impl ConnectionSink for ChannelSink {
        async fn receive(&self, data: Bytes) {
            let _ = self.0.send(Some(data));
        }

        async fn closed(&self) {
            let _ = self.0.send(None);
        }
    }

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, b) = MemoryConnection::pair("a", "b", "tuntap", ConnectionKind::Direct);
        assert_eq!(a.remote_machine_id(), "b");
        assert_eq!(b.remote_machine_id(), "a");
        assert_ne!(a.id(), b.id());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.begin_receive(Arc::new(ChannelSink(tx)));

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(Bytes::from_static(b"ping")));
    }

    #[tokio::test]
    async fn test_close_ends_peer_receive_loop() {
        let (a, b) = MemoryConnection::pair("a", "b", "tuntap", ConnectionKind::Relay);
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.begin_receive(Arc::new(ChannelSink(tx)));

        a.close();
        assert!(!a.connected());
        assert!(a.send(Bytes::from_static(b"x")).await.is_err());
        assert_eq!(rx.recv().await.unwrap(), None);
        assert!(!b.connected());
    }
}
