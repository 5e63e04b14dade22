//! Channel routing table shared by all sessions

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::connection::SessionHandle;

/// Where a published body went
#[derive(Debug)]
pub enum Routed {
    /// Deliver the body to this session
    To(SessionHandle, Vec<u8>),
    /// Nobody consumes the channel yet; the body is held in its backlog
    Buffered,
}

#[derive(Default)]
struct Channel {
    subscribers: Vec<SessionHandle>,
    next: usize,
    backlog: VecDeque<Vec<u8>>,
}

/// Maps channel names to subscribed sessions
pub struct Router {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    backlog_limit: usize,
}

impl Router {
    /// Create a new router holding at most `backlog_limit` bodies per idle channel
    pub fn new(backlog_limit: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            backlog_limit,
        }
    }

    /// Add `handle` as a consumer of `channel`
    ///
    /// Subscribing the same session twice is a no-op. Returns the bodies
    /// that were waiting for a consumer; the caller delivers them.
    pub async fn subscribe(&self, channel: &str, handle: SessionHandle) -> Vec<Vec<u8>> {
        let mut channels = self.channels.write().await;
        let entry = channels.entry(channel.to_string()).or_default();

        if !entry.subscribers.iter().any(|s| s.id == handle.id) {
            debug!("Session {} subscribed to {}", handle.id, channel);
            entry.subscribers.push(handle);
        }
        entry.backlog.drain(..).collect()
    }

    /// Pick the next subscriber of `channel` for `body`, round-robin
    pub async fn route(&self, channel: &str, body: Vec<u8>) -> Routed {
        let mut channels = self.channels.write().await;
        let entry = channels.entry(channel.to_string()).or_default();

        if entry.subscribers.is_empty() {
            if entry.backlog.len() >= self.backlog_limit {
                warn!("Backlog of {} is full, dropping oldest message", channel);
                entry.backlog.pop_front();
            }
            entry.backlog.push_back(body);
            return Routed::Buffered;
        }

        let index = entry.next % entry.subscribers.len();
        entry.next = entry.next.wrapping_add(1);
        Routed::To(entry.subscribers[index].clone(), body)
    }

    /// Drop every subscription of a session
    pub async fn unregister(&self, session_id: u64) {
        let mut channels = self.channels.write().await;
        for channel in channels.values_mut() {
            channel.subscribers.retain(|s| s.id != session_id);
        }
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    pub async fn backlog_len(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|c| c.backlog.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RelaySession;
    use tokio::net::{TcpListener, TcpStream};

    /// Session handle backed by a real loopback connection
    async fn handle(id: u64) -> (SessionHandle, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, peer) = listener.accept().await.expect("accept");
        (RelaySession::new(server, peer, id).get_handle(), client)
    }

    fn target(routed: Routed) -> u64 {
        match routed {
            Routed::To(handle, _) => handle.id,
            Routed::Buffered => panic!("expected a subscriber"),
        }
    }

    #[tokio::test]
    async fn test_buffered_until_first_subscriber() {
        let router = Router::new(10);
        assert!(matches!(router.route("q", b"a".to_vec()).await, Routed::Buffered));
        assert!(matches!(router.route("q", b"b".to_vec()).await, Routed::Buffered));
        assert_eq!(router.backlog_len("q").await, 2);

        let (h1, _c1) = handle(1).await;
        let backlog = router.subscribe("q", h1).await;
        assert_eq!(backlog, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(router.backlog_len("q").await, 0);
    }

    #[tokio::test]
    async fn test_backlog_drops_oldest_when_full() {
        let router = Router::new(2);
        for body in [b"1", b"2", b"3"] {
            router.route("q", body.to_vec()).await;
        }

        let (h1, _c1) = handle(1).await;
        assert_eq!(router.subscribe("q", h1).await, vec![b"2".to_vec(), b"3".to_vec()]);
    }

    #[tokio::test]
    async fn test_round_robin_and_unregister() {
        let router = Router::new(10);
        let (h1, _c1) = handle(1).await;
        let (h2, _c2) = handle(2).await;
        router.subscribe("q", h1.clone()).await;
        router.subscribe("q", h2).await;
        router.subscribe("q", h1).await;
        assert_eq!(router.subscriber_count("q").await, 2);

        assert_eq!(target(router.route("q", vec![1]).await), 1);
        assert_eq!(target(router.route("q", vec![2]).await), 2);
        assert_eq!(target(router.route("q", vec![3]).await), 1);

        router.unregister(1).await;
        assert_eq!(router.subscriber_count("q").await, 1);
        assert_eq!(target(router.route("q", vec![4]).await), 2);
    }
}
