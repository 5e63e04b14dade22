mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_shared::{defaults, relay_message, RelayMessage};
use session::{RelaySession, Routed, Router, SessionHandle};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let address = std::env::var("COURIER_RELAY_ADDR").unwrap_or_else(|_| "0.0.0.0:7070".into());
    let listener = TcpListener::bind(&address).await?;
    info!("Relay listening on {}", address);

    let router = Arc::new(Router::new(defaults::RELAY_BACKLOG_LIMIT));
    let next_id = AtomicU64::new(1);

    loop {
        let (socket, addr) = listener.accept().await?;
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        info!("Connection from {} (session {})", addr, id);

        let router = router.clone();
        tokio::spawn(async move {
            run_session(socket, addr, id, router).await;
        });
    }
}

async fn run_session(socket: TcpStream, addr: SocketAddr, id: u64, router: Arc<Router>) {
    let mut session = RelaySession::new(socket, addr, id);
    let handle = session.get_handle();

    while let Some(message) = session.recv().await {
        handle_message(message, &handle, &router).await;
    }

    router.unregister(id).await;
    info!("Session {} ({}) disconnected", id, addr);
}

async fn handle_message(message: RelayMessage, handle: &SessionHandle, router: &Router) {
    match message.kind {
        Some(relay_message::Kind::Subscribe(subscribe)) => {
            let backlog = router.subscribe(&subscribe.channel, handle.clone()).await;
            debug!(
                "Session {} consumes {} ({} consumers)",
                handle.id,
                subscribe.channel,
                router.subscriber_count(&subscribe.channel).await
            );
            if !backlog.is_empty() {
                debug!("Flushing {} queued messages on {}", backlog.len(), subscribe.channel);
            }
            for body in backlog {
                if let Err(e) = handle.deliver(&subscribe.channel, body).await {
                    warn!("Failed to flush backlog to session {}: {}", handle.id, e);
                    break;
                }
            }
        }
        Some(relay_message::Kind::Publish(publish)) => {
            route(router, &publish.destination, publish.body).await;
        }
        other => debug!("Ignoring message from session {}: {:?}", handle.id, other),
    }
}

/// Deliver to one live subscriber, dropping sessions that fail on write
async fn route(router: &Router, channel: &str, mut body: Vec<u8>) {
    loop {
        match router.route(channel, body).await {
            Routed::Buffered => {
                debug!(
                    "No consumer for {}, {} messages queued",
                    channel,
                    router.backlog_len(channel).await
                );
                return;
            }
            Routed::To(target, routed) => match target.deliver(channel, routed.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Delivery to session {} failed: {}", target.id, e);
                    router.unregister(target.id).await;
                    body = routed;
                }
            },
        }
    }
}
