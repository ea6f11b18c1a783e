//! LAN discovery and handshake: broadcast presence, pick the active peer, confirm the link.
//! Also the TEXT consumer, since the handshake reply travels as TEXT.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use wirelink_core::{MessageType, PeerSession};

use crate::events::{AppEvent, EventSender};
use crate::transport::{Inbox, Transport};

/// Reply body sent to whoever handshakes with us.
pub const LINK_CONFIRMATION: &str = "Ethernet/USB link established";

pub type SharedSession = Arc<Mutex<PeerSession>>;

/// Announce ourselves on the link. Peers log it; nobody auto-connects.
pub fn send_discovery(transport: &Transport) {
    tracing::info!("broadcasting discovery");
    transport.broadcast(MessageType::Discovery, Vec::new());
}

/// Make `peer` the active peer and ask it to confirm.
pub async fn send_handshake(transport: &Transport, session: &SharedSession, peer: IpAddr) {
    session.lock().await.on_handshake_sent(peer);
    tracing::info!(%peer, "sending handshake");
    transport.send(peer, MessageType::Handshake, Vec::new());
}

pub async fn send_text(
    transport: &Transport,
    session: &SharedSession,
    text: &str,
) -> anyhow::Result<IpAddr> {
    let peer = session
        .lock()
        .await
        .target()
        .ok_or_else(|| anyhow::anyhow!("no peer selected; use `connect <ip>` first"))?;
    transport.send(peer, MessageType::Text, text.as_bytes().to_vec());
    Ok(peer)
}

/// Consume DISCOVERY, HANDSHAKE and TEXT until the transport closes.
pub async fn run_link(
    transport: Arc<Transport>,
    session: SharedSession,
    events: EventSender,
    mut inbox: Inbox,
) {
    while let Some(msg) = inbox.recv().await {
        let from = msg.peer;
        match msg.kind {
            MessageType::Discovery => {
                tracing::info!(%from, "discovered peer");
                let _ = events.send(AppEvent::PeerDiscovered(from));
            }
            MessageType::Handshake => {
                tracing::info!(%from, "handshake received");
                session.lock().await.on_handshake_received(from);
                transport.send(
                    from,
                    MessageType::Text,
                    LINK_CONFIRMATION.as_bytes().to_vec(),
                );
                let _ = events.send(AppEvent::PeerConnected(from));
            }
            MessageType::Text => {
                let newly_connected = {
                    let mut s = session.lock().await;
                    !s.is_connected() && s.on_link_confirmed(from)
                };
                if newly_connected {
                    tracing::info!(%from, "link confirmed");
                    let _ = events.send(AppEvent::PeerConnected(from));
                }
                let text = String::from_utf8_lossy(&msg.payload).into_owned();
                let _ = events.send(AppEvent::MessageReceived { from, text });
            }
            other => tracing::debug!(kind = %other, "unexpected message on link inbox"),
        }
    }
}

pub async fn link_inbox(transport: &Transport) -> Inbox {
    transport
        .subscribe(&[
            MessageType::Discovery,
            MessageType::Handshake,
            MessageType::Text,
        ])
        .await
}

/// Periodic discovery until a peer is connected or the transport closes.
pub async fn beacon_loop(transport: Arc<Transport>, session: SharedSession, interval: Duration) {
    loop {
        if transport.is_closed() || session.lock().await.is_connected() {
            break;
        }
        send_discovery(&transport);
        tokio::time::sleep(interval).await;
    }
    tracing::debug!("beacon loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ip, pair, recv};

    #[tokio::test]
    async fn handshake_sets_target_and_replies_once() {
        let (a, b, _) = pair().await;
        let (events, mut ev_rx) = crate::events::channel();
        let b_session: SharedSession = Arc::new(Mutex::new(PeerSession::new()));
        let inbox = link_inbox(&b).await;
        tokio::spawn(run_link(b.clone(), b_session.clone(), events, inbox));

        let mut replies = a.subscribe(&[MessageType::Text]).await;
        let a_session: SharedSession = Arc::new(Mutex::new(PeerSession::new()));
        send_handshake(&a, &a_session, ip(&b)).await;

        let reply = recv(&mut replies).await;
        assert_eq!(reply.payload, LINK_CONFIRMATION.as_bytes());
        assert_eq!(reply.peer, ip(&b));
        assert_eq!(b_session.lock().await.target(), Some(ip(&a)));
        assert!(b_session.lock().await.is_connected());
        assert_eq!(ev_rx.recv().await, Some(AppEvent::PeerConnected(ip(&a))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(replies.try_recv().is_err(), "exactly one reply expected");
    }

    #[tokio::test]
    async fn discovery_is_logged_without_connecting() {
        let (a, b, _) = pair().await;
        let (events, mut ev_rx) = crate::events::channel();
        let session: SharedSession = Arc::new(Mutex::new(PeerSession::new()));
        let inbox = link_inbox(&b).await;
        tokio::spawn(run_link(b.clone(), session.clone(), events, inbox));
        a.send(ip(&b), MessageType::Discovery, Vec::new());
        assert_eq!(ev_rx.recv().await, Some(AppEvent::PeerDiscovered(ip(&a))));
        assert_eq!(session.lock().await.target(), None);
    }

    #[tokio::test]
    async fn confirmation_text_marks_initiator_connected() {
        let (a, b, _) = pair().await;
        let (events, mut ev_rx) = crate::events::channel();
        let a_session: SharedSession = Arc::new(Mutex::new(PeerSession::new()));
        let inbox = link_inbox(&a).await;
        tokio::spawn(run_link(a.clone(), a_session.clone(), events, inbox));
        a_session.lock().await.on_handshake_sent(ip(&b));

        b.send(ip(&a), MessageType::Text, LINK_CONFIRMATION.as_bytes().to_vec());
        assert_eq!(ev_rx.recv().await, Some(AppEvent::PeerConnected(ip(&b))));
        assert!(matches!(
            ev_rx.recv().await,
            Some(AppEvent::MessageReceived { .. })
        ));
        assert!(a_session.lock().await.is_connected());
    }

    #[tokio::test]
    async fn text_without_peer_is_an_error() {
        let (a, _b, _) = pair().await;
        let session: SharedSession = Arc::new(Mutex::new(PeerSession::new()));
        assert!(send_text(&a, &session, "hi").await.is_err());
    }
}
