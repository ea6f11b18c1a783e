//! UDP multiplexer: one broadcast-enabled socket, one receive loop, typed fan-out to
//! subscribers, fire-and-forget sends.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use wirelink_core::{decode_datagram, encode_datagram, Message, MessageType, MAX_DATAGRAM};

use crate::events::{AppEvent, EventSender};

pub type Inbox = mpsc::UnboundedReceiver<Message>;

#[derive(Default)]
struct Subscribers {
    by_type: HashMap<MessageType, Vec<mpsc::UnboundedSender<Message>>>,
    unclassified: Option<mpsc::UnboundedSender<Message>>,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    port: u16,
    runtime: Handle,
    subscribers: Mutex<Subscribers>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    events: EventSender,
}

impl Transport {
    /// Bind `addr:port` with broadcast enabled. Must be called inside a tokio runtime.
    pub fn bind(addr: Ipv4Addr, port: u16, events: EventSender) -> io::Result<Arc<Self>> {
        let std_sock = std::net::UdpSocket::bind((addr, port))?;
        std_sock.set_broadcast(true)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        let local = socket.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        tracing::info!(%local, "UDP socket bound");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local,
            port,
            runtime: Handle::current(),
            subscribers: Mutex::new(Subscribers::default()),
            closed: AtomicBool::new(false),
            shutdown,
            events,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register for every message of the given types.
    pub async fn subscribe(&self, kinds: &[MessageType]) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().await;
        for kind in kinds {
            subs.by_type.entry(*kind).or_default().push(tx.clone());
        }
        rx
    }

    /// Register the default channel: types nobody subscribed to, including unknown tags.
    pub async fn subscribe_unclassified(&self) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.unclassified = Some(tx);
        rx
    }

    /// Frame and send one datagram to `peer` on the shared port. Returns immediately;
    /// concurrent sends are not ordered. Failures are logged and reported, never raised.
    pub fn send(&self, peer: IpAddr, kind: MessageType, payload: Vec<u8>) {
        self.send_to(SocketAddr::new(peer, self.port), kind, payload);
    }

    pub fn broadcast(&self, kind: MessageType, payload: Vec<u8>) {
        self.send_to(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port),
            kind,
            payload,
        );
    }

    fn send_to(&self, dest: SocketAddr, kind: MessageType, payload: Vec<u8>) {
        if self.is_closed() {
            tracing::warn!(%dest, %kind, "socket closed, dropping send");
            let _ = self
                .events
                .send(AppEvent::TransportUnavailable("socket closed".into()));
            return;
        }
        let frame = encode_datagram(kind, &payload);
        let socket = self.socket.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            match socket.send_to(&frame, dest).await {
                Ok(n) => {
                    if kind == MessageType::CallAudio {
                        tracing::trace!(%dest, bytes = n, "TX audio");
                    } else {
                        tracing::debug!(%dest, %kind, bytes = n, "TX");
                    }
                }
                Err(e) => {
                    tracing::warn!(%dest, %kind, error = %e, "send failed");
                    let _ = events.send(AppEvent::TransportUnavailable(e.to_string()));
                }
            }
        });
    }

    /// Receive loop. Returns once `close` is called; dropping out of the pending
    /// `recv_from` is what unblocks it, not a flag poll.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok((0, _)) => {}
                    Ok((n, from)) => {
                        if from == self.local {
                            continue;
                        }
                        match decode_datagram(&buf[..n], from.ip()) {
                            Ok(msg) => {
                                if msg.kind == MessageType::CallAudio {
                                    tracing::trace!(%from, bytes = n, "RX audio");
                                } else {
                                    tracing::debug!(%from, kind = %msg.kind, bytes = n, "RX");
                                }
                                self.dispatch(msg).await;
                            }
                            Err(e) => tracing::debug!(%from, error = %e, "dropping datagram"),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "recv failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        // Dropping the senders ends every consumer loop.
        let mut subs = self.subscribers.lock().await;
        subs.by_type.clear();
        subs.unclassified = None;
        tracing::info!(local = %self.local, "receive loop stopped");
    }

    async fn dispatch(&self, msg: Message) {
        let mut subs = self.subscribers.lock().await;
        if let Some(list) = subs.by_type.get_mut(&msg.kind) {
            list.retain(|tx| !tx.is_closed());
            if !list.is_empty() {
                for tx in list.iter() {
                    let _ = tx.send(msg.clone());
                }
                return;
            }
        }
        match &subs.unclassified {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => tracing::debug!(kind = %msg.kind, from = %msg.peer, "no consumer, dropped"),
        }
    }

    /// Close the transport: the receive loop returns and later sends are dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.send_replace(true);
            tracing::info!(local = %self.local, "transport closed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn typed_fan_out_reaches_every_subscriber() {
        let (a, b, _events) = pair().await;
        let mut one = b.subscribe(&[MessageType::Text]).await;
        let mut two = b.subscribe(&[MessageType::Text, MessageType::FileAck]).await;
        a.send(ip(&b), MessageType::Text, b"hello".to_vec());
        let m1 = recv(&mut one).await;
        let m2 = recv(&mut two).await;
        assert_eq!(m1.payload, b"hello");
        assert_eq!(m2, m1);
        assert_eq!(m1.peer, ip(&a));
    }

    #[tokio::test]
    async fn unknown_tags_go_to_default_channel() {
        let (a, b, _events) = pair().await;
        let mut text = b.subscribe(&[MessageType::Text]).await;
        let mut other = b.subscribe_unclassified().await;
        a.send(ip(&b), MessageType::Unclassified(0x7E), vec![1, 2]);
        let m = recv(&mut other).await;
        assert_eq!(m.kind, MessageType::Unclassified(0x7E));
        assert_eq!(m.payload, vec![1, 2]);
        assert!(text.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_unblocks_receive_loop() {
        let (events, _rx) = crate::events::channel();
        let t = Transport::bind(Ipv4Addr::LOCALHOST, 0, events).unwrap();
        let mut inbox = t.subscribe(&[MessageType::Text]).await;
        let handle = tokio::spawn(t.clone().run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("receive loop did not stop")
            .unwrap();
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_reports_unavailable() {
        let (events, mut rx) = crate::events::channel();
        let t = Transport::bind(Ipv4Addr::LOCALHOST, 0, events).unwrap();
        t.close();
        t.send(IpAddr::V4(Ipv4Addr::LOCALHOST), MessageType::Text, vec![]);
        assert!(matches!(
            rx.recv().await,
            Some(AppEvent::TransportUnavailable(_))
        ));
    }
}
