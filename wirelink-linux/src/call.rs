//! Call controller: feeds user actions and CALL_* messages into the call state machine
//! and performs the resulting sends and audio start/stop.

use std::net::IpAddr;
use std::sync::Arc;

use wirelink_core::call::Applied;
use wirelink_core::{CallAction, CallError, CallEvent, CallSession, CallState, MessageType};

use crate::audio::AudioPipeline;
use crate::discovery::SharedSession;
use crate::events::{AppEvent, EventSender};
use crate::transport::{Inbox, Transport};

pub async fn call_inbox(transport: &Transport) -> Inbox {
    transport
        .subscribe(&[
            MessageType::CallRequest,
            MessageType::CallAccept,
            MessageType::CallReject,
            MessageType::CallEnd,
            MessageType::CallAudio,
        ])
        .await
}

pub struct CallController {
    transport: Arc<Transport>,
    link: SharedSession,
    session: CallSession,
    audio: Arc<AudioPipeline>,
    events: EventSender,
}

impl CallController {
    pub fn new(
        transport: Arc<Transport>,
        link: SharedSession,
        audio: Arc<AudioPipeline>,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            link,
            session: CallSession::new(),
            audio,
            events,
        })
    }

    pub fn state(&self) -> CallState {
        self.session.state()
    }

    pub fn peer(&self) -> Option<IpAddr> {
        self.session.peer()
    }

    pub fn gain(&self) -> f32 {
        self.audio.gain()
    }

    pub fn set_gain(&self, value: f32) -> f32 {
        self.audio.set_gain(value)
    }

    /// Call the active peer.
    pub async fn dial(&self) -> Result<Applied, CallError> {
        let peer = self.link.lock().await.target();
        self.handle(CallEvent::Dial, peer).await
    }

    pub async fn accept(&self) -> Result<Applied, CallError> {
        self.handle(CallEvent::Accept, None).await
    }

    pub async fn reject(&self) -> Result<Applied, CallError> {
        self.handle(CallEvent::Reject, None).await
    }

    pub async fn hangup(&self) -> Result<Applied, CallError> {
        self.handle(CallEvent::Hangup, None).await
    }

    /// End any call in progress (telling the peer) and release the audio devices.
    pub async fn shutdown(&self) {
        match self.state() {
            CallState::Idle => {}
            CallState::Incoming => {
                let _ = self.reject().await;
            }
            CallState::Outgoing | CallState::InCall => {
                let _ = self.hangup().await;
            }
        }
        self.session.reset();
        self.stop_audio().await;
    }

    /// Consume CALL_* messages until the transport closes.
    pub async fn run(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(msg) = inbox.recv().await {
            let from = msg.peer;
            let event = match msg.kind {
                MessageType::CallAudio => {
                    if self.state() == CallState::InCall && self.peer() == Some(from) {
                        self.audio.push(msg.payload);
                    } else {
                        tracing::trace!(%from, "audio outside a call, discarded");
                    }
                    continue;
                }
                MessageType::CallRequest => CallEvent::RemoteRequest,
                MessageType::CallAccept => CallEvent::RemoteAccept,
                MessageType::CallReject => CallEvent::RemoteReject,
                MessageType::CallEnd => CallEvent::RemoteEnd,
                other => {
                    tracing::debug!(kind = %other, "unexpected message on call inbox");
                    continue;
                }
            };
            match self.handle(event, Some(from)).await {
                Ok(_) => {}
                Err(e @ CallError::WrongPeer { .. }) => tracing::warn!(error = %e, "call signal ignored"),
                Err(e) => tracing::info!(%from, error = %e, "call signal ignored"),
            }
        }
    }

    async fn handle(&self, event: CallEvent, addr: Option<IpAddr>) -> Result<Applied, CallError> {
        let applied = self.session.apply(event, addr)?;
        tracing::info!(
            from = ?applied.from,
            to = ?applied.to,
            ?event,
            peer = %applied.peer,
            "call state changed"
        );
        let mut reason = None;
        for action in &applied.actions {
            if let Err(e) = self.perform(*action, applied.peer).await {
                reason = Some(e);
                break;
            }
        }
        let _ = self.events.send(AppEvent::CallStateChanged {
            state: applied.to,
            reason: None,
        });
        if let Some(reason) = reason {
            tracing::error!(error = %reason, "audio device init failed, ending call");
            if let Ok(failed) = self.session.apply(CallEvent::MediaFailed, None) {
                for action in &failed.actions {
                    let _ = self.perform(*action, failed.peer).await;
                }
                let _ = self.events.send(AppEvent::CallStateChanged {
                    state: failed.to,
                    reason: Some(reason),
                });
            }
        }
        Ok(applied)
    }

    /// Only `StartAudio` can fail.
    async fn perform(&self, action: CallAction, peer: IpAddr) -> Result<(), String> {
        match action {
            CallAction::SendRequest => self.transport.send(peer, MessageType::CallRequest, Vec::new()),
            CallAction::SendAccept => self.transport.send(peer, MessageType::CallAccept, Vec::new()),
            CallAction::SendReject => self.transport.send(peer, MessageType::CallReject, Vec::new()),
            CallAction::SendEnd => self.transport.send(peer, MessageType::CallEnd, Vec::new()),
            CallAction::StartAudio(role) => {
                self.audio
                    .start(self.transport.clone(), peer, role)
                    .map_err(|e| e.to_string())?;
                // A CALL_END applied while the devices were opening found nothing to stop.
                if self.state() != CallState::InCall || self.peer() != Some(peer) {
                    tracing::info!(%peer, "call ended while audio was starting");
                    self.stop_audio().await;
                }
            }
            CallAction::StopAudio => self.stop_audio().await,
        }
        Ok(())
    }

    async fn stop_audio(&self) {
        let audio = self.audio.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || audio.stop()).await {
            tracing::error!(error = %e, "audio stop task failed");
        }
    }
}
