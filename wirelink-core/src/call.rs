//! Call signaling state machine.
//!
//! ```text
//! IDLE --dial--> OUTGOING --remote accept--> IN_CALL
//! IDLE --remote request--> INCOMING --accept--> IN_CALL
//! INCOMING --reject--> IDLE
//! OUTGOING | IN_CALL --hangup--> IDLE
//! any non-IDLE --remote reject/end--> IDLE
//! ```
//!
//! Anything else is a no-op. State lives in an atomic so user actions and network events
//! coming from different threads cannot interleave a transition.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    InCall,
}

impl CallState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Outgoing => 1,
            Self::Incoming => 2,
            Self::InCall => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Outgoing,
            2 => Self::Incoming,
            3 => Self::InCall,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEvent {
    Dial,
    Accept,
    Reject,
    Hangup,
    RemoteRequest,
    RemoteAccept,
    RemoteReject,
    RemoteEnd,
    /// Audio devices could not be opened after entering IN_CALL.
    MediaFailed,
}

impl CallEvent {
    fn is_remote(self) -> bool {
        matches!(
            self,
            Self::RemoteRequest | Self::RemoteAccept | Self::RemoteReject | Self::RemoteEnd
        )
    }
}

/// Which side of the call the local audio pipeline runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    SendRequest,
    SendAccept,
    SendReject,
    SendEnd,
    StartAudio(Role),
    StopAudio,
}

/// The transition table. `None` means the event does not apply in `state`.
pub fn transition(state: CallState, event: CallEvent) -> Option<(CallState, Vec<CallAction>)> {
    use CallAction::*;
    use CallEvent::*;
    use CallState::*;
    let next = match (state, event) {
        (Idle, Dial) => (Outgoing, vec![SendRequest]),
        (Idle, RemoteRequest) => (Incoming, vec![]),
        (Outgoing, RemoteAccept) => (InCall, vec![StartAudio(Role::Caller)]),
        (Incoming, Accept) => (InCall, vec![SendAccept, StartAudio(Role::Callee)]),
        (Incoming, Reject) => (Idle, vec![SendReject]),
        (Outgoing | InCall, Hangup) => (Idle, vec![SendEnd, StopAudio]),
        (Outgoing | Incoming | InCall, RemoteReject | RemoteEnd) => (Idle, vec![StopAudio]),
        (InCall, MediaFailed) => (Idle, vec![SendEnd, StopAudio]),
        _ => return None,
    };
    Some(next)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("{event:?} does not apply while {state:?}")]
    NotApplicable { state: CallState, event: CallEvent },
    #[error("no peer to call")]
    NoPeer,
    #[error("signal from {from} ignored: call peer is {peer}")]
    WrongPeer { from: IpAddr, peer: IpAddr },
}

/// Result of an applied event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub from: CallState,
    pub to: CallState,
    pub actions: Vec<CallAction>,
    /// Where signaling replies go.
    pub peer: IpAddr,
}

/// The single call session: state plus the address of the other party.
#[derive(Debug)]
pub struct CallSession {
    state: AtomicU8,
    peer: Mutex<Option<IpAddr>>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CallState::Idle.to_u8()),
            peer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn peer(&self) -> Option<IpAddr> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an event. `addr` is the sender for remote events and the dialed peer for
    /// `Dial`; it is ignored for other local events.
    pub fn apply(&self, event: CallEvent, addr: Option<IpAddr>) -> Result<Applied, CallError> {
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.state();
        let (to, actions) = transition(state, event)
            .ok_or(CallError::NotApplicable { state, event })?;

        let target = match (event, *peer) {
            (CallEvent::Dial, _) | (CallEvent::RemoteRequest, _) => {
                addr.ok_or(CallError::NoPeer)?
            }
            (e, Some(current)) if e.is_remote() => match addr {
                Some(from) if from != current => {
                    return Err(CallError::WrongPeer {
                        from,
                        peer: current,
                    })
                }
                _ => current,
            },
            (_, Some(current)) => current,
            (_, None) => return Err(CallError::NoPeer),
        };

        self.state
            .compare_exchange(state.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| CallError::NotApplicable {
                state: CallState::from_u8(actual),
                event,
            })?;
        *peer = if to == CallState::Idle {
            None
        } else {
            Some(target)
        };
        Ok(Applied {
            from: state,
            to,
            actions,
            peer: target,
        })
    }

    /// Back to IDLE without signaling (shutdown).
    pub fn reset(&self) {
        let mut peer = self.peer.lock().unwrap_or_else(|e| e.into_inner());
        *peer = None;
        self.state.store(CallState::Idle.to_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 42, 129));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 42, 7));

    const STATES: [CallState; 4] = [
        CallState::Idle,
        CallState::Outgoing,
        CallState::Incoming,
        CallState::InCall,
    ];
    const EVENTS: [CallEvent; 9] = [
        CallEvent::Dial,
        CallEvent::Accept,
        CallEvent::Reject,
        CallEvent::Hangup,
        CallEvent::RemoteRequest,
        CallEvent::RemoteAccept,
        CallEvent::RemoteReject,
        CallEvent::RemoteEnd,
        CallEvent::MediaFailed,
    ];

    #[test]
    fn only_listed_transitions_change_state() {
        use CallEvent::*;
        use CallState::*;
        let allowed = [
            (Idle, Dial, Outgoing),
            (Idle, RemoteRequest, Incoming),
            (Outgoing, RemoteAccept, InCall),
            (Incoming, Accept, InCall),
            (Incoming, Reject, Idle),
            (Outgoing, Hangup, Idle),
            (InCall, Hangup, Idle),
            (Outgoing, RemoteReject, Idle),
            (Incoming, RemoteReject, Idle),
            (InCall, RemoteReject, Idle),
            (Outgoing, RemoteEnd, Idle),
            (Incoming, RemoteEnd, Idle),
            (InCall, RemoteEnd, Idle),
            (InCall, MediaFailed, Idle),
        ];
        for s in STATES {
            for e in EVENTS {
                let expected = allowed
                    .iter()
                    .find(|(fs, fe, _)| *fs == s && *fe == e)
                    .map(|(_, _, to)| *to);
                assert_eq!(
                    transition(s, e).map(|(to, _)| to),
                    expected,
                    "{:?} + {:?}",
                    s,
                    e
                );
            }
        }
    }

    #[test]
    fn outgoing_call_flow() {
        let c = CallSession::new();
        let a = c.apply(CallEvent::Dial, Some(PEER)).unwrap();
        assert_eq!(a.actions, vec![CallAction::SendRequest]);
        assert_eq!(a.peer, PEER);
        let a = c.apply(CallEvent::RemoteAccept, Some(PEER)).unwrap();
        assert_eq!(a.actions, vec![CallAction::StartAudio(Role::Caller)]);
        assert_eq!(c.state(), CallState::InCall);
        let a = c.apply(CallEvent::Hangup, None).unwrap();
        assert_eq!(a.actions, vec![CallAction::SendEnd, CallAction::StopAudio]);
        assert_eq!(c.state(), CallState::Idle);
        assert_eq!(c.peer(), None);
    }

    #[test]
    fn incoming_call_flow() {
        let c = CallSession::new();
        c.apply(CallEvent::RemoteRequest, Some(PEER)).unwrap();
        assert_eq!(c.state(), CallState::Incoming);
        let a = c.apply(CallEvent::Accept, None).unwrap();
        assert_eq!(
            a.actions,
            vec![CallAction::SendAccept, CallAction::StartAudio(Role::Callee)]
        );
        assert_eq!(a.peer, PEER);
        c.apply(CallEvent::RemoteEnd, Some(PEER)).unwrap();
        assert_eq!(c.state(), CallState::Idle);
    }

    #[test]
    fn request_while_in_call_is_ignored() {
        let c = CallSession::new();
        c.apply(CallEvent::RemoteRequest, Some(PEER)).unwrap();
        c.apply(CallEvent::Accept, None).unwrap();
        let err = c.apply(CallEvent::RemoteRequest, Some(OTHER)).unwrap_err();
        assert!(matches!(err, CallError::NotApplicable { .. }));
        assert_eq!(c.state(), CallState::InCall);
        assert_eq!(c.peer(), Some(PEER));
    }

    #[test]
    fn accept_while_idle_is_ignored() {
        let c = CallSession::new();
        assert!(c.apply(CallEvent::RemoteAccept, Some(PEER)).is_err());
        assert_eq!(c.state(), CallState::Idle);
    }

    #[test]
    fn end_from_stranger_is_ignored() {
        let c = CallSession::new();
        c.apply(CallEvent::Dial, Some(PEER)).unwrap();
        let err = c.apply(CallEvent::RemoteEnd, Some(OTHER)).unwrap_err();
        assert_eq!(err, CallError::WrongPeer { from: OTHER, peer: PEER });
        assert_eq!(c.state(), CallState::Outgoing);
    }

    #[test]
    fn dial_needs_a_peer() {
        let c = CallSession::new();
        assert_eq!(c.apply(CallEvent::Dial, None), Err(CallError::NoPeer));
        assert_eq!(c.state(), CallState::Idle);
    }

    #[test]
    fn media_failure_forces_idle_and_notifies_peer() {
        let c = CallSession::new();
        c.apply(CallEvent::RemoteRequest, Some(PEER)).unwrap();
        c.apply(CallEvent::Accept, None).unwrap();
        let a = c.apply(CallEvent::MediaFailed, None).unwrap();
        assert!(a.actions.contains(&CallAction::SendEnd));
        assert_eq!(c.state(), CallState::Idle);
    }

    #[test]
    fn concurrent_events_apply_once() {
        let c = std::sync::Arc::new(CallSession::new());
        c.apply(CallEvent::RemoteRequest, Some(PEER)).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = c.clone();
                std::thread::spawn(move || {
                    let event = if i % 2 == 0 {
                        CallEvent::Accept
                    } else {
                        CallEvent::Reject
                    };
                    c.apply(event, None).is_ok()
                })
            })
            .collect();
        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(applied, 1);
    }
}
