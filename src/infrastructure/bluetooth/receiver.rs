//! Platform event intake.
//!
//! Adapters and transports push what the platform tells them into an
//! [`EventReceiver`]; the session drains the other end of the channel on a
//! single consumer, so all state changes are applied one event at a time.

use crate::domain::models::{AdapterState, Peer};
use crate::infrastructure::bluetooth::transport::{AttemptId, LinkHandle};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub enum RadioEvent {
    StateChanged(AdapterState),
    DeviceFound(Peer),
    DiscoveryFinished,
    LinkEstablished {
        attempt: AttemptId,
        link: LinkHandle,
        peer: Peer,
    },
    LinkFailed {
        attempt: AttemptId,
        peer: Peer,
        error: io::Error,
    },
    LinkDropped {
        attempt: AttemptId,
        peer: Peer,
    },
    DataReceived {
        attempt: AttemptId,
        peer: Peer,
        data: Vec<u8>,
    },
}

impl fmt::Debug for RadioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::DeviceFound(peer) => f.debug_tuple("DeviceFound").field(peer).finish(),
            Self::DiscoveryFinished => f.write_str("DiscoveryFinished"),
            Self::LinkEstablished { attempt, peer, .. } => f
                .debug_struct("LinkEstablished")
                .field("attempt", attempt)
                .field("peer", peer)
                .finish_non_exhaustive(),
            Self::LinkFailed {
                attempt,
                peer,
                error,
            } => f
                .debug_struct("LinkFailed")
                .field("attempt", attempt)
                .field("peer", peer)
                .field("error", error)
                .finish(),
            Self::LinkDropped { attempt, peer } => f
                .debug_struct("LinkDropped")
                .field("attempt", attempt)
                .field("peer", peer)
                .finish(),
            Self::DataReceived {
                attempt,
                peer,
                data,
            } => f
                .debug_struct("DataReceived")
                .field("attempt", attempt)
                .field("peer", peer)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Sending half of the session's event channel.
#[derive(Clone)]
pub struct EventReceiver {
    sender: mpsc::UnboundedSender<RadioEvent>,
    attached: Arc<AtomicBool>,
}

impl EventReceiver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                attached: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Forward an event. Returns `false` if it was dropped.
    pub fn post(&self, event: RadioEvent) -> bool {
        if !self.is_attached() {
            debug!("Receiver detached, dropping {:?}", event);
            return false;
        }
        trace!("Posting {:?}", event);
        match self.sender.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!("Session gone, dropping {:?}", event);
                false
            }
        }
    }

    /// Raw platform state broadcast. Unknown codes are not forwarded.
    pub fn state_changed(&self, code: i32) -> bool {
        match AdapterState::from_code(code) {
            Some(state) => self.adapter_state(state),
            None => {
                debug!("Ignoring unknown adapter state code {}", code);
                false
            }
        }
    }

    pub fn adapter_state(&self, state: AdapterState) -> bool {
        self.post(RadioEvent::StateChanged(state))
    }

    pub fn device_found(&self, peer: Peer) -> bool {
        self.post(RadioEvent::DeviceFound(peer))
    }

    pub fn discovery_finished(&self) -> bool {
        self.post(RadioEvent::DiscoveryFinished)
    }

    pub fn link_established(&self, attempt: AttemptId, link: LinkHandle) -> bool {
        let peer = link.peer().clone();
        self.post(RadioEvent::LinkEstablished {
            attempt,
            link,
            peer,
        })
    }

    pub fn link_failed(&self, attempt: AttemptId, peer: Peer, error: io::Error) -> bool {
        self.post(RadioEvent::LinkFailed {
            attempt,
            peer,
            error,
        })
    }

    pub fn link_dropped(&self, attempt: AttemptId, peer: Peer) -> bool {
        self.post(RadioEvent::LinkDropped { attempt, peer })
    }

    pub fn data_received(&self, attempt: AttemptId, peer: Peer, data: Vec<u8>) -> bool {
        self.post(RadioEvent::DataReceived {
            attempt,
            peer,
            data,
        })
    }

    /// Stop forwarding. Shared by every clone of this receiver.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}
