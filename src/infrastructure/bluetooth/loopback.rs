//! Loopback Radio Module
//!
//! An in-process stand-in for the platform radio and socket layer. It
//! behaves like a well-mannered platform: requests return immediately and
//! their outcomes are posted to the session's event channel. Scripted
//! discovery results, request denial, unreachable peers and failing writes
//! can all be configured, which makes it the backbone of the session tests
//! and the demo binary.

use crate::domain::error::CbtError;
use crate::domain::models::{Address, AdapterState, Peer};
use crate::infrastructure::bluetooth::adapter::{Adapter, AdapterHandle};
use crate::infrastructure::bluetooth::callbacks::SendCallback;
use crate::infrastructure::bluetooth::receiver::EventReceiver;
use crate::infrastructure::bluetooth::transport::{AttemptId, Link, Transport};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How often each kind of request reached the radio.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RadioRequests {
    pub enable: usize,
    pub disable: usize,
    pub start_discovery: usize,
    pub cancel_discovery: usize,
}

struct RadioState {
    enabled: bool,
    discovering: bool,
    deny_requests: bool,
    auto_finish: bool,
    nearby: Vec<Peer>,
    bonded: Vec<Peer>,
    requests: RadioRequests,
}

/// Simulated local radio.
pub struct LoopbackRadio {
    events: EventReceiver,
    state: Mutex<RadioState>,
}

impl LoopbackRadio {
    /// A powered-off radio with nothing nearby.
    pub fn new(events: EventReceiver) -> Self {
        Self {
            events,
            state: Mutex::new(RadioState {
                enabled: false,
                discovering: false,
                deny_requests: false,
                auto_finish: true,
                nearby: Vec::new(),
                bonded: Vec::new(),
                requests: RadioRequests::default(),
            }),
        }
    }

    pub fn powered(events: EventReceiver) -> Self {
        let radio = Self::new(events);
        lock(&radio.state).enabled = true;
        radio
    }

    /// Peers reported, in this order, by every discovery run. Duplicates are
    /// reported as given.
    pub fn set_nearby(&self, peers: Vec<Peer>) {
        lock(&self.state).nearby = peers;
    }

    pub fn set_bonded(&self, peers: Vec<Peer>) {
        lock(&self.state).bonded = peers;
    }

    /// Refuse power and discovery requests, like a platform that denies them.
    pub fn set_deny_requests(&self, deny: bool) {
        lock(&self.state).deny_requests = deny;
    }

    /// When disabled, discovery keeps running until [`finish_discovery`](Self::finish_discovery).
    pub fn set_auto_finish(&self, auto_finish: bool) {
        lock(&self.state).auto_finish = auto_finish;
    }

    pub fn requests(&self) -> RadioRequests {
        lock(&self.state).requests
    }

    /// Report one more peer, as if it just answered an inquiry.
    pub fn announce(&self, peer: Peer) {
        self.events.device_found(peer);
    }

    /// End the running discovery and post the platform's finished signal.
    pub fn finish_discovery(&self) {
        lock(&self.state).discovering = false;
        self.events.discovery_finished();
    }

    pub fn into_handle(self) -> AdapterHandle {
        Arc::new(self)
    }

    fn switch_power(&self, on: bool) -> bool {
        {
            let mut state = lock(&self.state);
            if on {
                state.requests.enable += 1;
            } else {
                state.requests.disable += 1;
            }
            if state.deny_requests {
                return false;
            }
            if state.enabled == on {
                return true;
            }
            state.enabled = on;
            if !on {
                state.discovering = false;
            }
        }

        if on {
            self.events.adapter_state(AdapterState::TurningOn);
            self.events.adapter_state(AdapterState::On);
        } else {
            self.events.adapter_state(AdapterState::TurningOff);
            self.events.adapter_state(AdapterState::Off);
        }
        true
    }
}

impl Adapter for LoopbackRadio {
    fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    fn enable(&self) -> bool {
        self.switch_power(true)
    }

    fn disable(&self) -> bool {
        self.switch_power(false)
    }

    fn start_discovery(&self) -> bool {
        let (peers, auto_finish) = {
            let mut state = lock(&self.state);
            state.requests.start_discovery += 1;
            if state.deny_requests || !state.enabled {
                return false;
            }
            state.discovering = true;
            (state.nearby.clone(), state.auto_finish)
        };

        debug!("Loopback discovery reporting {} peer(s)", peers.len());
        for peer in peers {
            self.events.device_found(peer);
        }
        if auto_finish {
            self.finish_discovery();
        }
        true
    }

    fn cancel_discovery(&self) -> bool {
        {
            let mut state = lock(&self.state);
            state.requests.cancel_discovery += 1;
            if !state.discovering {
                return false;
            }
        }
        self.finish_discovery();
        true
    }

    fn is_discovering(&self) -> bool {
        lock(&self.state).discovering
    }

    fn bonded_peers(&self) -> Vec<Peer> {
        lock(&self.state).bonded.clone()
    }
}

// ----------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------

/// Shared between the transport and every link it hands out.
#[derive(Default)]
struct Wire {
    outbox: Mutex<Vec<Vec<u8>>>,
    send_calls: AtomicUsize,
    fail_sends: AtomicBool,
}

/// Simulated link. Writes land in the owning transport's outbox.
pub struct LoopbackLink {
    attempt: AttemptId,
    peer: Peer,
    open: AtomicBool,
    wire: Arc<Wire>,
    events: EventReceiver,
}

impl LoopbackLink {
    /// Simulate the remote side hanging up.
    pub fn drop_remote(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Loopback link to {} dropped by remote", self.peer);
            self.events.link_dropped(self.attempt, self.peer.clone());
        }
    }

    /// Simulate the remote side writing `data`.
    pub fn deliver(&self, data: &[u8]) {
        if self.open.load(Ordering::SeqCst) {
            self.events
                .data_received(self.attempt, self.peer.clone(), data.to_vec());
        }
    }
}

impl Link for LoopbackLink {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, payloads: Vec<Vec<u8>>, callback: Arc<dyn SendCallback>) {
        self.wire.send_calls.fetch_add(1, Ordering::SeqCst);

        if !self.is_open() {
            callback.send_error(&CbtError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "link closed",
            )));
            return;
        }

        for payload in payloads {
            if self.wire.fail_sends.load(Ordering::SeqCst) {
                callback.send_error(&CbtError::Transport(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write failed",
                )));
                continue;
            }
            lock(&self.wire.outbox).push(payload.clone());
            callback.send_success(&payload);
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "link already closed",
            ))
        }
    }
}

struct PendingConnect {
    attempt: AttemptId,
    peer: Peer,
    events: EventReceiver,
}

/// Simulated socket layer.
///
/// Peers must be marked reachable to connect. In manual mode connect
/// attempts stay pending until [`complete_pending`](Self::complete_pending),
/// which lets tests observe the `Connecting` state.
#[derive(Default)]
pub struct LoopbackTransport {
    reachable: Mutex<HashSet<Address>>,
    manual: AtomicBool,
    pending: Mutex<Vec<PendingConnect>>,
    links: Mutex<Vec<Arc<LoopbackLink>>>,
    wire: Arc<Wire>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, address: impl Into<Address>) {
        lock(&self.reachable).insert(address.into());
    }

    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::SeqCst);
    }

    /// Make every write fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.wire.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Resolve pending attempts in the order they were made.
    pub fn complete_pending(&self) -> usize {
        let pending: Vec<PendingConnect> = lock(&self.pending).drain(..).collect();
        let count = pending.len();
        for attempt in pending {
            self.resolve(attempt);
        }
        count
    }

    /// Fail the oldest pending attempt with `reason`. Returns `false` if
    /// nothing was pending.
    pub fn reject_oldest(&self, reason: &str) -> bool {
        let attempt = {
            let mut pending = lock(&self.pending);
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        let PendingConnect {
            attempt,
            peer,
            events,
        } = attempt;
        events.link_failed(attempt, peer, io::Error::new(io::ErrorKind::Other, reason));
        true
    }

    /// Number of `Link::send` calls that reached the transport.
    pub fn send_calls(&self) -> usize {
        self.wire.send_calls.load(Ordering::SeqCst)
    }

    /// Everything written so far, across all links.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.wire.outbox).clone()
    }

    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        lock(&self.links).clone()
    }

    pub fn last_link(&self) -> Option<Arc<LoopbackLink>> {
        lock(&self.links).last().cloned()
    }

    fn resolve(&self, attempt: PendingConnect) {
        let PendingConnect {
            attempt,
            peer,
            events,
        } = attempt;
        if !lock(&self.reachable).contains(&peer.address) {
            debug!("Loopback peer {} unreachable", peer);
            events.link_failed(
                attempt,
                peer.clone(),
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("{} is not reachable", peer.address),
                ),
            );
            return;
        }

        let link = Arc::new(LoopbackLink {
            attempt,
            peer,
            open: AtomicBool::new(true),
            wire: self.wire.clone(),
            events: events.clone(),
        });
        lock(&self.links).push(link.clone());
        events.link_established(attempt, link);
    }
}

impl Transport for LoopbackTransport {
    fn connect(
        &self,
        _adapter: &AdapterHandle,
        attempt: AttemptId,
        peer: Peer,
        events: EventReceiver,
    ) {
        let attempt = PendingConnect {
            attempt,
            peer,
            events,
        };
        if self.manual.load(Ordering::SeqCst) {
            lock(&self.pending).push(attempt);
        } else {
            self.resolve(attempt);
        }
    }
}
