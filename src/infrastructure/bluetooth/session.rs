//! Bluetooth Session Module
//!
//! Owns the radio adapter, the current discovery results and the single
//! active link, and routes platform events to whichever callback is
//! currently registered for each operation.
//!
//! Every public method returns immediately. Results arrive through the
//! registered callbacks, either inline (already-in-state radio requests,
//! scan start, send precondition failures) or later from [`BluetoothSession::dispatch`].
//! Callbacks are never invoked while the session lock is held, so they are
//! free to call back into the session.

use crate::domain::charset;
use crate::domain::error::CbtError;
use crate::domain::models::{AdapterState, LinkStatus, OperationKind, Peer};
use crate::infrastructure::bluetooth::adapter::AdapterHandle;
use crate::infrastructure::bluetooth::callbacks::{
    CallbackRegistry, ConnectCallback, ScanCallback, SendCallback, StateSwitchCallback,
};
use crate::infrastructure::bluetooth::receiver::{EventReceiver, RadioEvent};
use crate::infrastructure::bluetooth::transport::{AttemptId, LinkHandle, Transport};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// An established link, the peer it reaches and the attempt that opened it.
struct Connection {
    attempt: AttemptId,
    link: LinkHandle,
    peer: Peer,
}

impl Connection {
    fn is_active(&self) -> bool {
        self.link.is_open()
    }
}

enum LinkState {
    Idle,
    Connecting { attempt: AttemptId, peer: Peer },
    Connected(Connection),
    Disconnecting,
}

impl LinkState {
    fn status(&self) -> LinkStatus {
        match self {
            Self::Idle => LinkStatus::Idle,
            Self::Connecting { .. } => LinkStatus::Connecting,
            Self::Connected(_) => LinkStatus::Connected,
            Self::Disconnecting => LinkStatus::Disconnecting,
        }
    }
}

/// Discovery notification parked until `on_scan_start` has been delivered.
enum ScanNotice {
    Found(Peer),
    Finished(Vec<Peer>),
}

struct SessionState {
    discovered: Vec<Peer>,
    link: LinkState,
    callbacks: CallbackRegistry,
    last_attempt: u64,
    /// `scan` calls that have not reported their start yet
    starting_scans: usize,
    held_scan: Vec<ScanNotice>,
    closed: bool,
}

struct Inner {
    adapter: AdapterHandle,
    transport: Arc<dyn Transport>,
    events: EventReceiver,
    state: Mutex<SessionState>,
    shutdown: Notify,
}

/// Main coordinator for one radio and at most one connection.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct BluetoothSession {
    inner: Arc<Inner>,
}

impl BluetoothSession {
    /// `events` must be the sending half of the channel later passed to
    /// [`run`](Self::run); the transport posts link events through it.
    pub fn new(
        adapter: AdapterHandle,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                transport,
                events,
                state: Mutex::new(SessionState {
                    discovered: Vec::new(),
                    link: LinkState::Idle,
                    callbacks: CallbackRegistry::new(),
                    last_attempt: 0,
                    starting_scans: 0,
                    held_scan: Vec::new(),
                    closed: false,
                }),
                shutdown: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A panicking callback never runs under this lock, so the data is
        // still consistent if the mutex was poisoned.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Radio power
    // ------------------------------------------------------------------

    /// Turn the radio on and report `true` to `callback` once it is on.
    ///
    /// A radio that is already on is reported inline without a platform
    /// request. A refused request is only logged.
    pub fn enable_radio(&self, callback: Arc<dyn StateSwitchCallback>) {
        if !self.register_state_switch(callback.clone()) {
            return;
        }

        if self.inner.adapter.is_enabled() {
            debug!("Radio already enabled");
            callback.on_state_change(true);
            return;
        }

        info!("Requesting radio enable");
        if !self.inner.adapter.enable() {
            warn!("Adapter did not accept the enable request");
        }
    }

    /// Turn the radio off and report `false` to `callback` once it is off.
    pub fn disable_radio(&self, callback: Arc<dyn StateSwitchCallback>) {
        if !self.register_state_switch(callback.clone()) {
            return;
        }

        if !self.inner.adapter.is_enabled() {
            debug!("Radio already disabled");
            callback.on_state_change(false);
            return;
        }

        info!("Requesting radio disable");
        if !self.inner.adapter.disable() {
            warn!("Adapter did not accept the disable request");
        }
    }

    fn register_state_switch(&self, callback: Arc<dyn StateSwitchCallback>) -> bool {
        let mut state = self.state();
        if state.closed {
            warn!("Radio request ignored: session is shut down");
            return false;
        }
        state.callbacks.register_state_switch(callback);
        true
    }

    /// Current radio power, straight from the adapter.
    pub fn is_enabled(&self) -> bool {
        self.inner.adapter.is_enabled()
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Start a new discovery, discarding the previous result set.
    ///
    /// `on_scan_start` is always the first notification `callback` sees:
    /// peers the adapter reports while the request is still being made are
    /// held back until the start has been delivered. A scan already in
    /// flight is not stopped; its remaining events are delivered to
    /// `callback`.
    pub fn scan(&self, callback: Arc<dyn ScanCallback>) {
        {
            let mut state = self.state();
            if state.closed {
                drop(state);
                warn!("Scan ignored: session is shut down");
                callback.on_scan_start(false);
                return;
            }
            // TODO: consult adapter.is_discovering() and restart discovery
            // instead of letting the old scan's events spill into this one.
            if state.callbacks.register_scan(callback.clone()) {
                debug!("Replaced previous scan subscriber");
            }
            state.discovered.clear();
            state.starting_scans += 1;
        }

        let started = self.inner.adapter.start_discovery();
        info!("Discovery requested, accepted: {}", started);
        callback.on_scan_start(started);
        self.release_held_scan();
    }

    /// Deliver notices parked during `scan`, including any that arrive
    /// while delivering, then stop parking.
    fn release_held_scan(&self) {
        loop {
            let (callback, notices) = {
                let mut state = self.state();
                if state.held_scan.is_empty() {
                    state.starting_scans = state.starting_scans.saturating_sub(1);
                    return;
                }
                (
                    state.callbacks.scan(),
                    std::mem::take(&mut state.held_scan),
                )
            };

            let Some(callback) = callback else {
                continue;
            };
            for notice in notices {
                match notice {
                    ScanNotice::Found(peer) => callback.on_find_device(&peer),
                    ScanNotice::Finished(peers) => callback.on_scan_stop(&peers),
                }
            }
        }
    }

    /// Ask the adapter to stop discovering. The platform's own
    /// finished signal still drives `on_scan_stop`.
    pub fn stop_scan(&self) -> bool {
        if !self.inner.adapter.is_discovering() {
            return false;
        }
        info!("Cancelling discovery");
        self.inner.adapter.cancel_discovery()
    }

    /// Peers found by the current scan, in discovery order.
    pub fn discovered_peers(&self) -> Vec<Peer> {
        self.state().discovered.clone()
    }

    /// Peers the platform already has a pairing with.
    pub fn bonded_peers(&self) -> Vec<Peer> {
        self.inner.adapter.bonded_peers()
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Open a link to `peer`.
    ///
    /// An existing connection is closed first. An attempt still in flight
    /// is not cancelled: if it succeeds before this one, its link is
    /// reported to `callback`; if it fails, the failure is ignored.
    pub fn connect(&self, peer: Peer, callback: Arc<dyn ConnectCallback>) {
        let (attempt, previous) = {
            let mut state = self.state();
            if state.closed {
                drop(state);
                warn!("Connect to {} ignored: session is shut down", peer);
                callback.connect_error(&CbtError::SessionClosed);
                return;
            }
            state.callbacks.register_connect(callback);
            state.last_attempt += 1;
            let attempt = AttemptId(state.last_attempt);
            let connecting = LinkState::Connecting {
                attempt,
                peer: peer.clone(),
            };
            let previous = match std::mem::replace(&mut state.link, connecting) {
                LinkState::Connected(connection) => Some(connection),
                LinkState::Connecting {
                    attempt: pending,
                    peer: target,
                } => {
                    debug!("Superseding pending connect {} to {}", pending, target);
                    None
                }
                LinkState::Idle | LinkState::Disconnecting => None,
            };
            (attempt, previous)
        };

        if let Some(connection) = previous {
            info!("Closing link to {} before reconnecting", connection.peer);
            close_quietly(&connection.link);
        }

        info!("Connecting to {} ({})", peer, attempt);
        self.inner.transport.connect(
            &self.inner.adapter,
            attempt,
            peer,
            self.inner.events.clone(),
        );
    }

    /// Tear down the active link, if any. Always succeeds from the caller's
    /// point of view; close failures are logged.
    pub fn cancel(&self) {
        let connection = {
            let mut state = self.state();
            match std::mem::replace(&mut state.link, LinkState::Idle) {
                LinkState::Connected(connection) => {
                    state.link = LinkState::Disconnecting;
                    Some(connection)
                }
                LinkState::Connecting { attempt, peer } => {
                    info!("Abandoning connect {} to {}", attempt, peer);
                    None
                }
                LinkState::Idle | LinkState::Disconnecting => None,
            }
        };

        let Some(connection) = connection else {
            return;
        };

        info!("Disconnecting from {}", connection.peer);
        close_quietly(&connection.link);

        let mut state = self.state();
        if matches!(state.link, LinkState::Disconnecting) {
            state.link = LinkState::Idle;
        }
    }

    /// Where the connection state machine currently is.
    pub fn link_status(&self) -> LinkStatus {
        self.state().link.status()
    }

    /// `true` while a connection exists and its link is still open.
    pub fn is_connected(&self) -> bool {
        matches!(&self.state().link, LinkState::Connected(c) if c.is_active())
    }

    /// The peer of the current connection, if any.
    pub fn connected_peer(&self) -> Option<Peer> {
        match &self.state().link {
            LinkState::Connected(c) => Some(c.peer.clone()),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    fn active_link(&self) -> Option<LinkHandle> {
        match &self.state().link {
            LinkState::Connected(c) if c.is_active() => Some(c.link.clone()),
            _ => None,
        }
    }

    /// Send one payload. Same contract as [`send_all`](Self::send_all).
    pub fn send(&self, payload: impl Into<Vec<u8>>, callback: Arc<dyn SendCallback>) {
        self.send_all(vec![payload.into()], callback);
    }

    /// Send `payloads` in order over the active link.
    pub fn send_all(&self, payloads: Vec<Vec<u8>>, callback: Arc<dyn SendCallback>) {
        match self.active_link() {
            Some(link) => {
                debug!("Sending {} payload(s) to {}", payloads.len(), link.peer());
                link.send(payloads, callback);
            }
            None => {
                debug!("Send rejected: no active connection");
                callback.send_error(&CbtError::NotConnected);
            }
        }
    }

    /// Encode `text` with the named charset and send it as one payload.
    ///
    /// Only an unknown charset name fails; characters the charset cannot
    /// represent are sent as `?`.
    pub fn send_text(&self, text: &str, charset_name: &str, callback: Arc<dyn SendCallback>) {
        let Some(link) = self.active_link() else {
            debug!("Send rejected: no active connection");
            callback.send_error(&CbtError::NotConnected);
            return;
        };

        match charset::encode(text, charset_name) {
            Ok(body) => link.send(vec![body], callback),
            Err(e) => {
                warn!("Text payload not sent: {}", e);
                callback.send_error(&e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Registry and lifecycle
    // ------------------------------------------------------------------

    /// Drop the subscriber for `kind`. Later events of that kind are ignored.
    pub fn unregister(&self, kind: OperationKind) -> bool {
        self.state().callbacks.unregister(kind)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Release the link, stop discovery, detach from platform events and
    /// forget all callbacks. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.callbacks.clear();
            state.discovered.clear();
            state.held_scan.clear();
        }

        self.cancel();
        if self.inner.adapter.is_discovering() {
            self.inner.adapter.cancel_discovery();
        }
        self.inner.events.detach();
        self.inner.shutdown.notify_one();
        info!("Bluetooth session shut down");
    }

    // ------------------------------------------------------------------
    // Event routing
    // ------------------------------------------------------------------

    /// Consume events until the channel closes or the session shuts down.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<RadioEvent>) {
        info!("Session event loop started");
        while !self.is_closed() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = self.inner.shutdown.notified() => break,
            }
        }
        info!("Session event loop stopped");
    }

    /// Apply every event already queued, without waiting. Returns how many
    /// were handled.
    pub fn pump(&self, events: &mut mpsc::UnboundedReceiver<RadioEvent>) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Apply one event to the session and notify the matching subscriber.
    pub fn dispatch(&self, event: RadioEvent) {
        trace!("Dispatching {:?}", event);

        if self.is_closed() {
            match event {
                RadioEvent::LinkEstablished { link, peer, .. } => {
                    warn!("Closing link to {} established after shutdown", peer);
                    close_quietly(&link);
                }
                other => debug!("Session closed, ignoring {:?}", other),
            }
            return;
        }

        match event {
            RadioEvent::StateChanged(state) => self.on_state_changed(state),
            RadioEvent::DeviceFound(peer) => self.on_device_found(peer),
            RadioEvent::DiscoveryFinished => self.on_discovery_finished(),
            RadioEvent::LinkEstablished {
                attempt,
                link,
                peer,
            } => self.on_link_established(attempt, link, peer),
            RadioEvent::LinkFailed {
                attempt,
                peer,
                error,
            } => self.on_link_failed(attempt, peer, error),
            RadioEvent::LinkDropped { attempt, peer } => self.on_link_dropped(attempt, peer),
            RadioEvent::DataReceived {
                attempt,
                peer,
                data,
            } => self.on_data_received(attempt, peer, data),
        }
    }

    fn on_state_changed(&self, adapter_state: AdapterState) {
        let Some(enabled) = adapter_state.as_switch() else {
            debug!("Ignoring transitional adapter state {:?}", adapter_state);
            return;
        };
        info!("Radio is now {}", if enabled { "on" } else { "off" });

        let callback = self.state().callbacks.state_switch();
        if let Some(callback) = callback {
            callback.on_state_change(enabled);
        }
    }

    fn on_device_found(&self, peer: Peer) {
        let callback = {
            let mut state = self.state();
            if state.discovered.iter().any(|p| p.address == peer.address) {
                trace!("Duplicate discovery of {}", peer.address);
                return;
            }
            state.discovered.push(peer.clone());
            if state.starting_scans > 0 {
                state.held_scan.push(ScanNotice::Found(peer));
                return;
            }
            state.callbacks.scan()
        };

        debug!("Found {}", peer);
        if let Some(callback) = callback {
            callback.on_find_device(&peer);
        }
    }

    fn on_discovery_finished(&self) {
        let (callback, peers) = {
            let mut state = self.state();
            let peers = state.discovered.clone();
            if state.starting_scans > 0 {
                state.held_scan.push(ScanNotice::Finished(peers));
                return;
            }
            (state.callbacks.scan(), peers)
        };

        info!("Discovery finished with {} peer(s)", peers.len());
        if let Some(callback) = callback {
            callback.on_scan_stop(&peers);
        }
    }

    fn on_link_established(&self, attempt: AttemptId, link: LinkHandle, peer: Peer) {
        let accepted = {
            let mut state = self.state();
            match std::mem::replace(&mut state.link, LinkState::Idle) {
                LinkState::Connecting {
                    attempt: current,
                    peer: target,
                } => {
                    if attempt != current {
                        debug!(
                            "Link {} to {} comes from a superseded attempt (waiting for {} to {})",
                            attempt, peer, current, target
                        );
                    }
                    state.link = LinkState::Connected(Connection {
                        attempt,
                        link: link.clone(),
                        peer: peer.clone(),
                    });
                    Ok(state.callbacks.connect())
                }
                LinkState::Connected(current) => {
                    let reason = format!("already connected to {}", current.peer);
                    state.link = LinkState::Connected(current);
                    Err(reason)
                }
                other => {
                    state.link = other;
                    Err("no connect attempt in progress".to_string())
                }
            }
        };

        match accepted {
            Ok(callback) => {
                info!("Connected to {} ({})", peer, attempt);
                if let Some(callback) = callback {
                    callback.connect_success(link, &peer);
                }
            }
            Err(reason) => {
                warn!("Closing unexpected link {} to {}: {}", attempt, peer, reason);
                close_quietly(&link);
            }
        }
    }

    fn on_link_failed(&self, attempt: AttemptId, peer: Peer, error: io::Error) {
        let callback = {
            let mut state = self.state();
            let is_current = matches!(
                &state.link,
                LinkState::Connecting { attempt: current, .. } if *current == attempt
            );
            if !is_current {
                debug!(
                    "Ignoring failure of stale connect {} to {}: {}",
                    attempt, peer, error
                );
                return;
            }
            state.link = LinkState::Idle;
            state.callbacks.connect()
        };

        warn!("Connect to {} failed: {}", peer, error);
        if let Some(callback) = callback {
            callback.connect_error(&CbtError::Transport(error));
        }
    }

    fn on_link_dropped(&self, attempt: AttemptId, peer: Peer) {
        let callback = {
            let mut state = self.state();
            if !matches!(&state.link, LinkState::Connected(c) if c.attempt == attempt) {
                debug!("Ignoring drop of inactive link {} to {}", attempt, peer);
                return;
            }
            state.link = LinkState::Idle;
            state.callbacks.connect()
        };

        info!("Link to {} dropped", peer);
        if let Some(callback) = callback {
            callback.on_disconnected(&peer);
        }
    }

    fn on_data_received(&self, attempt: AttemptId, peer: Peer, data: Vec<u8>) {
        let callback = {
            let state = self.state();
            match &state.link {
                LinkState::Connected(c) if c.attempt == attempt => state.callbacks.connect(),
                _ => None,
            }
        };

        match callback {
            Some(callback) => callback.on_data(&peer, &data),
            None => debug!("Dropping {} byte(s) from {} ({})", data.len(), peer, attempt),
        }
    }
}

fn close_quietly(link: &LinkHandle) {
    if let Err(e) = link.close() {
        warn!("{}", CbtError::Teardown(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::adapter::Adapter;
    use crate::infrastructure::bluetooth::loopback::{LoopbackRadio, LoopbackTransport};
    use crate::infrastructure::bluetooth::transport::Link;

    const PRINTER: &str = "00:1A:7D:DA:71:13";
    const SCANNER: &str = "00:1A:7D:DA:71:14";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        State(bool),
        ScanStart(bool),
        Found(String),
        ScanStop(Vec<String>),
        Connected(String),
        ConnectError(String),
        Data(Vec<u8>),
        Disconnected(String),
        Sent(Vec<u8>),
        SendError(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn push(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StateSwitchCallback for Recorder {
        fn on_state_change(&self, enabled: bool) {
            self.push(Call::State(enabled));
        }
    }

    impl ScanCallback for Recorder {
        fn on_scan_start(&self, started: bool) {
            self.push(Call::ScanStart(started));
        }
        fn on_find_device(&self, peer: &Peer) {
            self.push(Call::Found(peer.address.to_string()));
        }
        fn on_scan_stop(&self, peers: &[Peer]) {
            self.push(Call::ScanStop(
                peers.iter().map(|p| p.address.to_string()).collect(),
            ));
        }
    }

    impl ConnectCallback for Recorder {
        fn connect_success(&self, link: LinkHandle, peer: &Peer) {
            assert_eq!(link.peer(), peer);
            self.push(Call::Connected(peer.address.to_string()));
        }
        fn connect_error(&self, error: &CbtError) {
            self.push(Call::ConnectError(error.to_string()));
        }
        fn on_data(&self, _peer: &Peer, data: &[u8]) {
            self.push(Call::Data(data.to_vec()));
        }
        fn on_disconnected(&self, peer: &Peer) {
            self.push(Call::Disconnected(peer.address.to_string()));
        }
    }

    impl SendCallback for Recorder {
        fn send_success(&self, payload: &[u8]) {
            self.push(Call::Sent(payload.to_vec()));
        }
        fn send_error(&self, error: &CbtError) {
            self.push(Call::SendError(error.to_string()));
        }
    }

    struct Fixture {
        session: BluetoothSession,
        radio: Arc<LoopbackRadio>,
        transport: Arc<LoopbackTransport>,
        rx: mpsc::UnboundedReceiver<RadioEvent>,
    }

    impl Fixture {
        fn new(powered: bool) -> Self {
            let (events, rx) = EventReceiver::channel();
            let radio = Arc::new(if powered {
                LoopbackRadio::powered(events.clone())
            } else {
                LoopbackRadio::new(events.clone())
            });
            let transport = Arc::new(LoopbackTransport::new());
            transport.set_reachable(PRINTER);
            let session = BluetoothSession::new(radio.clone(), transport.clone(), events);
            Self {
                session,
                radio,
                transport,
                rx,
            }
        }

        fn pump(&mut self) -> usize {
            self.session.pump(&mut self.rx)
        }

        fn connected(recorder: &Arc<Recorder>) -> Self {
            let mut fixture = Self::new(true);
            fixture
                .session
                .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
            fixture.pump();
            assert!(fixture.session.is_connected());
            fixture
        }
    }

    fn not_connected() -> Call {
        Call::SendError(CbtError::NotConnected.to_string())
    }

    #[test]
    fn test_enable_when_already_on_reports_inline() {
        let fixture = Fixture::new(true);
        let recorder = Arc::new(Recorder::default());

        fixture.session.enable_radio(recorder.clone());

        assert_eq!(recorder.calls(), vec![Call::State(true)]);
        assert_eq!(fixture.radio.requests().enable, 0);
    }

    #[test]
    fn test_enable_reports_once_after_platform_event() {
        let mut fixture = Fixture::new(false);
        let recorder = Arc::new(Recorder::default());

        fixture.session.enable_radio(recorder.clone());
        assert!(recorder.calls().is_empty());
        assert_eq!(fixture.radio.requests().enable, 1);

        // TurningOn is ignored, On reports true
        assert_eq!(fixture.pump(), 2);
        assert_eq!(recorder.calls(), vec![Call::State(true)]);
    }

    #[test]
    fn test_disable_reports_false() {
        let mut fixture = Fixture::new(true);
        let recorder = Arc::new(Recorder::default());

        fixture.session.disable_radio(recorder.clone());
        fixture.pump();
        assert_eq!(recorder.calls(), vec![Call::State(false)]);

        // Already off: answered inline without another request
        fixture.session.disable_radio(recorder.clone());
        assert_eq!(recorder.calls(), vec![Call::State(false), Call::State(false)]);
        assert_eq!(fixture.radio.requests().disable, 1);
    }

    #[test]
    fn test_denied_enable_stays_silent() {
        let mut fixture = Fixture::new(false);
        fixture.radio.set_deny_requests(true);
        let recorder = Arc::new(Recorder::default());

        fixture.session.enable_radio(recorder.clone());
        assert_eq!(fixture.pump(), 0);
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_transitional_states_are_ignored() {
        let fixture = Fixture::new(true);
        let recorder = Arc::new(Recorder::default());
        assert!(fixture.session.register_state_switch(recorder.clone()));

        fixture.session.dispatch(RadioEvent::StateChanged(AdapterState::TurningOff));
        fixture.session.dispatch(RadioEvent::StateChanged(AdapterState::TurningOn));
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_scan_dedups_by_address() {
        let mut fixture = Fixture::new(true);
        fixture.radio.set_nearby(vec![
            Peer::new(PRINTER, "Printer"),
            Peer::new(SCANNER, "Scanner"),
            Peer::new(PRINTER.to_lowercase().as_str(), "Printer again"),
        ]);
        let recorder = Arc::new(Recorder::default());

        fixture.session.scan(recorder.clone());
        fixture.pump();

        assert_eq!(
            recorder.calls(),
            vec![
                Call::ScanStart(true),
                Call::Found(PRINTER.to_string()),
                Call::Found(SCANNER.to_string()),
                Call::ScanStop(vec![PRINTER.to_string(), SCANNER.to_string()]),
            ]
        );
        assert_eq!(fixture.session.discovered_peers().len(), 2);
    }

    #[test]
    fn test_scan_with_radio_off_reports_not_started() {
        let mut fixture = Fixture::new(false);
        let recorder = Arc::new(Recorder::default());

        fixture.session.scan(recorder.clone());
        assert_eq!(fixture.pump(), 0);
        assert_eq!(recorder.calls(), vec![Call::ScanStart(false)]);
    }

    #[test]
    fn test_new_scan_clears_previous_results() {
        let mut fixture = Fixture::new(true);
        fixture.radio.set_auto_finish(false);
        let recorder = Arc::new(Recorder::default());

        fixture.session.scan(recorder.clone());
        fixture.radio.announce(Peer::new(PRINTER, "Printer"));
        fixture.pump();
        assert_eq!(fixture.session.discovered_peers().len(), 1);

        fixture.session.scan(recorder.clone());
        assert!(fixture.session.discovered_peers().is_empty());

        fixture.radio.announce(Peer::new(SCANNER, "Scanner"));
        fixture.radio.finish_discovery();
        fixture.pump();

        assert_eq!(
            recorder.calls().last(),
            Some(&Call::ScanStop(vec![SCANNER.to_string()]))
        );
    }

    #[test]
    fn test_replaced_scan_callback_receives_nothing() {
        let mut fixture = Fixture::new(true);
        fixture.radio.set_auto_finish(false);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        fixture.session.scan(first.clone());
        fixture.session.scan(second.clone());
        fixture.radio.announce(Peer::new(PRINTER, "Printer"));
        fixture.radio.finish_discovery();
        fixture.pump();

        assert_eq!(first.calls(), vec![Call::ScanStart(true)]);
        assert_eq!(
            second.calls(),
            vec![
                Call::ScanStart(true),
                Call::Found(PRINTER.to_string()),
                Call::ScanStop(vec![PRINTER.to_string()]),
            ]
        );
    }

    #[test]
    fn test_found_after_finish_appends_without_stop() {
        let mut fixture = Fixture::new(true);
        let recorder = Arc::new(Recorder::default());

        fixture.session.scan(recorder.clone());
        fixture.pump();
        fixture.radio.announce(Peer::new(SCANNER, "Scanner"));
        fixture.pump();

        assert_eq!(
            recorder.calls(),
            vec![
                Call::ScanStart(true),
                Call::ScanStop(vec![]),
                Call::Found(SCANNER.to_string()),
            ]
        );
        assert_eq!(fixture.session.discovered_peers().len(), 1);
    }

    #[test]
    fn test_unregistered_scan_still_records_peers() {
        let mut fixture = Fixture::new(true);
        fixture.radio.set_auto_finish(false);
        let recorder = Arc::new(Recorder::default());

        fixture.session.scan(recorder.clone());
        assert!(fixture.session.unregister(OperationKind::Scan));
        fixture.radio.announce(Peer::new(PRINTER, "Printer"));
        fixture.radio.finish_discovery();
        fixture.pump();

        assert_eq!(recorder.calls(), vec![Call::ScanStart(true)]);
        assert_eq!(fixture.session.discovered_peers().len(), 1);
    }

    #[test]
    fn test_stop_scan_cancels_running_discovery() {
        let mut fixture = Fixture::new(true);
        fixture.radio.set_auto_finish(false);
        let recorder = Arc::new(Recorder::default());

        assert!(!fixture.session.stop_scan());
        fixture.session.scan(recorder.clone());
        assert!(fixture.session.stop_scan());
        fixture.pump();

        assert_eq!(recorder.calls().last(), Some(&Call::ScanStop(vec![])));
    }

    #[test]
    fn test_connect_success_creates_connection() {
        let mut fixture = Fixture::new(true);
        fixture.transport.set_manual(true);
        let recorder = Arc::new(Recorder::default());

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        assert_eq!(fixture.session.link_status(), LinkStatus::Connecting);
        assert!(!fixture.session.is_connected());

        fixture.transport.complete_pending();
        fixture.pump();

        assert_eq!(fixture.session.link_status(), LinkStatus::Connected);
        assert_eq!(
            fixture.session.connected_peer().map(|p| p.address.to_string()),
            Some(PRINTER.to_string())
        );
        assert_eq!(recorder.calls(), vec![Call::Connected(PRINTER.to_string())]);
    }

    #[test]
    fn test_connect_failure_is_forwarded() {
        let mut fixture = Fixture::new(true);
        let recorder = Arc::new(Recorder::default());

        fixture
            .session
            .connect(Peer::new(SCANNER, "Scanner"), recorder.clone());
        fixture.pump();

        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);
        match recorder.calls().as_slice() {
            [Call::ConnectError(message)] => assert!(message.contains("not reachable")),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[test]
    fn test_send_without_connection_never_reaches_transport() {
        let fixture = Fixture::new(true);
        let recorder = Arc::new(Recorder::default());

        fixture.session.send(b"one".to_vec(), recorder.clone());
        fixture
            .session
            .send_all(vec![b"a".to_vec(), b"b".to_vec()], recorder.clone());
        fixture.session.send_text("text", "UTF-8", recorder.clone());
        fixture.session.send_text("text", "no-such-charset", recorder.clone());

        assert_eq!(recorder.calls(), vec![not_connected(); 4]);
        assert_eq!(fixture.transport.send_calls(), 0);
    }

    #[test]
    fn test_send_preserves_order() {
        let recorder = Arc::new(Recorder::default());
        let fixture = Fixture::connected(&recorder);

        fixture.session.send(b"first".to_vec(), recorder.clone());
        fixture.session.send_all(
            vec![b"second".to_vec(), b"third".to_vec()],
            recorder.clone(),
        );
        fixture.session.send_text("é", "ISO-8859-1", recorder.clone());

        assert_eq!(
            fixture.transport.sent(),
            vec![
                b"first".to_vec(),
                b"second".to_vec(),
                b"third".to_vec(),
                vec![0xE9],
            ]
        );
    }

    #[test]
    fn test_unknown_charset_is_reported_without_io() {
        let recorder = Arc::new(Recorder::default());
        let fixture = Fixture::connected(&recorder);
        let sender = Arc::new(Recorder::default());

        fixture.session.send_text("hello", "EBCDIC-XYZ", sender.clone());

        match sender.calls().as_slice() {
            [Call::SendError(message)] => assert!(message.starts_with("cannot encode")),
            other => panic!("unexpected calls: {:?}", other),
        }
        assert_eq!(fixture.transport.send_calls(), 0);
    }

    #[test]
    fn test_unmappable_text_is_sent_with_replacements() {
        let recorder = Arc::new(Recorder::default());
        let fixture = Fixture::connected(&recorder);
        let sender = Arc::new(Recorder::default());

        fixture.session.send_text("naïve", "US-ASCII", sender.clone());
        fixture.session.send_text("中", "GBK", sender.clone());

        assert_eq!(
            sender.calls(),
            vec![Call::Sent(b"na?ve".to_vec()), Call::Sent(vec![0xD6, 0xD0])]
        );
    }

    #[test]
    fn test_transport_send_errors_pass_through() {
        let recorder = Arc::new(Recorder::default());
        let fixture = Fixture::connected(&recorder);
        fixture.transport.set_fail_sends(true);
        let sender = Arc::new(Recorder::default());

        fixture.session.send(b"x".to_vec(), sender.clone());

        match sender.calls().as_slice() {
            [Call::SendError(message)] => assert!(message.contains("write failed")),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_clears_connection() {
        let recorder = Arc::new(Recorder::default());
        let fixture = Fixture::connected(&recorder);
        let link = fixture.transport.last_link().unwrap();

        fixture.session.cancel();

        assert!(!link.is_open());
        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);
        fixture.session.send(b"x".to_vec(), recorder.clone());
        assert_eq!(recorder.calls().last(), Some(&not_connected()));
    }

    #[test]
    fn test_cancel_is_safe_when_idle_or_already_closed() {
        let fixture = Fixture::new(true);
        fixture.session.cancel();
        fixture.session.cancel();
        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);

        let recorder = Arc::new(Recorder::default());
        let fixture = Fixture::connected(&recorder);
        // Closing twice makes the session's own close fail; it is only logged
        fixture.transport.last_link().unwrap().close().unwrap();
        fixture.session.cancel();
        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);
    }

    #[test]
    fn test_link_established_after_cancel_is_closed() {
        let mut fixture = Fixture::new(true);
        fixture.transport.set_manual(true);
        let recorder = Arc::new(Recorder::default());

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        fixture.session.cancel();
        fixture.transport.complete_pending();
        fixture.pump();

        assert!(recorder.calls().is_empty());
        assert!(!fixture.transport.last_link().unwrap().is_open());
        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);
    }

    #[test]
    fn test_superseded_connect_lands_on_latest_callback() {
        let mut fixture = Fixture::new(true);
        fixture.transport.set_manual(true);
        fixture.transport.set_reachable(SCANNER);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), first.clone());
        fixture
            .session
            .connect(Peer::new(SCANNER, "Scanner"), second.clone());
        assert_eq!(fixture.transport.complete_pending(), 2);
        fixture.pump();

        // The earlier attempt finishes first and wins; the later link is refused
        assert!(first.calls().is_empty());
        assert_eq!(second.calls(), vec![Call::Connected(PRINTER.to_string())]);
        let links = fixture.transport.links();
        assert!(links[0].is_open());
        assert!(!links[1].is_open());
    }

    #[test]
    fn test_reconnect_closes_existing_link() {
        let recorder = Arc::new(Recorder::default());
        let mut fixture = Fixture::connected(&recorder);
        let old_link = fixture.transport.last_link().unwrap();

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        assert!(!old_link.is_open());
        fixture.pump();

        assert!(fixture.session.is_connected());
        assert_eq!(fixture.transport.links().len(), 2);
    }

    #[test]
    fn test_remote_drop_clears_connection() {
        let recorder = Arc::new(Recorder::default());
        let mut fixture = Fixture::connected(&recorder);

        fixture.transport.last_link().unwrap().deliver(b"ok");
        fixture.transport.last_link().unwrap().drop_remote();
        fixture.pump();

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Connected(PRINTER.to_string()),
                Call::Data(b"ok".to_vec()),
                Call::Disconnected(PRINTER.to_string()),
            ]
        );
        fixture.session.send(b"x".to_vec(), recorder.clone());
        assert_eq!(recorder.calls().last(), Some(&not_connected()));
    }

    #[test]
    fn test_callbacks_may_reenter_session() {
        struct Reentrant {
            session: Mutex<Option<BluetoothSession>>,
            observed: Mutex<Option<bool>>,
        }

        impl ConnectCallback for Reentrant {
            fn connect_success(&self, _link: LinkHandle, _peer: &Peer) {
                if let Some(session) = self.session.lock().unwrap().as_ref() {
                    *self.observed.lock().unwrap() = Some(session.is_connected());
                }
            }
        }

        let mut fixture = Fixture::new(true);
        let callback = Arc::new(Reentrant {
            session: Mutex::new(Some(fixture.session.clone())),
            observed: Mutex::new(None),
        });

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), callback.clone());
        fixture.pump();

        assert_eq!(*callback.observed.lock().unwrap(), Some(true));
        callback.session.lock().unwrap().take();
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let recorder = Arc::new(Recorder::default());
        let mut fixture = Fixture::connected(&recorder);
        let link = fixture.transport.last_link().unwrap();

        fixture.session.shutdown();
        fixture.session.shutdown();

        assert!(fixture.session.is_closed());
        assert!(!link.is_open());

        // Detached: the radio's events no longer reach the session
        fixture.radio.announce(Peer::new(SCANNER, "Scanner"));
        assert_eq!(fixture.pump(), 0);

        let late = Arc::new(Recorder::default());
        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), late.clone());
        fixture.session.scan(late.clone());
        fixture.session.send(b"x".to_vec(), late.clone());
        assert_eq!(
            late.calls(),
            vec![
                Call::ConnectError(CbtError::SessionClosed.to_string()),
                Call::ScanStart(false),
                not_connected(),
            ]
        );
    }

    /// Radio whose discovery reports peers synchronously through the
    /// session, the way a concurrent event loop can.
    struct EagerRadio {
        session: Mutex<Option<BluetoothSession>>,
    }

    impl Adapter for EagerRadio {
        fn is_enabled(&self) -> bool {
            true
        }
        fn enable(&self) -> bool {
            true
        }
        fn disable(&self) -> bool {
            false
        }
        fn start_discovery(&self) -> bool {
            let session = self.session.lock().unwrap().clone();
            if let Some(session) = session {
                session.dispatch(RadioEvent::DeviceFound(Peer::new(PRINTER, "Printer")));
                session.dispatch(RadioEvent::DiscoveryFinished);
            }
            true
        }
        fn cancel_discovery(&self) -> bool {
            false
        }
        fn is_discovering(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_scan_start_precedes_events_reported_during_request() {
        let radio = Arc::new(EagerRadio {
            session: Mutex::new(None),
        });
        let (events, _rx) = EventReceiver::channel();
        let session =
            BluetoothSession::new(radio.clone(), Arc::new(LoopbackTransport::new()), events);
        *radio.session.lock().unwrap() = Some(session.clone());
        let recorder = Arc::new(Recorder::default());

        session.scan(recorder.clone());

        assert_eq!(
            recorder.calls(),
            vec![
                Call::ScanStart(true),
                Call::Found(PRINTER.to_string()),
                Call::ScanStop(vec![PRINTER.to_string()]),
            ]
        );

        // Later events are no longer held back
        session.dispatch(RadioEvent::DeviceFound(Peer::new(SCANNER, "Scanner")));
        assert_eq!(recorder.calls().last(), Some(&Call::Found(SCANNER.to_string())));
        radio.session.lock().unwrap().take();
    }

    #[test]
    fn test_stale_failure_does_not_abort_current_attempt() {
        let mut fixture = Fixture::new(true);
        fixture.transport.set_manual(true);
        let recorder = Arc::new(Recorder::default());

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        assert!(fixture.transport.reject_oldest("busy"));
        fixture.pump();

        assert!(recorder.calls().is_empty());
        assert_eq!(fixture.session.link_status(), LinkStatus::Connecting);

        assert_eq!(fixture.transport.complete_pending(), 1);
        fixture.pump();

        assert_eq!(recorder.calls(), vec![Call::Connected(PRINTER.to_string())]);
        assert!(fixture.session.is_connected());
        assert!(fixture.transport.last_link().unwrap().is_open());
    }

    #[test]
    fn test_current_attempt_failure_is_reported() {
        let mut fixture = Fixture::new(true);
        fixture.transport.set_manual(true);
        let recorder = Arc::new(Recorder::default());

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        assert!(fixture.transport.reject_oldest("busy"));
        fixture.pump();

        assert_eq!(
            recorder.calls(),
            vec![Call::ConnectError("transport failure: busy".to_string())]
        );
        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);
    }

    #[test]
    fn test_events_from_old_link_do_not_touch_new_link() {
        let recorder = Arc::new(Recorder::default());
        let mut fixture = Fixture::connected(&recorder);

        fixture
            .session
            .connect(Peer::new(PRINTER, "Printer"), recorder.clone());
        fixture.pump();
        assert_eq!(fixture.transport.links().len(), 2);

        // Queued by the first link before it was closed
        let peer = Peer::new(PRINTER, "Printer");
        fixture.session.dispatch(RadioEvent::DataReceived {
            attempt: AttemptId(1),
            peer: peer.clone(),
            data: b"stale".to_vec(),
        });
        fixture.session.dispatch(RadioEvent::LinkDropped {
            attempt: AttemptId(1),
            peer,
        });

        assert!(fixture.session.is_connected());
        assert_eq!(
            recorder.calls(),
            vec![
                Call::Connected(PRINTER.to_string()),
                Call::Connected(PRINTER.to_string()),
            ]
        );

        fixture.transport.last_link().unwrap().deliver(b"fresh");
        fixture.pump();
        assert_eq!(recorder.calls().last(), Some(&Call::Data(b"fresh".to_vec())));
    }

    #[test]
    fn test_closed_link_is_not_a_usable_connection() {
        let recorder = Arc::new(Recorder::default());
        let mut fixture = Fixture::connected(&recorder);

        // Remote hung up but the drop has not been dispatched yet
        fixture.transport.last_link().unwrap().drop_remote();
        assert_eq!(fixture.session.link_status(), LinkStatus::Connected);
        assert!(!fixture.session.is_connected());

        fixture.session.send(b"x".to_vec(), recorder.clone());
        assert_eq!(recorder.calls().last(), Some(&not_connected()));

        fixture.pump();
        assert_eq!(fixture.session.link_status(), LinkStatus::Idle);
    }

    #[test]
    fn test_bonded_peers_come_from_adapter() {
        let fixture = Fixture::new(false);
        assert!(fixture.session.bonded_peers().is_empty());

        fixture
            .radio
            .set_bonded(vec![Peer::new(SCANNER, "Paired scanner")]);
        let bonded = fixture.session.bonded_peers();
        assert_eq!(bonded.len(), 1);
        assert_eq!(bonded[0].address.to_string(), SCANNER);
    }

    #[tokio::test]
    async fn test_run_loop_applies_events_until_shutdown() {
        let (events, rx) = EventReceiver::channel();
        let radio = Arc::new(LoopbackRadio::new(events.clone()));
        let transport = Arc::new(LoopbackTransport::new());
        let session = BluetoothSession::new(radio.clone(), transport, events);
        let handle = tokio::spawn(session.clone().run(rx));

        let recorder = Arc::new(Recorder::default());
        session.enable_radio(recorder.clone());
        for _ in 0..100 {
            if !recorder.calls().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.calls(), vec![Call::State(true)]);

        session.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("event loop did not stop")
            .unwrap();
    }
}
