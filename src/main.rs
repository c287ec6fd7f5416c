use anyhow::{Context, Result};
use classic_bt_rust::domain::settings::SettingsService;
use classic_bt_rust::infrastructure::bluetooth::loopback::{LoopbackRadio, LoopbackTransport};
use classic_bt_rust::infrastructure::bluetooth::socket::{SocketConfig, SocketTransport};
use classic_bt_rust::infrastructure::logging;
use classic_bt_rust::{
    BluetoothSession, CbtError, ConnectCallback, EventReceiver, LinkHandle, Peer, ScanCallback,
    SendCallback, StateSwitchCallback, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
enum DemoEvent {
    Radio(bool),
    ScanStarted(bool),
    ScanStopped(Vec<Peer>),
    Connected(Peer),
    ConnectFailed(String),
    Sent(usize),
    SendFailed(String),
}

/// Forwards every callback into the demo's own event queue.
struct Forwarder {
    tx: mpsc::UnboundedSender<DemoEvent>,
}

impl Forwarder {
    fn emit(&self, event: DemoEvent) {
        let _ = self.tx.send(event);
    }
}

impl StateSwitchCallback for Forwarder {
    fn on_state_change(&self, enabled: bool) {
        self.emit(DemoEvent::Radio(enabled));
    }
}

impl ScanCallback for Forwarder {
    fn on_scan_start(&self, started: bool) {
        self.emit(DemoEvent::ScanStarted(started));
    }

    fn on_find_device(&self, peer: &Peer) {
        info!("Found device: {}", peer);
    }

    fn on_scan_stop(&self, peers: &[Peer]) {
        self.emit(DemoEvent::ScanStopped(peers.to_vec()));
    }
}

impl ConnectCallback for Forwarder {
    fn connect_success(&self, _link: LinkHandle, peer: &Peer) {
        self.emit(DemoEvent::Connected(peer.clone()));
    }

    fn connect_error(&self, error: &CbtError) {
        self.emit(DemoEvent::ConnectFailed(error.to_string()));
    }

    fn on_data(&self, peer: &Peer, data: &[u8]) {
        info!("Received {} byte(s) from {}", data.len(), peer);
    }
}

impl SendCallback for Forwarder {
    fn send_success(&self, payload: &[u8]) {
        self.emit(DemoEvent::Sent(payload.len()));
    }

    fn send_error(&self, error: &CbtError) {
        self.emit(DemoEvent::SendFailed(error.to_string()));
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<DemoEvent>) -> Result<DemoEvent> {
    tokio::time::timeout(STEP_TIMEOUT, rx.recv())
        .await
        .context("Timed out waiting for the radio")?
        .context("Demo event queue closed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Classic Bluetooth demo");

    let (events, event_rx) = EventReceiver::channel();
    let radio = LoopbackRadio::new(events.clone());

    let transport: Arc<dyn Transport> = if settings.socket_bridge.is_empty() {
        let nearby = vec![
            Peer::with_raw("00:1A:7D:DA:71:13", "Thermal Printer", 1),
            Peer::with_raw("00:1A:7D:DA:71:14", "Barcode Scanner", 2),
            Peer::with_raw("00:1a:7d:da:71:13", "Thermal Printer", 1),
        ];
        let transport = LoopbackTransport::new();
        transport.set_reachable(nearby[0].address.clone());
        radio.set_bonded(vec![nearby[0].clone()]);
        radio.set_nearby(nearby);
        Arc::new(transport)
    } else {
        info!(
            "Using socket bridge with {} endpoint(s)",
            settings.socket_bridge.len()
        );
        radio.set_nearby(
            settings
                .socket_bridge
                .keys()
                .map(|address| Peer::new(address.as_str(), "Bridged device"))
                .collect(),
        );
        Arc::new(SocketTransport::new(SocketConfig::from_settings(&settings))?)
    };

    let session = BluetoothSession::new(radio.into_handle(), transport, events);
    let event_loop = tokio::spawn(session.clone().run(event_rx));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(Forwarder { tx });

    // 1. Power
    session.enable_radio(forwarder.clone());
    loop {
        match next_event(&mut rx).await? {
            DemoEvent::Radio(true) => break,
            DemoEvent::Radio(false) => anyhow::bail!("Radio reported off"),
            _ => {}
        }
    }
    info!("Radio enabled");
    for peer in session.bonded_peers() {
        info!("Bonded device: {}", peer);
    }

    // 2. Discovery
    session.scan(forwarder.clone());
    let peers = loop {
        match next_event(&mut rx).await? {
            DemoEvent::ScanStarted(false) => anyhow::bail!("Discovery request was rejected"),
            DemoEvent::ScanStopped(peers) => break peers,
            _ => {}
        }
    };
    info!("Discovery finished: {} device(s)", peers.len());

    let Some(peer) = peers.first().cloned() else {
        warn!("Nothing to connect to");
        session.shutdown();
        return Ok(());
    };

    // 3. Connect
    session.connect(peer.clone(), forwarder.clone());
    loop {
        match next_event(&mut rx).await? {
            DemoEvent::Connected(peer) => {
                info!("Connected to {}", peer);
                break;
            }
            DemoEvent::ConnectFailed(e) => {
                warn!("Connection failed: {}", e);
                session.shutdown();
                return Ok(());
            }
            _ => {}
        }
    }

    // 4. Send
    session.send_text("hello", &settings.default_charset, forwarder.clone());
    session.send_all(vec![vec![0x1B, 0x40], b"\r\n".to_vec()], forwarder.clone());
    for _ in 0..3 {
        match next_event(&mut rx).await? {
            DemoEvent::Sent(len) => info!("Sent {} byte(s)", len),
            DemoEvent::SendFailed(e) => warn!("Send failed: {}", e),
            other => warn!("Unexpected event: {:?}", other),
        }
    }

    // 5. Disconnect, then show that sending is refused
    session.cancel();
    session.send(b"late".to_vec(), forwarder.clone());
    if let DemoEvent::SendFailed(e) = next_event(&mut rx).await? {
        info!("Send after cancel refused: {}", e);
    }

    session.shutdown();
    event_loop.await?;
    info!("Demo finished");
    Ok(())
}
