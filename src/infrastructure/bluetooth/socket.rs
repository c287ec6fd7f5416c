//! Socket Bridge Transport
//!
//! Carries serial-profile links over TCP, one bridge endpoint per peer
//! address (see `Settings::socket_bridge`). Useful against emulators and
//! radio bridges that expose each remote device as a TCP port.
//!
//! All socket work runs on a dedicated thread with its own runtime, so a
//! slow connect or write never blocks the caller or the session's event
//! loop. Links stay usable for as long as the transport is alive.

use crate::domain::error::CbtError;
use crate::domain::models::{Address, Peer};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::AdapterHandle;
use crate::infrastructure::bluetooth::callbacks::SendCallback;
use crate::infrastructure::bluetooth::receiver::EventReceiver;
use crate::infrastructure::bluetooth::transport::{AttemptId, Link, Transport};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Connection parameters for the bridge
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub endpoints: HashMap<Address, String>,
    /// Service record the bridge is expected to expose
    pub service_uuid: String,
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
}

impl SocketConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            endpoints: settings
                .socket_bridge
                .iter()
                .map(|(address, endpoint)| (Address::new(address), endpoint.clone()))
                .collect(),
            service_uuid: settings.service_uuid.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            read_buffer_size: settings.read_buffer_size.max(1),
        }
    }
}

struct ConnectRequest {
    attempt: AttemptId,
    peer: Peer,
    endpoint: Option<String>,
    events: EventReceiver,
}

struct WriteJob {
    payloads: Vec<Vec<u8>>,
    callback: Arc<dyn SendCallback>,
}

pub struct SocketLink {
    peer: Peer,
    open: Arc<AtomicBool>,
    jobs: Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    closed: Arc<Notify>,
}

impl Link for SocketLink {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, payloads: Vec<Vec<u8>>, callback: Arc<dyn SendCallback>) {
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let job = WriteJob { payloads, callback };
        let rejected = match jobs {
            Some(jobs) if self.is_open() => match jobs.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            _ => job,
        };

        rejected
            .callback
            .send_error(&CbtError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "link closed",
            )));
    }

    fn close(&self) -> io::Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "link already closed",
            ));
        }

        // Dropping the queue ends the writer; the notify ends the reader.
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.notify_one();
        debug!("Closed socket link to {}", self.peer);
        Ok(())
    }
}

pub struct SocketTransport {
    config: SocketConfig,
    requests: mpsc::UnboundedSender<ConnectRequest>,
}

impl SocketTransport {
    /// Start the I/O thread.
    pub fn new(config: SocketConfig) -> io::Result<Self> {
        let (requests, mut rx) = mpsc::unbounded_channel::<ConnectRequest>();
        let timeout = config.connect_timeout;
        let buffer_size = config.read_buffer_size;

        std::thread::Builder::new()
            .name("bt-socket-io".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create runtime for socket transport: {}", e);
                        return;
                    }
                };

                rt.block_on(async move {
                    while let Some(request) = rx.recv().await {
                        tokio::spawn(open_link(request, timeout, buffer_size));
                    }
                    debug!("Socket transport stopped");
                });
            })?;

        info!(
            "Socket bridge ready: {} endpoint(s), service {}",
            config.endpoints.len(),
            config.service_uuid
        );
        Ok(Self { config, requests })
    }
}

impl Transport for SocketTransport {
    fn connect(
        &self,
        adapter: &AdapterHandle,
        attempt: AttemptId,
        peer: Peer,
        events: EventReceiver,
    ) {
        if !adapter.is_enabled() {
            events.link_failed(
                attempt,
                peer,
                io::Error::new(io::ErrorKind::Other, "radio is turned off"),
            );
            return;
        }

        let endpoint = self.config.endpoints.get(&peer.address).cloned();
        let request = ConnectRequest {
            attempt,
            peer,
            endpoint,
            events,
        };
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            request.events.link_failed(
                request.attempt,
                request.peer,
                io::Error::new(io::ErrorKind::Other, "socket transport stopped"),
            );
        }
    }
}

async fn open_link(request: ConnectRequest, timeout: Duration, buffer_size: usize) {
    let ConnectRequest {
        attempt,
        peer,
        endpoint,
        events,
    } = request;

    let Some(endpoint) = endpoint else {
        events.link_failed(
            attempt,
            peer.clone(),
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no bridge endpoint for {}", peer.address),
            ),
        );
        return;
    };

    info!("Opening bridge link to {} via {}", peer, endpoint);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(endpoint.as_str())).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Bridge connect to {} failed: {}", endpoint, e);
            events.link_failed(attempt, peer, e);
            return;
        }
        Err(_) => {
            warn!("Bridge connect to {} timed out", endpoint);
            events.link_failed(
                attempt,
                peer,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            );
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle on {}: {}", endpoint, e);
    }

    let (mut reader, mut writer) = stream.into_split();
    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<WriteJob>();
    let open = Arc::new(AtomicBool::new(true));
    let closed = Arc::new(Notify::new());

    let link = Arc::new(SocketLink {
        peer: peer.clone(),
        open: open.clone(),
        jobs: Mutex::new(Some(jobs_tx)),
        closed: closed.clone(),
    });

    tokio::spawn(async move {
        while let Some(job) = jobs_rx.recv().await {
            for payload in &job.payloads {
                match writer.write_all(payload).await {
                    Ok(()) => job.callback.send_success(payload),
                    Err(e) => job.callback.send_error(&CbtError::Transport(e)),
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Bridge writer shutdown failed: {}", e);
        }
    });

    let reader_events = events.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            tokio::select! {
                _ = closed.notified() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        if open.swap(false, Ordering::SeqCst) {
                            reader_events.link_dropped(attempt, peer.clone());
                        }
                        break;
                    }
                    Ok(n) => {
                        reader_events.data_received(attempt, peer.clone(), buf[..n].to_vec());
                    }
                    Err(e) => {
                        warn!("Read from {} failed: {}", peer, e);
                        if open.swap(false, Ordering::SeqCst) {
                            reader_events.link_dropped(attempt, peer.clone());
                        }
                        break;
                    }
                },
            }
        }
    });

    events.link_established(attempt, link);
}
