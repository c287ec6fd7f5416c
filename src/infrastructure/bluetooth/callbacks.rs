//! Caller-supplied callbacks and the per-operation registry that holds them.

use crate::domain::error::CbtError;
use crate::domain::models::{OperationKind, Peer};
use crate::infrastructure::bluetooth::transport::LinkHandle;
use std::sync::Arc;

/// Receives radio power changes requested through `enable_radio` / `disable_radio`.
pub trait StateSwitchCallback: Send + Sync {
    fn on_state_change(&self, enabled: bool);
}

impl<F> StateSwitchCallback for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_state_change(&self, enabled: bool) {
        self(enabled)
    }
}

/// Receives discovery progress for the scan that registered it.
pub trait ScanCallback: Send + Sync {
    /// Whether the adapter accepted the discovery request
    fn on_scan_start(&self, started: bool);

    /// A peer not yet seen during this scan
    fn on_find_device(&self, peer: &Peer);

    /// The platform finished discovery; `peers` is in discovery order
    fn on_scan_stop(&self, peers: &[Peer]);
}

pub trait ConnectCallback: Send + Sync {
    fn connect_success(&self, link: LinkHandle, peer: &Peer);

    /// Transport-reported connect failure, forwarded without interpretation
    fn connect_error(&self, _error: &CbtError) {}

    /// Bytes read from the active link
    fn on_data(&self, _peer: &Peer, _data: &[u8]) {}

    /// The transport reported that the active link went away
    fn on_disconnected(&self, _peer: &Peer) {}
}

pub trait SendCallback: Send + Sync {
    fn send_success(&self, _payload: &[u8]) {}

    fn send_error(&self, error: &CbtError);
}

impl<F> SendCallback for F
where
    F: Fn(&CbtError) + Send + Sync,
{
    fn send_error(&self, error: &CbtError) {
        self(error)
    }
}

/// One subscriber slot per [`OperationKind`].
///
/// Registering replaces whatever was in the slot; there are no subscriber
/// lists. A replaced callback is dropped from the registry immediately and
/// is never handed out again.
#[derive(Default)]
pub struct CallbackRegistry {
    state_switch: Option<Arc<dyn StateSwitchCallback>>,
    scan: Option<Arc<dyn ScanCallback>>,
    connect: Option<Arc<dyn ConnectCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a previous subscriber was displaced.
    pub fn register_state_switch(&mut self, callback: Arc<dyn StateSwitchCallback>) -> bool {
        self.state_switch.replace(callback).is_some()
    }

    pub fn register_scan(&mut self, callback: Arc<dyn ScanCallback>) -> bool {
        self.scan.replace(callback).is_some()
    }

    pub fn register_connect(&mut self, callback: Arc<dyn ConnectCallback>) -> bool {
        self.connect.replace(callback).is_some()
    }

    /// Clear a slot. Returns `true` if it held a subscriber.
    pub fn unregister(&mut self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::StateSwitch => self.state_switch.take().is_some(),
            OperationKind::Scan => self.scan.take().is_some(),
            OperationKind::Connect => self.connect.take().is_some(),
        }
    }

    pub fn is_registered(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::StateSwitch => self.state_switch.is_some(),
            OperationKind::Scan => self.scan.is_some(),
            OperationKind::Connect => self.connect.is_some(),
        }
    }

    pub fn state_switch(&self) -> Option<Arc<dyn StateSwitchCallback>> {
        self.state_switch.clone()
    }

    pub fn scan(&self) -> Option<Arc<dyn ScanCallback>> {
        self.scan.clone()
    }

    pub fn connect(&self) -> Option<Arc<dyn ConnectCallback>> {
        self.connect.clone()
    }

    pub fn clear(&mut self) {
        self.state_switch = None;
        self.scan = None;
        self.connect = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_replaces_previous() {
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let mut registry = CallbackRegistry::new();
        let hits = first_hits.clone();
        assert!(!registry.register_state_switch(Arc::new(move |_: bool| {
            hits.fetch_add(1, Ordering::SeqCst);
        })));
        let hits = second_hits.clone();
        assert!(registry.register_state_switch(Arc::new(move |_: bool| {
            hits.fetch_add(1, Ordering::SeqCst);
        })));

        if let Some(cb) = registry.state_switch() {
            cb.on_state_change(true);
        }

        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_clears_only_that_slot() {
        let mut registry = CallbackRegistry::new();
        registry.register_state_switch(Arc::new(|_: bool| {}));

        assert!(!registry.unregister(OperationKind::Scan));
        assert!(registry.unregister(OperationKind::StateSwitch));
        assert!(!registry.is_registered(OperationKind::StateSwitch));
        assert!(registry.state_switch().is_none());
    }
}
