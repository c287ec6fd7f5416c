//! Platform radio adapter seam.

use crate::domain::models::Peer;
use std::sync::Arc;

/// Control surface of the local radio.
///
/// Requests are fire-and-forget: the returned `bool` only says whether the
/// platform accepted the request. Outcomes (power state changes, discovered
/// peers, discovery finishing) arrive later through the
/// [`EventReceiver`](super::receiver::EventReceiver) the adapter was built with.
pub trait Adapter: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn enable(&self) -> bool;

    fn disable(&self) -> bool;

    fn start_discovery(&self) -> bool;

    fn cancel_discovery(&self) -> bool;

    fn is_discovering(&self) -> bool;

    /// Peers already paired with this adapter
    fn bonded_peers(&self) -> Vec<Peer> {
        Vec::new()
    }
}

pub type AdapterHandle = Arc<dyn Adapter>;
