//! Socket-level collaborator seam.

use crate::domain::models::Peer;
use crate::infrastructure::bluetooth::adapter::AdapterHandle;
use crate::infrastructure::bluetooth::callbacks::SendCallback;
use crate::infrastructure::bluetooth::receiver::EventReceiver;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Identifies one `connect` call within a session.
///
/// The transport echoes it back with every event about the attempt and
/// about the link it produced, so the session can tell a superseded attempt
/// or an old link to the same peer from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An established link to one peer.
pub trait Link: Send + Sync {
    fn peer(&self) -> &Peer;

    fn is_open(&self) -> bool;

    /// Queue `payloads` for writing in order. Results are reported through
    /// `callback`, per payload, from the transport's own execution context.
    fn send(&self, payloads: Vec<Vec<u8>>, callback: Arc<dyn SendCallback>);

    /// Close the link. Closing twice may fail; callers log and move on.
    fn close(&self) -> io::Result<()>;
}

pub type LinkHandle = Arc<dyn Link>;

/// Opens links.
///
/// `connect` must return immediately. The outcome is posted to `events` as
/// `LinkEstablished` or `LinkFailed`; a later remote disconnect is posted as
/// `LinkDropped` and inbound bytes as `DataReceived`. Every one of those
/// events carries `attempt`.
pub trait Transport: Send + Sync {
    fn connect(
        &self,
        adapter: &AdapterHandle,
        attempt: AttemptId,
        peer: Peer,
        events: EventReceiver,
    );
}
