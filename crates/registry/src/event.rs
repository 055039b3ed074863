use netmesh_store::Version;

/// What kind of change a network underwent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetworkEventKind {
    /// The network was created.
    Added,

    /// The network's membership changed.
    Updated,

    /// The network was deleted.
    Removed,
}

/// A change to a network, as observed through the replicated store's
/// change feed. Carries no payload beyond the identity of what changed;
/// subscribers re-read current state if they need the value.
#[derive(Clone, Debug)]
pub struct NetworkEvent {
    /// The kind of change.
    pub kind: NetworkEventKind,

    /// The network that changed.
    pub network: String,

    /// The store version at which the change was observed.
    pub version: Version,
}

/// A subscriber to network events.
///
/// Delivery happens on a dedicated dispatch task, decoupled from the
/// mutation that produced the event, so implementations may do real work
/// here without blocking writers.
pub trait NetworkListener: Send + Sync + 'static {
    /// Called once per event, in arrival order.
    fn deliver(&self, event: NetworkEvent);
}
