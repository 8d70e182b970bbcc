use super::reference::ServiceReference;
use crate::BundleId;

/// Kinds of bundle lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleEventKind {
    Installed,
    Starting,
    Started,
    Stopping,
    StoppingPrecleanup,
    Stopped,
    UpdateBegin,
    Updated,
    UpdateFailed,
    Uninstalled,
}

#[derive(Debug, Clone)]
pub struct BundleEvent {
    pub kind: BundleEventKind,
    pub bundle_id: BundleId,
}

/// Kinds of service event. `ModifiedEndmatch` is synthesized by the
/// dispatcher, never passed in by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventKind {
    Registered,
    Modified,
    ModifiedEndmatch,
    Unregistering,
}

#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub reference: ServiceReference,
}

impl ServiceEvent {
    pub fn new(kind: ServiceEventKind, reference: ServiceReference) -> Self {
        Self { kind, reference }
    }
}
