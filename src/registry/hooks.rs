use std::collections::HashMap;

use super::events::ServiceEvent;
use crate::ldap::Filter;
use crate::BundleId;

/// The well-known specification event-listener hooks are registered under.
pub const EVENT_LISTENER_HOOK_SPEC: &str = "pelix.remote.events.EventListenerHook";

/// One registered service-listener's subscription.
#[derive(Clone)]
pub struct ListenerInfo {
    pub token: u64,
    pub bundle_id: BundleId,
    pub spec: Option<String>,
    pub filter: Option<Filter>,
}

/// A read-write view over a `Vec<T>` that can only shrink: no method on
/// this type can grow the underlying vector. A hook receiving one can hide
/// pending listener deliveries but has no way to fabricate new ones.
pub struct ShrinkableList<'a, T> {
    inner: &'a mut Vec<T>,
}

impl<'a, T> ShrinkableList<'a, T> {
    fn new(inner: &'a mut Vec<T>) -> Self {
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.inner.iter()
    }

    pub fn remove(&mut self, index: usize) -> T {
        self.inner.remove(index)
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.inner.retain(f);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// A deletion-only view over a `HashMap<BundleId, Vec<ListenerInfo>>`,
/// grouped by the bundle context that registered each listener.
pub struct ShrinkableMap<'a> {
    inner: &'a mut HashMap<BundleId, Vec<ListenerInfo>>,
}

impl<'a> ShrinkableMap<'a> {
    pub fn new(inner: &'a mut HashMap<BundleId, Vec<ListenerInfo>>) -> Self {
        Self { inner }
    }

    pub fn keys(&self) -> impl Iterator<Item = &BundleId> {
        self.inner.keys()
    }

    pub fn get(&mut self, bundle_id: &BundleId) -> Option<ShrinkableList<'_, ListenerInfo>> {
        self.inner.get_mut(bundle_id).map(ShrinkableList::new)
    }

    pub fn remove(&mut self, bundle_id: &BundleId) {
        self.inner.remove(bundle_id);
    }
}

/// A collaborator authorized to hide (never add) listener deliveries for a
/// service event. Exceptions raised while running a hook are logged and
/// swallowed; they never prevent the event from being delivered to the
/// listeners the hook did not remove.
pub trait EventListenerHook: Send + Sync {
    fn event(&self, event: &ServiceEvent, listeners: &mut ShrinkableMap<'_>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrinkable_list_can_only_shrink() {
        let mut data = vec![1, 2, 3];
        let mut list = ShrinkableList::new(&mut data);
        assert_eq!(list.len(), 3);
        list.retain(|v| *v != 2);
        assert_eq!(list.len(), 2);
        // No push/insert method exists on ShrinkableList: the type itself
        // enforces deletion-only access instead of panicking at runtime.
        assert_eq!(data, vec![1, 3]);
    }
}
