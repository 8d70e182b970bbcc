use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::events::{BundleEvent, ServiceEvent, ServiceEventKind};
use super::hooks::{EventListenerHook, ListenerInfo, ShrinkableMap};
use super::reference::ServiceReference;
use crate::ldap::{Filter, Properties};
use crate::BundleId;

pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent);
}

pub trait BundleListener: Send + Sync {
    fn bundle_changed(&self, event: &BundleEvent);
}

pub trait FrameworkStoppingListener: Send + Sync {
    fn framework_stopping(&self);
}

struct ServiceListenerEntry {
    info: ListenerInfo,
    listener: Arc<dyn ServiceListener>,
}

/// Delivers service/bundle/framework events to registered listeners.
///
/// The dispatcher never calls a listener while holding its internal lock:
/// every `fire_*` method snapshots the relevant listener list, releases
/// the lock, then invokes callbacks. A panicking listener is caught and
/// logged; it never stops delivery to the remaining listeners.
pub struct EventDispatcher {
    next_token: AtomicU64,
    // None-keyed bucket is the "any specification" subscription.
    service_listeners: RwLock<HashMap<Option<String>, Vec<ServiceListenerEntry>>>,
    bundle_listeners: RwLock<Vec<Arc<dyn BundleListener>>>,
    stopping_listeners: RwLock<Vec<Arc<dyn FrameworkStoppingListener>>>,
    hooks: RwLock<Vec<(ServiceReference, Arc<dyn EventListenerHook>)>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            service_listeners: RwLock::new(HashMap::new()),
            bundle_listeners: RwLock::new(Vec::new()),
            stopping_listeners: RwLock::new(Vec::new()),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_service_listener(
        &self,
        bundle_id: BundleId,
        listener: Arc<dyn ServiceListener>,
        spec: Option<String>,
        filter: Option<Filter>,
    ) -> u64 {
        let token = self.next_token.fetch_add(1, AtomicOrdering::SeqCst);
        let info = ListenerInfo {
            token,
            bundle_id,
            spec: spec.clone(),
            filter,
        };
        self.service_listeners
            .write()
            .entry(spec)
            .or_default()
            .push(ServiceListenerEntry { info, listener });
        token
    }

    pub fn remove_service_listener(&self, token: u64) {
        let mut buckets = self.service_listeners.write();
        for entries in buckets.values_mut() {
            entries.retain(|e| e.info.token != token);
        }
        buckets.retain(|_, entries| !entries.is_empty());
    }

    pub fn add_bundle_listener(&self, listener: Arc<dyn BundleListener>) {
        self.bundle_listeners.write().push(listener);
    }

    pub fn add_stopping_listener(&self, listener: Arc<dyn FrameworkStoppingListener>) {
        self.stopping_listeners.write().push(listener);
    }

    pub fn add_hook(&self, reference: ServiceReference, hook: Arc<dyn EventListenerHook>) {
        self.hooks.write().push((reference, hook));
    }

    pub fn remove_hook(&self, reference: &ServiceReference) {
        self.hooks.write().retain(|(r, _)| r != reference);
    }

    pub fn fire_bundle_event(&self, event: BundleEvent) {
        let listeners = self.bundle_listeners.read().clone();
        for listener in listeners {
            let listener = listener.clone();
            let event = event.clone();
            let result = catch_unwind(AssertUnwindSafe(|| listener.bundle_changed(&event)));
            if result.is_err() {
                warn!(bundle_id = event.bundle_id, "bundle listener panicked, swallowing");
            }
        }
    }

    pub fn fire_framework_stopping(&self) {
        let listeners = self.stopping_listeners.read().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.framework_stopping()));
            if result.is_err() {
                warn!("framework-stopping listener panicked, swallowing");
            }
        }
    }

    /// Delivers a service event, applying the event-listener hook pipeline
    /// and per-listener filter logic (including MODIFIED_ENDMATCH
    /// synthesis) described in the design.
    pub fn fire_service_event(&self, kind: ServiceEventKind, reference: ServiceReference, old_props: Option<Properties>) {
        let event = ServiceEvent::new(kind, reference.clone());

        let mut grouped: HashMap<BundleId, Vec<(ListenerInfo, Arc<dyn ServiceListener>)>> = HashMap::new();
        {
            let buckets = self.service_listeners.read();
            let mut seen_tokens = std::collections::HashSet::new();
            let specs = reference.specs();
            for (key, entries) in buckets.iter() {
                let applies = key.is_none() || specs.iter().any(|s| Some(s.clone()) == *key);
                if !applies {
                    continue;
                }
                for entry in entries {
                    if seen_tokens.insert(entry.info.token) {
                        grouped
                            .entry(entry.info.bundle_id)
                            .or_default()
                            .push((entry.info.clone(), entry.listener.clone()));
                    }
                }
            }
        }

        self.apply_hooks(&event, &mut grouped);

        for (_, entries) in grouped {
            for (info, listener) in entries {
                if let Some(delivered) = Self::resolve_delivery(&info, &event, old_props.as_ref()) {
                    let listener = listener.clone();
                    let result = catch_unwind(AssertUnwindSafe(|| listener.service_changed(&delivered)));
                    if result.is_err() {
                        warn!(
                            service_id = delivered.reference.id(),
                            "service listener panicked, swallowing"
                        );
                    }
                }
            }
        }

        debug!(
            service_id = event.reference.id(),
            kind = ?event.kind,
            "service event dispatched"
        );
    }

    /// Decides what, if anything, a given listener should receive for this
    /// event: the event unchanged, a synthesized MODIFIED_ENDMATCH, or
    /// nothing at all.
    fn resolve_delivery(info: &ListenerInfo, event: &ServiceEvent, old_props: Option<&Properties>) -> Option<ServiceEvent> {
        let Some(filter) = &info.filter else {
            return Some(event.clone());
        };

        let current_props = event.reference.get_properties();
        let matches_now = filter.matches(&current_props);

        if matches_now {
            return Some(event.clone());
        }

        if event.kind == ServiceEventKind::Modified {
            if let Some(old) = old_props {
                if filter.matches(old) {
                    return Some(ServiceEvent::new(
                        ServiceEventKind::ModifiedEndmatch,
                        event.reference.clone(),
                    ));
                }
            }
        }

        None
    }

    fn apply_hooks(&self, event: &ServiceEvent, grouped: &mut HashMap<BundleId, Vec<(ListenerInfo, Arc<dyn ServiceListener>)>>) {
        let hooks = self.hooks.read().clone();
        for (hook_ref, hook) in hooks {
            // The single rule from the design: a hook never runs against
            // the very event that references its own service.
            if hook_ref == event.reference {
                continue;
            }

            let mut infos_only: HashMap<BundleId, Vec<ListenerInfo>> =
                grouped.iter().map(|(k, v)| (*k, v.iter().map(|(i, _)| i.clone()).collect())).collect();

            let mut view = ShrinkableMap::new(&mut infos_only);
            let result = catch_unwind(AssertUnwindSafe(|| hook.event(event, &mut view)));
            if result.is_err() {
                warn!("event-listener hook panicked, swallowing");
                continue;
            }

            for (bundle_id, entries) in grouped.iter_mut() {
                let surviving_tokens: std::collections::HashSet<u64> = infos_only
                    .get(bundle_id)
                    .map(|v| v.iter().map(|i| i.token).collect())
                    .unwrap_or_default();
                entries.retain(|(info, _)| surviving_tokens.contains(&info.token));
            }
            grouped.retain(|bundle_id, _| infos_only.contains_key(bundle_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::reference::Scope;
    use std::sync::Mutex;

    struct RecordingListener {
        events: Arc<Mutex<Vec<ServiceEventKind>>>,
    }

    impl ServiceListener for RecordingListener {
        fn service_changed(&self, event: &ServiceEvent) {
            self.events.lock().unwrap().push(event.kind);
        }
    }

    fn make_ref(id: u64, ranking: i64, props: Properties) -> ServiceReference {
        ServiceReference::new(id, 1, vec!["spec.S".to_string()], Scope::Singleton, props, ranking)
    }

    #[test]
    fn delivers_registered_without_filter() {
        let dispatcher = EventDispatcher::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(RecordingListener { events: events.clone() });
        dispatcher.add_service_listener(1, listener, Some("spec.S".to_string()), None);

        let reference = make_ref(1, 0, Properties::new());
        dispatcher.fire_service_event(ServiceEventKind::Registered, reference, None);

        assert_eq!(*events.lock().unwrap(), vec![ServiceEventKind::Registered]);
    }

    #[test]
    fn synthesizes_modified_endmatch() {
        let dispatcher = EventDispatcher::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(RecordingListener { events: events.clone() });
        let filter = Filter::parse("(x=1)").unwrap();
        dispatcher.add_service_listener(1, listener, Some("spec.S".to_string()), Some(filter));

        let mut old_props = Properties::new();
        old_props.insert("x".to_string(), "1".into());
        let mut new_props = Properties::new();
        new_props.insert("x".to_string(), "2".into());

        let reference = make_ref(1, 0, new_props);
        dispatcher.fire_service_event(ServiceEventKind::Modified, reference, Some(old_props));

        assert_eq!(*events.lock().unwrap(), vec![ServiceEventKind::ModifiedEndmatch]);
    }
}
