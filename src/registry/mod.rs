//! The authoritative map of published services: ranking-sorted lookup per
//! specification, factory/prototype scoping, and usage counting.

pub mod dispatcher;
pub mod events;
pub mod hooks;
pub mod reference;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

pub use dispatcher::{BundleListener, EventDispatcher, FrameworkStoppingListener, ServiceListener};
pub use events::{BundleEvent, BundleEventKind, ServiceEvent, ServiceEventKind};
pub use hooks::{EventListenerHook, ListenerInfo, ShrinkableList, ShrinkableMap};
pub use reference::{FactoryCounter, PrototypeServiceFactory, Scope, ServiceFactory, ServiceReference};

use crate::error::{Result, RuntimeError};
use crate::ldap::{Filter, Properties, PropertyValue};
use crate::{BundleId, ServiceId};

/// What a registrant hands the registry: a plain instance, or a factory
/// that produces one instance per consuming bundle or per `get_service`
/// call.
pub enum Provider {
    Instance(Arc<dyn Any + Send + Sync>),
    BundleFactory(Arc<dyn ServiceFactory>),
    PrototypeFactory(Arc<dyn PrototypeServiceFactory>),
}

enum StoredProvider {
    Instance(Arc<dyn Any + Send + Sync>),
    BundleFactory(Arc<dyn ServiceFactory>),
    PrototypeFactory(Arc<dyn PrototypeServiceFactory>),
}

struct RegistryState {
    dispatcher: Arc<EventDispatcher>,
    next_id: AtomicU64,
    maps: Mutex<RegistryMaps>,
}

#[derive(Default)]
struct RegistryMaps {
    by_id: HashMap<ServiceId, ServiceReference>,
    by_spec: HashMap<String, Vec<ServiceReference>>,
    by_bundle: HashMap<BundleId, HashSet<ServiceId>>,
    pending: HashMap<ServiceId, ServiceReference>,
    providers: HashMap<ServiceId, StoredProvider>,
    usage: HashMap<(BundleId, ServiceId), u32>,
    factory_counters: HashMap<(BundleId, ServiceId), FactoryCounter>,
}

/// The service registry. Cheap to clone (an `Arc` around the shared
/// state); every `BundleContext` that talks to the same framework holds
/// one.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryState>,
}

/// The registrant's handle: lets the owner update properties or withdraw
/// the service later.
#[derive(Clone)]
pub struct ServiceRegistration {
    registry: ServiceRegistry,
    reference: ServiceReference,
}

const FORBIDDEN_KEYS: &[&str] = &["objectClass", "service.id"];

impl ServiceRegistration {
    pub fn get_reference(&self) -> ServiceReference {
        self.reference.clone()
    }

    /// Merges `updates` into the service's property map. `objectClass` and
    /// `service.id` are silently dropped (§7 `UpdateRejected` is not an
    /// error: it is filtered here before anything is committed or any
    /// event fires). A `service.ranking` value that does not coerce to an
    /// integer is dropped rather than rejecting the whole call. A no-op
    /// update (nothing actually changed) fires no event at all.
    pub fn set_properties(&self, updates: Properties) -> Result<()> {
        self.registry.apply_property_update(&self.reference, updates)
    }

    pub fn unregister(&self) -> Result<()> {
        self.registry.unregister(&self.reference)
    }
}

impl ServiceRegistry {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            inner: Arc::new(RegistryState {
                dispatcher,
                next_id: AtomicU64::new(1),
                maps: Mutex::new(RegistryMaps::default()),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.inner.dispatcher
    }

    #[instrument(skip(self, properties, provider), fields(specs = ?specs))]
    pub fn register(
        &self,
        bundle_id: BundleId,
        specs: Vec<String>,
        mut properties: Properties,
        provider: Provider,
    ) -> Result<ServiceRegistration> {
        if specs.is_empty() {
            return Err(RuntimeError::MandatoryMissing("objectClass".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let scope = match &provider {
            Provider::Instance(_) => Scope::Singleton,
            Provider::BundleFactory(_) => Scope::Bundle,
            Provider::PrototypeFactory(_) => Scope::Prototype,
        };
        let ranking = coerce_ranking(properties.remove("service.ranking")).unwrap_or(0);

        for key in FORBIDDEN_KEYS {
            properties.remove(*key);
        }
        properties.insert(
            "objectClass".to_string(),
            PropertyValue::List(specs.iter().cloned().map(PropertyValue::Str).collect()),
        );
        properties.insert("service.id".to_string(), PropertyValue::Int(id as i64));
        properties.insert("service.bundleid".to_string(), PropertyValue::Int(bundle_id as i64));
        properties.insert("service.scope".to_string(), PropertyValue::Str(scope.as_str().to_string()));
        properties.insert("service.ranking".to_string(), PropertyValue::Int(ranking));

        let reference = ServiceReference::new(id, bundle_id, specs.clone(), scope, properties, ranking);

        let stored = match provider {
            Provider::Instance(i) => StoredProvider::Instance(i),
            Provider::BundleFactory(f) => StoredProvider::BundleFactory(f),
            Provider::PrototypeFactory(f) => StoredProvider::PrototypeFactory(f),
        };

        {
            let mut maps = self.inner.maps.lock();
            maps.by_id.insert(id, reference.clone());
            for spec in &specs {
                let list = maps.by_spec.entry(spec.clone()).or_default();
                let pos = list.binary_search(&reference).unwrap_or_else(|p| p);
                list.insert(pos, reference.clone());
            }
            maps.by_bundle.entry(bundle_id).or_default().insert(id);
            maps.providers.insert(id, stored);
        }

        debug!(service_id = id, "service registered");
        self.inner
            .dispatcher
            .fire_service_event(ServiceEventKind::Registered, reference.clone(), None);

        Ok(ServiceRegistration {
            registry: self.clone(),
            reference,
        })
    }

    fn apply_property_update(&self, reference: &ServiceReference, updates: Properties) -> Result<()> {
        let old_props = reference.get_properties();
        let mut new_props = old_props.clone();
        let mut changed = false;

        for (key, value) in updates {
            if FORBIDDEN_KEYS.contains(&key.as_str()) {
                continue;
            }
            let value = if key == "service.ranking" {
                match coerce_ranking(Some(value)) {
                    Some(r) => PropertyValue::Int(r),
                    None => continue,
                }
            } else {
                value
            };
            if new_props.get(&key) != Some(&value) {
                changed = true;
                new_props.insert(key, value);
            }
        }

        if !changed {
            return Ok(());
        }

        let new_ranking = match new_props.get("service.ranking") {
            Some(PropertyValue::Int(r)) => *r,
            _ => reference.ranking(),
        };
        let ranking_changed = new_ranking != reference.ranking();

        reference.replace_properties(new_props, new_ranking);

        if ranking_changed {
            self.resort(reference);
        }

        self.inner.dispatcher.fire_service_event(
            ServiceEventKind::Modified,
            reference.clone(),
            Some(old_props),
        );
        Ok(())
    }

    fn resort(&self, reference: &ServiceReference) {
        let mut maps = self.inner.maps.lock();
        for spec in reference.specs().to_vec() {
            if let Some(list) = maps.by_spec.get_mut(&spec) {
                if let Some(pos) = list.iter().position(|r| r == reference) {
                    list.remove(pos);
                }
                let pos = list.binary_search(reference).unwrap_or_else(|p| p);
                list.insert(pos, reference.clone());
            }
        }
    }

    #[instrument(skip(self))]
    pub fn unregister(&self, reference: &ServiceReference) -> Result<()> {
        let id = reference.id();

        {
            let mut maps = self.inner.maps.lock();
            if let Some(pending_ref) = maps.pending.remove(&id) {
                drop(maps);
                self.inner
                    .dispatcher
                    .fire_service_event(ServiceEventKind::Unregistering, pending_ref, None);
                return Ok(());
            }
            if !maps.by_id.contains_key(&id) {
                return Err(RuntimeError::UnknownService(id));
            }
        }

        self.inner
            .dispatcher
            .fire_service_event(ServiceEventKind::Unregistering, reference.clone(), None);

        let mut maps = self.inner.maps.lock();
        maps.by_id.remove(&id);
        for spec in reference.specs() {
            if let Some(list) = maps.by_spec.get_mut(spec) {
                list.retain(|r| r.id() != id);
            }
        }
        if let Some(set) = maps.by_bundle.get_mut(&reference.bundle_id()) {
            set.remove(&id);
        }
        maps.providers.remove(&id);

        let stale_usage: Vec<(BundleId, ServiceId)> = maps
            .usage
            .keys()
            .copied()
            .filter(|(_, sid)| *sid == id)
            .collect();
        for key in stale_usage {
            maps.usage.remove(&key);
        }
        let stale_factory: Vec<(BundleId, ServiceId)> = maps
            .factory_counters
            .keys()
            .copied()
            .filter(|(_, sid)| *sid == id)
            .collect();
        for key in stale_factory {
            maps.factory_counters.remove(&key);
        }

        debug!(service_id = id, "service unregistered");
        Ok(())
    }

    /// `clazz = None, filter = None` returns every registered reference.
    /// A non-empty `clazz` narrows to that specification; `filter` is
    /// ANDed against the specification's properties.
    pub fn find_service_references(
        &self,
        clazz: Option<&str>,
        filter: Option<&Filter>,
        only_one: bool,
    ) -> Result<Vec<ServiceReference>> {
        let maps = self.inner.maps.lock();
        let mut candidates: Vec<ServiceReference> = match clazz {
            Some(spec) => maps.by_spec.get(spec).cloned().unwrap_or_default(),
            None => {
                let mut all: Vec<ServiceReference> = maps.by_id.values().cloned().collect();
                all.sort();
                all
            }
        };
        drop(maps);

        if let Some(f) = filter {
            candidates.retain(|r| f.matches(&r.get_properties()));
        }

        if only_one {
            candidates.truncate(1);
        }
        Ok(candidates)
    }

    #[instrument(skip(self))]
    pub fn get_service(&self, bundle_id: BundleId, reference: &ServiceReference) -> Result<Arc<dyn Any + Send + Sync>> {
        let mut maps = self.inner.maps.lock();
        let id = reference.id();

        let provider = maps
            .providers
            .get(&id)
            .ok_or(RuntimeError::UnknownService(id))?;

        let instance = match provider {
            StoredProvider::Instance(instance) => {
                *maps.usage.entry((bundle_id, id)).or_insert(0) += 1;
                instance.clone()
            }
            StoredProvider::BundleFactory(factory) => {
                let factory = factory.clone();
                let counter = maps
                    .factory_counters
                    .entry((bundle_id, id))
                    .or_insert_with(|| FactoryCounter::Bundle {
                        instance: factory.get_service(bundle_id, reference),
                        count: 0,
                    });
                match counter {
                    FactoryCounter::Bundle { instance, count } => {
                        *count += 1;
                        instance.clone()
                    }
                    FactoryCounter::Prototype { .. } => unreachable!("bundle factory never stores a prototype counter"),
                }
            }
            StoredProvider::PrototypeFactory(factory) => {
                let instance = factory.get_service(bundle_id, reference);
                let counter = maps
                    .factory_counters
                    .entry((bundle_id, id))
                    .or_insert_with(|| FactoryCounter::Prototype { instances: Vec::new() });
                match counter {
                    FactoryCounter::Prototype { instances } => instances.push(instance.clone()),
                    FactoryCounter::Bundle { .. } => unreachable!("prototype factory never stores a bundle counter"),
                }
                instance
            }
        };

        drop(maps);
        reference.mark_using(bundle_id);
        Ok(instance)
    }

    /// Decrements the (bundle, reference) usage count; returns `true` if
    /// this call was the one that brought it to zero and released the
    /// underlying factory-produced instance (if any).
    #[instrument(skip(self))]
    pub fn unget_service(&self, bundle_id: BundleId, reference: &ServiceReference) -> Result<bool> {
        let mut maps = self.inner.maps.lock();
        let id = reference.id();

        let released = match maps.providers.get(&id) {
            Some(StoredProvider::Instance(_)) | None => {
                let key = (bundle_id, id);
                match maps.usage.get_mut(&key) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    Some(_) => {
                        maps.usage.remove(&key);
                        true
                    }
                    None => return Err(RuntimeError::UnknownService(id)),
                }
            }
            Some(StoredProvider::BundleFactory(factory)) => {
                let factory = factory.clone();
                let key = (bundle_id, id);
                match maps.factory_counters.get_mut(&key) {
                    Some(FactoryCounter::Bundle { instance, count }) => {
                        *count -= 1;
                        if *count == 0 {
                            let instance = instance.clone();
                            maps.factory_counters.remove(&key);
                            drop(maps);
                            factory.unget_service(bundle_id, reference, instance);
                            maps = self.inner.maps.lock();
                            true
                        } else {
                            false
                        }
                    }
                    _ => return Err(RuntimeError::UnknownService(id)),
                }
            }
            Some(StoredProvider::PrototypeFactory(factory)) => {
                let factory = factory.clone();
                let key = (bundle_id, id);
                match maps.factory_counters.get_mut(&key) {
                    Some(FactoryCounter::Prototype { instances }) => {
                        let instance = instances.pop();
                        let now_empty = instances.is_empty();
                        if now_empty {
                            maps.factory_counters.remove(&key);
                        }
                        if let Some(instance) = instance {
                            drop(maps);
                            factory.unget_service(bundle_id, reference, instance);
                            maps = self.inner.maps.lock();
                        }
                        now_empty
                    }
                    _ => return Err(RuntimeError::UnknownService(id)),
                }
            }
        };

        drop(maps);
        if released {
            reference.unmark_using(bundle_id);
        }
        Ok(released)
    }

    /// Releases every reference `bundle_id` currently holds a usage count
    /// on, used when a bundle stops.
    pub fn unget_used_services(&self, bundle_id: BundleId) {
        let ids: Vec<ServiceId> = {
            let maps = self.inner.maps.lock();
            maps.usage
                .keys()
                .chain(maps.factory_counters.keys())
                .filter(|(b, _)| *b == bundle_id)
                .map(|(_, sid)| *sid)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        for id in ids {
            let reference = {
                let maps = self.inner.maps.lock();
                maps.by_id.get(&id).cloned()
            };
            if let Some(reference) = reference {
                while !self.unget_service(bundle_id, &reference).unwrap_or(true) {
                    // Keep releasing until the counter reaches zero.
                }
            }
        }
    }

    /// Removes every non-factory service `bundle_id` published from the
    /// per-specification lookup lists, keeping each reference reachable by
    /// id in the pending map until its eventual `unregister` call — the
    /// STOPPING-event delivery window.
    pub fn hide_bundle_services(&self, bundle_id: BundleId) -> HashSet<ServiceReference> {
        let mut maps = self.inner.maps.lock();
        let ids: Vec<ServiceId> = maps
            .by_bundle
            .get(&bundle_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        let mut hidden = HashSet::new();
        for id in ids {
            let is_instance = matches!(maps.providers.get(&id), Some(StoredProvider::Instance(_)));
            if !is_instance {
                continue;
            }
            if let Some(reference) = maps.by_id.get(&id).cloned() {
                for spec in reference.specs() {
                    if let Some(list) = maps.by_spec.get_mut(spec) {
                        list.retain(|r| r.id() != id);
                    }
                }
                maps.pending.insert(id, reference.clone());
                hidden.insert(reference);
            }
        }
        hidden
    }
}

fn coerce_ranking(value: Option<PropertyValue>) -> Option<i64> {
    match value {
        Some(PropertyValue::Int(n)) => Some(n),
        Some(PropertyValue::Str(s)) => s.parse::<i64>().ok(),
        Some(PropertyValue::Bool(_)) | Some(PropertyValue::List(_)) | None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(EventDispatcher::new()))
    }

    fn register_with_rank(reg: &ServiceRegistry, bundle: BundleId, rank: i64) -> ServiceRegistration {
        let mut props = Properties::new();
        props.insert("service.ranking".to_string(), PropertyValue::Int(rank));
        reg.register(bundle, vec!["S".to_string()], props, Provider::Instance(Arc::new(42i32)))
            .unwrap()
    }

    #[test]
    fn s1_ranking_sorts_high_to_low_ties_by_id() {
        let reg = registry();
        let r1 = register_with_rank(&reg, 1, 0).get_reference().id();
        let r2 = register_with_rank(&reg, 1, 10).get_reference().id();
        let r3 = register_with_rank(&reg, 1, 10).get_reference().id();

        let found: Vec<ServiceId> = reg
            .find_service_references(Some("S"), None, false)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(found, vec![r2, r3, r1]);
    }

    #[test]
    fn s2_ranking_update_resorts() {
        let reg = registry();
        let reg1 = register_with_rank(&reg, 1, 0);
        let reg2 = register_with_rank(&reg, 1, 5);

        let found: Vec<ServiceId> = reg
            .find_service_references(Some("S"), None, false)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(found, vec![reg2.get_reference().id(), reg1.get_reference().id()]);

        let mut update = Properties::new();
        update.insert("service.ranking".to_string(), PropertyValue::Int(9));
        reg1.set_properties(update).unwrap();

        let found: Vec<ServiceId> = reg
            .find_service_references(Some("S"), None, false)
            .unwrap()
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(found, vec![reg1.get_reference().id(), reg2.get_reference().id()]);
    }

    #[test]
    fn register_unregister_round_trip_is_clean() {
        let reg = registry();
        let registration = reg
            .register(1, vec!["S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();
        registration.unregister().unwrap();
        assert!(reg.find_service_references(Some("S"), None, false).unwrap().is_empty());
    }

    #[test]
    fn no_op_property_update_does_not_fire_modified() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct Counter(AtomicU32);
        impl ServiceListener for Counter {
            fn service_changed(&self, _event: &ServiceEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reg = registry();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        reg.dispatcher()
            .add_service_listener(1, counter.clone(), Some("S".to_string()), None);

        let mut props = Properties::new();
        props.insert("x".to_string(), "1".into());
        let registration = reg
            .register(1, vec!["S".to_string()], props.clone(), Provider::Instance(Arc::new(1i32)))
            .unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 1); // REGISTERED

        registration.set_properties(props).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1); // unchanged: no MODIFIED
    }

    #[test]
    fn prototype_factory_round_trip_returns_to_empty() {
        struct EchoFactory;
        impl PrototypeServiceFactory for EchoFactory {
            fn get_service(&self, _b: BundleId, _r: &ServiceReference) -> Arc<dyn Any + Send + Sync> {
                Arc::new(0i32)
            }
            fn unget_service(&self, _b: BundleId, _r: &ServiceReference, _i: Arc<dyn Any + Send + Sync>) {}
        }

        let reg = registry();
        let registration = reg
            .register(
                1,
                vec!["S".to_string()],
                Properties::new(),
                Provider::PrototypeFactory(Arc::new(EchoFactory)),
            )
            .unwrap();
        let reference = registration.get_reference();

        for _ in 0..3 {
            reg.get_service(2, &reference).unwrap();
        }
        let mut last_released = false;
        for _ in 0..3 {
            last_released = reg.unget_service(2, &reference).unwrap();
        }
        assert!(last_released);
    }
}
