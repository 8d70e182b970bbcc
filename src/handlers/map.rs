//! The keyed dependency handler: groups matches by a service property
//! and keeps the best match bound per key, the way [`super::best`] keeps
//! one best match overall.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{reference_eq, DependencyValue, Handler, HandlerKind};
use crate::context::{BundleContext, Requirement};
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::ldap::PropertyValue;
use crate::registry::{ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference};

type Key = Option<String>;

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    token: Option<u64>,
    bindings: HashMap<Key, (ServiceReference, Arc<dyn Any + Send + Sync>)>,
}

pub struct MapDependency {
    field: String,
    requirement: Requirement,
    key_property: String,
    allow_none: bool,
    self_weak: Weak<MapDependency>,
    state: Mutex<State>,
}

impl MapDependency {
    pub fn new(field: impl Into<String>, requirement: Requirement, key_property: impl Into<String>, allow_none: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak| MapDependency {
            field: field.into(),
            requirement,
            key_property: key_property.into(),
            allow_none,
            self_weak: weak.clone(),
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                token: None,
                bindings: HashMap::new(),
            }),
        })
    }

    /// `None` means the service is rejected outright (no key property and
    /// `allow_none` is off); `Some(key)` is the bucket to bind it under,
    /// where `key` itself is `None` for an accepted keyless service.
    fn key_of(&self, reference: &ServiceReference) -> Option<Key> {
        match reference.get_property(&self.key_property) {
            Some(PropertyValue::Str(s)) => Some(Some(s)),
            Some(other) => Some(Some(format!("{other:?}"))),
            None if self.allow_none => Some(None),
            None => None,
        }
    }

    fn bind_key(&self, key: Key, reference: ServiceReference) -> Result<()> {
        let (bundle_context, instance) = {
            let state = self.state.lock();
            (state.bundle_context.clone(), state.instance.clone())
        };
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let Some(instance) = instance.upgrade() else { return Ok(()) };
        let service = bundle_context.get_service(&reference)?;
        self.state.lock().bindings.insert(key, (reference.clone(), service.clone()));
        instance.bind(self, service, reference)
    }

    fn unbind_key(&self, key: &Key) {
        let removed = self.state.lock().bindings.remove(key);
        let Some((reference, service)) = removed else { return };
        let (bundle_context, instance) = {
            let state = self.state.lock();
            (state.bundle_context.clone(), state.instance.clone())
        };
        if let Some(instance) = instance.upgrade() {
            instance.unbind(self, service, reference.clone());
        }
        if let Some(bundle_context) = bundle_context {
            let _ = bundle_context.unget_service(&reference);
        }
    }

    /// Re-scans matches for one key and rebinds if the best candidate for
    /// that key has changed.
    fn reconcile_key(&self, key: Key) -> Result<()> {
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let matches = bundle_context.get_all_service_references(&self.requirement.specification, Some(&self.requirement.full_filter))?;
        let best = matches.into_iter().find(|r| self.key_of(r) == Some(key.clone()));

        let current_id = self.state.lock().bindings.get(&key).map(|(r, _)| r.id());
        if best.as_ref().map(|r| r.id()) == current_id {
            return Ok(());
        }

        self.unbind_key(&key);
        if let Some(reference) = best {
            self.bind_key(key, reference)?;
        }
        Ok(())
    }
}

impl ServiceListener for MapDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        let Some(instance) = self.state.lock().instance.upgrade() else { return };
        if !instance.check_event() {
            return;
        }
        let Some(key) = self.key_of(&event.reference) else { return };

        match event.kind {
            ServiceEventKind::Registered => {
                let _ = self.reconcile_key(key);
            }
            ServiceEventKind::Modified => {
                let is_current = self
                    .state
                    .lock()
                    .bindings
                    .get(&key)
                    .is_some_and(|(r, _)| reference_eq(r, &event.reference));
                if is_current {
                    if let Some(service) = self.state.lock().bindings.get(&key).map(|(_, s)| s.clone()) {
                        instance.update(self, service, event.reference.clone(), false);
                    }
                }
                let _ = self.reconcile_key(key);
            }
            ServiceEventKind::ModifiedEndmatch | ServiceEventKind::Unregistering => {
                let _ = self.reconcile_key(key);
            }
        }
    }
}

impl Handler for MapDependency {
    fn kinds(&self) -> &'static [HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn manipulate(&self, instance: Weak<StoredInstance>, bundle_context: BundleContext) {
        let mut state = self.state.lock();
        state.instance = instance;
        state.bundle_context = Some(bundle_context);
    }

    fn start(&self) -> Result<()> {
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let listener: Arc<dyn ServiceListener> = self.self_weak.upgrade().expect("handler alive during start");
        let token = bundle_context.add_service_listener(
            listener,
            Some(&self.requirement.specification),
            Some(self.requirement.full_filter.clone()),
        );
        self.state.lock().token = Some(token);
        Ok(())
    }

    fn stop(&self) {
        let (bundle_context, token) = {
            let mut state = self.state.lock();
            (state.bundle_context.clone(), state.token.take())
        };
        if let (Some(bundle_context), Some(token)) = (bundle_context, token) {
            bundle_context.remove_service_listener(token);
        }
    }

    fn clear(&self) {
        let keys: Vec<Key> = self.state.lock().bindings.keys().cloned().collect();
        for key in keys {
            self.unbind_key(&key);
        }
    }

    fn is_valid(&self) -> bool {
        self.requirement.optional || !self.state.lock().bindings.is_empty()
    }

    fn current_value(&self) -> DependencyValue {
        DependencyValue::Keyed(
            self.state
                .lock()
                .bindings
                .iter()
                .map(|(k, (_, s))| (k.clone(), s.clone()))
                .collect(),
        )
    }

    fn try_binding(&self) -> Result<()> {
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let matches = bundle_context.get_all_service_references(&self.requirement.specification, Some(&self.requirement.full_filter))?;

        let mut seen: HashSet<Key> = HashSet::new();
        for reference in matches {
            let Some(key) = self.key_of(&reference) else { continue };
            if seen.insert(key.clone()) {
                self.bind_key(key, reference)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ComponentContext, FactoryContext};
    use crate::instance::ComponentCallbacks;
    use crate::ldap::Properties;
    use crate::registry::{EventDispatcher, Provider, ServiceRegistry};

    fn context() -> (BundleContext, Arc<StoredInstance>) {
        let registry = ServiceRegistry::new(Arc::new(EventDispatcher::new()));
        let bundle_context = BundleContext::new(1, registry, Arc::new(Properties::new()));
        let component_context = ComponentContext::new(
            Arc::new(FactoryContext::builder("t").build()),
            "inst".to_string(),
            Properties::new(),
        );
        let instance = StoredInstance::create(
            bundle_context.clone(),
            &super::super::HandlerFactoryRegistry::new(),
            component_context,
            ComponentCallbacks::default(),
        )
        .unwrap();
        (bundle_context, instance)
    }

    #[test]
    fn groups_by_key_one_binding_per_value() {
        let (bundle_context, instance) = context();
        let dep = MapDependency::new("svcs", Requirement::new("spec.S"), "kind", true);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        let mut a = Properties::new();
        a.insert("kind".to_string(), "a".into());
        bundle_context
            .register_service(vec!["spec.S".to_string()], a, Provider::Instance(Arc::new(1i32)))
            .unwrap();

        let mut b = Properties::new();
        b.insert("kind".to_string(), "b".into());
        bundle_context
            .register_service(vec!["spec.S".to_string()], b, Provider::Instance(Arc::new(2i32)))
            .unwrap();

        assert_eq!(dep.state.lock().bindings.len(), 2);
    }

    #[test]
    fn rejects_keyless_service_when_allow_none_is_off() {
        let (bundle_context, instance) = context();
        let dep = MapDependency::new("svcs", Requirement::new("spec.S"), "kind", false);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();

        assert!(dep.state.lock().bindings.is_empty());
        assert!(!dep.is_valid());
    }

    #[test]
    fn accepts_keyless_service_under_none_bucket_when_allow_none_is_on() {
        let (bundle_context, instance) = context();
        let dep = MapDependency::new("svcs", Requirement::new("spec.S"), "kind", true);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();

        assert!(dep.state.lock().bindings.contains_key(&None));
    }

    #[test]
    fn non_optional_with_allow_none_is_still_invalid_when_empty() {
        let (bundle_context, instance) = context();
        let dep = MapDependency::new("svcs", Requirement::new("spec.S"), "kind", true);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        assert!(!dep.is_valid());
    }
}
