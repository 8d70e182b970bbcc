//! The best-match dependency handler: always holds the single
//! highest-ranking match. The registry already keeps each specification's
//! reference list sorted by `(-ranking, +service_id)`
//! ([`ServiceReference::sort_key`]), so "best" is simply the first
//! surviving entry in a filtered lookup — no separate tie-break logic
//! needed here.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{reference_eq, DependencyValue, Handler, HandlerKind};
use crate::context::{BundleContext, Requirement};
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::registry::{ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference};

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    token: Option<u64>,
    current: Option<(ServiceReference, Arc<dyn Any + Send + Sync>)>,
    /// Set for the span of a swap: the old match has been unbound but a
    /// replacement is already known and about to be bound. `is_valid`
    /// consults this so the swap never opens an invalidation window.
    pending: bool,
}

pub struct BestDependency {
    field: String,
    requirement: Requirement,
    self_weak: Weak<BestDependency>,
    state: Mutex<State>,
}

impl BestDependency {
    pub fn new(field: impl Into<String>, requirement: Requirement) -> Arc<Self> {
        Arc::new_cyclic(|weak| BestDependency {
            field: field.into(),
            requirement,
            self_weak: weak.clone(),
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                token: None,
                current: None,
                pending: false,
            }),
        })
    }

    fn bind_reference(&self, reference: ServiceReference) -> Result<()> {
        let (bundle_context, instance) = {
            let state = self.state.lock();
            (state.bundle_context.clone(), state.instance.clone())
        };
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let Some(instance) = instance.upgrade() else { return Ok(()) };
        let service = bundle_context.get_service(&reference)?;
        self.state.lock().current = Some((reference.clone(), service.clone()));
        instance.bind(self, service, reference)
    }

    fn unbind_current(&self) {
        let previous = self.state.lock().current.take();
        let Some((reference, service)) = previous else { return };
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

    /// Re-scans the registry and swaps in whichever reference now sorts
    /// first, if it differs from what is currently bound. When a
    /// replacement is already known, `pending` is held across the
    /// unbind/bind pair so `is_valid` reports "still valid" for the swap's
    /// duration instead of dipping through invalid in between.
    fn reconcile(&self) -> Result<()> {
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let best = bundle_context
            .get_all_service_references(&self.requirement.specification, Some(&self.requirement.full_filter))?
            .into_iter()
            .next();

        let current_id = self.state.lock().current.as_ref().map(|(r, _)| r.id());
        if best.as_ref().map(|r| r.id()) == current_id {
            return Ok(());
        }

        let is_swap = current_id.is_some() && best.is_some();
        if is_swap {
            self.state.lock().pending = true;
        }
        self.unbind_current();
        let result = match best {
            Some(reference) => self.bind_reference(reference),
            None => Ok(()),
        };
        self.state.lock().pending = false;
        result
    }
}

impl ServiceListener for BestDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        let Some(instance) = self.state.lock().instance.upgrade() else { return };
        if !instance.check_event() {
            return;
        }

        match event.kind {
            ServiceEventKind::Registered => {
                let _ = self.reconcile();
            }
            ServiceEventKind::Modified => {
                let is_current = self
                    .state
                    .lock()
                    .current
                    .as_ref()
                    .is_some_and(|(r, _)| reference_eq(r, &event.reference));
                if is_current {
                    if let Some(service) = self.state.lock().current.as_ref().map(|(_, s)| s.clone()) {
                        instance.update(self, service, event.reference.clone(), false);
                    }
                    let _ = self.reconcile();
                } else {
                    let _ = self.reconcile();
                }
            }
            ServiceEventKind::ModifiedEndmatch | ServiceEventKind::Unregistering => {
                let _ = self.reconcile();
            }
        }
    }
}

impl Handler for BestDependency {
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
        self.unbind_current();
    }

    fn is_valid(&self) -> bool {
        let state = self.state.lock();
        self.requirement.optional || state.current.is_some() || state.pending
    }

    fn current_value(&self) -> DependencyValue {
        match &self.state.lock().current {
            Some((_, service)) => DependencyValue::Single(service.clone()),
            None => DependencyValue::Missing,
        }
    }

    fn try_binding(&self) -> Result<()> {
        self.reconcile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ComponentContext, FactoryContext};
    use crate::instance::ComponentCallbacks;
    use crate::ldap::Properties;
    use crate::ldap::PropertyValue;
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
    fn swaps_to_higher_ranking_arrival() {
        let (bundle_context, instance) = context();
        let dep = BestDependency::new("svc", Requirement::new("spec.S"));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        let mut low = Properties::new();
        low.insert("service.ranking".to_string(), PropertyValue::Int(0));
        let r1 = bundle_context
            .register_service(vec!["spec.S".to_string()], low, Provider::Instance(Arc::new(1i32)))
            .unwrap();
        assert_eq!(dep.state.lock().current.as_ref().unwrap().0.id(), r1.get_reference().id());

        let mut high = Properties::new();
        high.insert("service.ranking".to_string(), PropertyValue::Int(10));
        let r2 = bundle_context
            .register_service(vec!["spec.S".to_string()], high, Provider::Instance(Arc::new(2i32)))
            .unwrap();
        assert_eq!(dep.state.lock().current.as_ref().unwrap().0.id(), r2.get_reference().id());

        r2.unregister().unwrap();
        assert_eq!(dep.state.lock().current.as_ref().unwrap().0.id(), r1.get_reference().id());
        assert!(dep.is_valid());
        assert!(!dep.state.lock().pending);

        r1.unregister().unwrap();
    }
}
