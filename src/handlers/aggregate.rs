//! The aggregate dependency handler: tracks every matching service at
//! once. `try_binding` rolls back in reverse order if a user bind
//! callback fails partway through the initial batch.

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
    bindings: Vec<(ServiceReference, Arc<dyn Any + Send + Sync>)>,
}

pub struct AggregateDependency {
    field: String,
    requirement: Requirement,
    self_weak: Weak<AggregateDependency>,
    state: Mutex<State>,
}

impl AggregateDependency {
    pub fn new(field: impl Into<String>, requirement: Requirement) -> Arc<Self> {
        Arc::new_cyclic(|weak| AggregateDependency {
            field: field.into(),
            requirement,
            self_weak: weak.clone(),
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                token: None,
                bindings: Vec::new(),
            }),
        })
    }

    fn bind_one(&self, reference: ServiceReference) -> Result<()> {
        let (bundle_context, instance) = {
            let state = self.state.lock();
            (state.bundle_context.clone(), state.instance.clone())
        };
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let Some(instance) = instance.upgrade() else { return Ok(()) };

        let service = bundle_context.get_service(&reference)?;
        self.state.lock().bindings.push((reference.clone(), service.clone()));

        if let Err(e) = instance.bind(self, service, reference.clone()) {
            self.state.lock().bindings.retain(|(r, _)| !reference_eq(r, &reference));
            let _ = bundle_context.unget_service(&reference);
            return Err(e);
        }
        Ok(())
    }

    fn unbind_one(&self, reference: &ServiceReference) {
        let removed = {
            let mut state = self.state.lock();
            let idx = state.bindings.iter().position(|(r, _)| reference_eq(r, reference));
            idx.map(|i| state.bindings.remove(i))
        };
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

    fn is_bound(&self, reference: &ServiceReference) -> bool {
        self.state.lock().bindings.iter().any(|(r, _)| reference_eq(r, reference))
    }
}

impl ServiceListener for AggregateDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        let Some(instance) = self.state.lock().instance.upgrade() else { return };
        if !instance.check_event() {
            return;
        }

        match event.kind {
            ServiceEventKind::Registered => {
                if !self.is_bound(&event.reference) {
                    let _ = self.bind_one(event.reference.clone());
                }
            }
            ServiceEventKind::Modified => {
                if self.is_bound(&event.reference) {
                    if let Some(service) = self
                        .state
                        .lock()
                        .bindings
                        .iter()
                        .find(|(r, _)| reference_eq(r, &event.reference))
                        .map(|(_, s)| s.clone())
                    {
                        instance.update(self, service, event.reference.clone(), false);
                    }
                } else {
                    let _ = self.bind_one(event.reference.clone());
                }
            }
            ServiceEventKind::ModifiedEndmatch | ServiceEventKind::Unregistering => {
                if self.is_bound(&event.reference) {
                    self.unbind_one(&event.reference);
                }
            }
        }
    }
}

impl Handler for AggregateDependency {
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
        let refs: Vec<ServiceReference> = self.state.lock().bindings.iter().map(|(r, _)| r.clone()).collect();
        for reference in refs.iter().rev() {
            self.unbind_one(reference);
        }
    }

    fn is_valid(&self) -> bool {
        self.requirement.optional || !self.state.lock().bindings.is_empty()
    }

    fn current_value(&self) -> DependencyValue {
        DependencyValue::Many(self.state.lock().bindings.iter().map(|(_, s)| s.clone()).collect())
    }

    /// Binds every already-registered match. If a bind callback fails
    /// partway through, unwinds everything bound so far (in reverse
    /// order) and propagates the error rather than leaving a partial set.
    fn try_binding(&self) -> Result<()> {
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let references =
            bundle_context.get_all_service_references(&self.requirement.specification, Some(&self.requirement.full_filter))?;

        let mut bound_so_far = Vec::new();
        for reference in references {
            match self.bind_one(reference.clone()) {
                Ok(()) => bound_so_far.push(reference),
                Err(e) => {
                    for reference in bound_so_far.iter().rev() {
                        self.unbind_one(reference);
                    }
                    return Err(e);
                }
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
    fn s4_failing_bind_rolls_back_earlier_bindings() {
        let (bundle_context, instance) = context();
        let r1 = bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();
        let r2 = bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(2i32)))
            .unwrap();

        let dep = AggregateDependency::new("svcs", Requirement::new("spec.S").aggregate(true));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        let failing_id = r2.get_reference().id();
        let cb = move |_inst: &StoredInstance, _field: &str, _s: &Arc<dyn Any + Send + Sync>, r: &ServiceReference| {
            if r.id() == failing_id {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        };
        // Install a failing bind callback on a *new* instance sharing this
        // dependency object to exercise rollback deterministically.
        let component_context = ComponentContext::new(
            Arc::new(FactoryContext::builder("t").build()),
            "inst2".to_string(),
            Properties::new(),
        );
        let mut callbacks = ComponentCallbacks::default();
        callbacks.bind = Some(Box::new(cb));
        let instance2 = StoredInstance::create(
            bundle_context.clone(),
            &super::super::HandlerFactoryRegistry::new(),
            component_context,
            callbacks,
        )
        .unwrap();

        let dep2 = AggregateDependency::new("svcs", Requirement::new("spec.S").aggregate(true));
        dep2.manipulate(Arc::downgrade(&instance2), bundle_context.clone());
        dep2.start().unwrap();
        let result = dep2.try_binding();
        assert!(result.is_err());
        assert!(dep2.state.lock().bindings.is_empty());

        r1.unregister().unwrap();
        r2.unregister().unwrap();
    }
}
