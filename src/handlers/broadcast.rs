//! Fan-out dependency handler: calls every matching service instead of
//! binding just one. The original proxies attribute access dynamically
//! across every bound service; here a [`BroadcastHandle`] exposes a
//! typed `call` closure instead, since Rust has no equivalent proxy.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use super::{reference_eq, DependencyValue, Handler, HandlerKind};
use crate::context::{BundleContext, Requirement};
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::registry::{ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference};

/// Live view over every service currently bound by a [`BroadcastDependency`].
/// Updates as services arrive and depart; a held clone never goes stale.
#[derive(Clone)]
pub struct BroadcastHandle {
    services: Arc<RwLock<Vec<Arc<dyn Any + Send + Sync>>>>,
    muffle_exceptions: bool,
    trace_exceptions: bool,
}

impl BroadcastHandle {
    /// Calls `f` against every bound service that downcasts to `T`.
    /// Returns how many targets `f` actually ran against. A target that
    /// doesn't downcast is skipped with a warning. A target whose call
    /// panics is logged when `trace_exceptions` is set and, unless
    /// `muffle_exceptions` is set, the panic is resumed once every
    /// remaining target has had its turn.
    pub fn call<T: 'static>(&self, mut f: impl FnMut(&T)) -> usize {
        let services = self.services.read();
        let mut hit = 0;
        let mut pending_panic = None;
        for service in services.iter() {
            let Some(typed) = service.downcast_ref::<T>() else {
                warn!("broadcast target did not match expected service type");
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| f(typed))) {
                Ok(()) => hit += 1,
                Err(payload) => {
                    if self.trace_exceptions {
                        error!("broadcast target panicked");
                    }
                    if !self.muffle_exceptions && pending_panic.is_none() {
                        pending_panic = Some(payload);
                    }
                }
            }
        }
        if let Some(payload) = pending_panic {
            panic::resume_unwind(payload);
        }
        hit
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    token: Option<u64>,
    bindings: Vec<(ServiceReference, Arc<dyn Any + Send + Sync>)>,
    services: Arc<RwLock<Vec<Arc<dyn Any + Send + Sync>>>>,
}

pub struct BroadcastDependency {
    field: String,
    requirement: Requirement,
    muffle_exceptions: bool,
    trace_exceptions: bool,
    self_weak: Weak<BroadcastDependency>,
    state: Mutex<State>,
}

impl BroadcastDependency {
    pub fn new(field: impl Into<String>, requirement: Requirement, muffle_exceptions: bool, trace_exceptions: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak| BroadcastDependency {
            field: field.into(),
            requirement,
            muffle_exceptions,
            trace_exceptions,
            self_weak: weak.clone(),
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                token: None,
                bindings: Vec::new(),
                services: Arc::new(RwLock::new(Vec::new())),
            }),
        })
    }

    fn bind_one(&self, reference: ServiceReference) -> Result<()> {
        let (bundle_context, instance, services) = {
            let state = self.state.lock();
            (state.bundle_context.clone(), state.instance.clone(), state.services.clone())
        };
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let Some(instance) = instance.upgrade() else { return Ok(()) };
        let service = bundle_context.get_service(&reference)?;

        self.state.lock().bindings.push((reference.clone(), service.clone()));
        services.write().push(service.clone());

        if let Err(e) = instance.bind(self, service.clone(), reference.clone()) {
            self.state.lock().bindings.retain(|(r, _)| !reference_eq(r, &reference));
            services.write().retain(|s| !Arc::ptr_eq(s, &service));
            let _ = bundle_context.unget_service(&reference);
            return Err(e);
        }
        Ok(())
    }

    fn unbind_one(&self, reference: &ServiceReference) {
        let (removed, services) = {
            let mut state = self.state.lock();
            let idx = state.bindings.iter().position(|(r, _)| reference_eq(r, reference));
            (idx.map(|i| state.bindings.remove(i)), state.services.clone())
        };
        let Some((reference, service)) = removed else { return };
        services.write().retain(|s| !Arc::ptr_eq(s, &service));

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

impl ServiceListener for BroadcastDependency {
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
                if !self.is_bound(&event.reference) {
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

impl Handler for BroadcastDependency {
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
        let state = self.state.lock();
        DependencyValue::Broadcast(BroadcastHandle {
            services: state.services.clone(),
            muffle_exceptions: self.muffle_exceptions,
            trace_exceptions: self.trace_exceptions,
        })
    }

    fn try_binding(&self) -> Result<()> {
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let references =
            bundle_context.get_all_service_references(&self.requirement.specification, Some(&self.requirement.full_filter))?;
        for reference in references {
            self.bind_one(reference)?;
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
    fn s6_calls_every_bound_service() {
        let (bundle_context, instance) = context();
        let dep = BroadcastDependency::new("svcs", Requirement::new("spec.S").aggregate(true), false, false);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();
        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(2i32)))
            .unwrap();

        let DependencyValue::Broadcast(handle) = dep.current_value() else {
            panic!("expected broadcast handle");
        };
        let mut seen = Vec::new();
        let hits = handle.call::<i32>(|value| seen.push(*value));
        seen.sort();
        assert_eq!(hits, 2);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn muffles_panicking_target_and_still_calls_the_rest() {
        let (bundle_context, instance) = context();
        let dep = BroadcastDependency::new("svcs", Requirement::new("spec.S").aggregate(true), true, false);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();
        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(2i32)))
            .unwrap();

        let DependencyValue::Broadcast(handle) = dep.current_value() else {
            panic!("expected broadcast handle");
        };
        let mut seen = Vec::new();
        let hits = handle.call::<i32>(|value| {
            if *value == 1 {
                panic!("target blew up");
            }
            seen.push(*value);
        });
        assert_eq!(hits, 1);
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn propagates_panic_when_not_muffled() {
        let (bundle_context, instance) = context();
        let dep = BroadcastDependency::new("svcs", Requirement::new("spec.S").aggregate(true), false, false);
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();

        let DependencyValue::Broadcast(handle) = dep.current_value() else {
            panic!("expected broadcast handle");
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle.call::<i32>(|_| panic!("target blew up"));
        }));
        assert!(result.is_err());
    }
}
