//! The temporal dependency handler: like [`super::simple`], but a
//! departed binding enters a grace period instead of immediately
//! invalidating the component. A [`TemporalHandle`] held by component
//! code blocks callers until either a replacement arrives or the grace
//! period expires.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{reference_eq, DependencyValue, Handler, HandlerKind};
use crate::context::{BundleContext, Requirement};
use crate::error::{Result, RuntimeError};
use crate::instance::StoredInstance;
use crate::registry::{ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference};

/// Shared with every [`TemporalHandle`] clone handed out for this field.
struct Shared {
    current: Mutex<Option<(ServiceReference, Arc<dyn Any + Send + Sync>)>>,
    condvar: Condvar,
    timeout: Duration,
}

/// Blocks `get()` callers until a service is bound, up to the handler's
/// configured grace period.
#[derive(Clone)]
pub struct TemporalHandle {
    shared: Arc<Shared>,
}

impl TemporalHandle {
    pub fn get(&self) -> Result<Arc<dyn Any + Send + Sync>> {
        let mut guard = self.shared.current.lock();
        if guard.is_none() {
            let deadline = Instant::now() + self.shared.timeout;
            loop {
                if guard.is_some() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(RuntimeError::TemporalTimeout(self.shared.timeout));
                }
                self.shared.condvar.wait_for(&mut guard, deadline - now);
            }
        }
        Ok(guard.as_ref().unwrap().1.clone())
    }
}

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    token: Option<u64>,
}

pub struct TemporalDependency {
    field: String,
    requirement: Requirement,
    shared: Arc<Shared>,
    self_weak: Weak<TemporalDependency>,
    state: Mutex<State>,
}

impl TemporalDependency {
    pub fn new(field: impl Into<String>, requirement: Requirement, timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| TemporalDependency {
            field: field.into(),
            requirement,
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                condvar: Condvar::new(),
                timeout,
            }),
            self_weak: weak.clone(),
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                token: None,
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
        {
            let mut current = self.shared.current.lock();
            *current = Some((reference.clone(), service.clone()));
            self.shared.condvar.notify_all();
        }
        instance.bind(self, service, reference)
    }

    fn unbind_current(&self) {
        let previous = self.shared.current.lock().take();
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

    fn try_find_and_bind(&self) -> Result<()> {
        if self.shared.current.lock().is_some() {
            return Ok(());
        }
        let bundle_context = self.state.lock().bundle_context.clone();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        if let Some(reference) =
            bundle_context.get_service_reference(&self.requirement.specification, Some(&self.requirement.full_filter))?
        {
            self.bind_reference(reference)?;
        }
        Ok(())
    }
}

impl ServiceListener for TemporalDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        let Some(instance) = self.state.lock().instance.upgrade() else { return };
        if !instance.check_event() {
            return;
        }

        match event.kind {
            ServiceEventKind::Registered => {
                if self.shared.current.lock().is_none() {
                    let _ = self.bind_reference(event.reference.clone());
                }
            }
            ServiceEventKind::Modified => {
                let is_current = self
                    .shared
                    .current
                    .lock()
                    .as_ref()
                    .is_some_and(|(r, _)| reference_eq(r, &event.reference));
                if is_current {
                    if let Some(service) = self.shared.current.lock().as_ref().map(|(_, s)| s.clone()) {
                        instance.update(self, service, event.reference.clone(), false);
                    }
                } else if self.shared.current.lock().is_none() {
                    let _ = self.bind_reference(event.reference.clone());
                }
            }
            ServiceEventKind::ModifiedEndmatch | ServiceEventKind::Unregistering => {
                let is_current = self
                    .shared
                    .current
                    .lock()
                    .as_ref()
                    .is_some_and(|(r, _)| reference_eq(r, &event.reference));
                if is_current {
                    // Entering the grace period: the binding is cleared
                    // immediately so `TemporalHandle::get` starts blocking,
                    // but the component stays valid — `is_valid` does not
                    // depend on `current` for this handler kind.
                    self.unbind_current();
                    let _ = self.try_find_and_bind();
                }
            }
        }
    }
}

impl Handler for TemporalDependency {
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

    /// Always valid once started: the grace period, not component
    /// validity, is what enforces the temporal contract. A caller blocked
    /// in `TemporalHandle::get` past the grace period sees
    /// `TemporalTimeout`, not an invalidated component.
    fn is_valid(&self) -> bool {
        true
    }

    fn current_value(&self) -> DependencyValue {
        DependencyValue::Temporal(TemporalHandle {
            shared: self.shared.clone(),
        })
    }

    fn try_binding(&self) -> Result<()> {
        self.try_find_and_bind()
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
    fn s5_get_times_out_once_grace_period_elapses() {
        let (bundle_context, instance) = context();
        let dep = TemporalDependency::new("svc", Requirement::new("spec.S"), Duration::from_millis(30));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        let DependencyValue::Temporal(handle) = dep.current_value() else {
            panic!("expected temporal handle");
        };
        let err = handle.get().unwrap_err();
        assert!(matches!(err, RuntimeError::TemporalTimeout(_)));
    }

    #[test]
    fn s5_get_returns_once_bound() {
        let (bundle_context, instance) = context();
        let dep = TemporalDependency::new("svc", Requirement::new("spec.S"), Duration::from_secs(5));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(9i32)))
            .unwrap();

        let DependencyValue::Temporal(handle) = dep.current_value() else {
            panic!("expected temporal handle");
        };
        let service = handle.get().unwrap();
        assert_eq!(*service.downcast_ref::<i32>().unwrap(), 9);
    }
}
