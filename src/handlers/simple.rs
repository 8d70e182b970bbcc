//! The plain single-reference dependency handler: binds the first match,
//! rebinds on departure only if `immediate_rebind` is set.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{reference_eq, DependencyValue, Handler, HandlerKind};
use crate::context::{BundleContext, Requirement};
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::ldap::PropertyValue;
use crate::registry::{ServiceEvent, ServiceEventKind, ServiceListener, ServiceReference};

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    token: Option<u64>,
    binding: Option<(ServiceReference, Arc<dyn Any + Send + Sync>)>,
    /// Set while an `immediate_rebind` swap is in flight: the departed
    /// service has been unbound but a replacement lookup is still
    /// pending. `is_valid` reads this as a "still valid" hint so the
    /// swap never opens an invalidation window.
    pending: bool,
}

pub struct SimpleDependency {
    field: String,
    requirement: Requirement,
    self_weak: Weak<SimpleDependency>,
    state: Mutex<State>,
}

impl SimpleDependency {
    pub fn new(field: impl Into<String>, requirement: Requirement) -> Arc<Self> {
        Arc::new_cyclic(|weak| SimpleDependency {
            field: field.into(),
            requirement,
            self_weak: weak.clone(),
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                token: None,
                binding: None,
                pending: false,
            }),
        })
    }

    fn snapshot(&self) -> (Option<BundleContext>, Weak<StoredInstance>) {
        let state = self.state.lock();
        (state.bundle_context.clone(), state.instance.clone())
    }

    fn bind_reference(&self, reference: ServiceReference) -> Result<()> {
        let (bundle_context, instance) = self.snapshot();
        let Some(bundle_context) = bundle_context else { return Ok(()) };
        let Some(instance) = instance.upgrade() else { return Ok(()) };
        let service = bundle_context.get_service(&reference)?;
        self.state.lock().binding = Some((reference.clone(), service.clone()));
        instance.bind(self, service, reference)
    }

    fn unbind_current(&self) {
        let previous = self.state.lock().binding.take();
        let Some((reference, service)) = previous else { return };
        let (bundle_context, instance) = self.snapshot();
        if let Some(instance) = instance.upgrade() {
            instance.unbind(self, service, reference.clone());
        }
        if let Some(bundle_context) = bundle_context {
            let _ = bundle_context.unget_service(&reference);
        }
    }

    fn try_find_and_bind(&self) -> Result<()> {
        if self.state.lock().binding.is_some() {
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

impl ServiceListener for SimpleDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        let Some(instance) = self.state.lock().instance.upgrade() else { return };
        if !instance.check_event() {
            return;
        }

        match event.kind {
            ServiceEventKind::Registered => {
                if self.state.lock().binding.is_none() {
                    let _ = self.bind_reference(event.reference.clone());
                }
            }
            ServiceEventKind::Modified => {
                let current = self.state.lock().binding.clone();
                match current {
                    Some((reference, service)) if reference_eq(&reference, &event.reference) => {
                        instance.update(self, service, event.reference.clone(), false);
                    }
                    None => {
                        let _ = self.bind_reference(event.reference.clone());
                    }
                    _ => {}
                }
            }
            ServiceEventKind::ModifiedEndmatch | ServiceEventKind::Unregistering => {
                let is_current = self
                    .state
                    .lock()
                    .binding
                    .as_ref()
                    .is_some_and(|(r, _)| reference_eq(r, &event.reference));
                if is_current {
                    if self.requirement.immediate_rebind {
                        self.state.lock().pending = true;
                    }
                    self.unbind_current();
                    if self.requirement.immediate_rebind {
                        let _ = self.try_find_and_bind();
                        self.state.lock().pending = false;
                    }
                }
            }
        }
    }
}

impl Handler for SimpleDependency {
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
        self.requirement.optional || state.binding.is_some() || state.pending
    }

    fn current_value(&self) -> DependencyValue {
        match &self.state.lock().binding {
            Some((_, service)) => DependencyValue::Single(service.clone()),
            None => DependencyValue::Missing,
        }
    }

    fn try_binding(&self) -> Result<()> {
        self.try_find_and_bind()
    }

    fn on_property_change(&self, _name: &str, _old: &PropertyValue, _new: &PropertyValue) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::Properties;
    use crate::registry::{EventDispatcher, Provider, ServiceRegistry};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> (BundleContext, Arc<StoredInstance>) {
        let registry = ServiceRegistry::new(Arc::new(EventDispatcher::new()));
        let bundle_context = BundleContext::new(1, registry, Arc::new(Properties::new()));
        let component_context = crate::context::ComponentContext::new(
            Arc::new(crate::context::FactoryContext::builder("t").build()),
            "inst".to_string(),
            Properties::new(),
        );
        let instance = StoredInstance::create(
            bundle_context.clone(),
            &super::super::HandlerFactoryRegistry::new(),
            component_context,
            crate::instance::ComponentCallbacks::default(),
        )
        .unwrap();
        (bundle_context, instance)
    }

    #[test]
    fn binds_first_match_and_unbinds_on_departure() {
        let (bundle_context, instance) = context();
        let dep = SimpleDependency::new("svc", Requirement::new("spec.S"));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();
        assert!(!dep.is_valid());

        let registration = bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(7i32)))
            .unwrap();
        assert!(dep.is_valid());

        registration.unregister().unwrap();
        assert!(!dep.is_valid());
    }

    #[test]
    fn immediate_rebind_swaps_to_replacement_without_invalidation_window() {
        let (bundle_context, instance) = context();
        let dep = SimpleDependency::new("svc", Requirement::new("spec.S").immediate_rebind(true));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        let r1 = bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();
        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(2i32)))
            .unwrap();
        assert!(dep.is_valid());

        r1.unregister().unwrap();

        assert!(dep.is_valid());
        assert!(!dep.state.lock().pending);
        match dep.current_value() {
            DependencyValue::Single(service) => assert_eq!(*service.downcast_ref::<i32>().unwrap(), 2),
            _ => panic!("expected a rebound service"),
        }
    }

    #[test]
    fn without_immediate_rebind_departure_invalidates_even_with_a_replacement_available() {
        let (bundle_context, instance) = context();
        let dep = SimpleDependency::new("svc", Requirement::new("spec.S"));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();

        let r1 = bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(1i32)))
            .unwrap();
        bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(Arc::new(2i32)))
            .unwrap();

        r1.unregister().unwrap();
        assert!(!dep.is_valid());
    }

    #[test]
    fn try_binding_finds_already_registered_service() {
        let (bundle_context, instance) = context();
        let counter = Arc::new(AtomicU32::new(0));
        let _registration = bundle_context
            .register_service(vec!["spec.S".to_string()], Properties::new(), Provider::Instance(counter.clone()))
            .unwrap();

        let dep = SimpleDependency::new("svc", Requirement::new("spec.S"));
        dep.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        dep.start().unwrap();
        dep.try_binding().unwrap();
        assert!(dep.is_valid());
    }
}
