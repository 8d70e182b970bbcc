//! The service-provider handler: registers the component's provided
//! service once the instance validates, withdraws it before invalidation,
//! and toggles registration on and off as a controller field flips.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use super::{DependencyValue, Handler, HandlerKind, CALLBACK_POST_REGISTRATION, CALLBACK_POST_UNREGISTRATION};
use crate::context::BundleContext;
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::ldap::Properties;
use crate::registry::{Provider, ServiceRegistration};

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    registration: Option<ServiceRegistration>,
}

pub struct ServiceRegistrationHandler {
    specs: Vec<String>,
    controller_field: Option<String>,
    properties: Properties,
    provider: Arc<dyn Fn(&StoredInstance) -> Arc<dyn Any + Send + Sync> + Send + Sync>,
    state: Mutex<State>,
}

impl ServiceRegistrationHandler {
    pub fn new(
        specs: Vec<String>,
        controller_field: Option<String>,
        properties: Properties,
        provider: Arc<dyn Fn(&StoredInstance) -> Arc<dyn Any + Send + Sync> + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(ServiceRegistrationHandler {
            specs,
            controller_field,
            properties,
            provider,
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                registration: None,
            }),
        })
    }

    /// Registers the service if it is not already registered, the four
    /// conditions upstream's gate checks collapse to: we have a live
    /// instance and bundle context, and nobody already registered it.
    fn register(&self) {
        let (bundle_context, instance) = {
            let state = self.state.lock();
            (state.bundle_context.clone(), state.instance.clone())
        };
        let (Some(bundle_context), Some(instance)) = (bundle_context, instance.upgrade()) else {
            return;
        };
        if self.state.lock().registration.is_some() {
            return;
        }

        let service = (self.provider)(instance.as_ref());
        match bundle_context.register_service(self.specs.clone(), self.properties.clone(), Provider::Instance(service)) {
            Ok(registration) => {
                let reference = registration.get_reference();
                self.state.lock().registration = Some(registration);
                instance.safe_callback(CALLBACK_POST_REGISTRATION, &reference);
            }
            Err(e) => warn!(error = %e, "failed to register provided service"),
        }
    }

    fn unregister(&self) {
        let registration = self.state.lock().registration.take();
        let Some(registration) = registration else { return };
        let reference = registration.get_reference();
        if let Err(e) = registration.unregister() {
            warn!(error = %e, "failed to unregister provided service, leaving instance alone");
        }
        if let Some(instance) = self.state.lock().instance.upgrade() {
            instance.safe_callback(CALLBACK_POST_UNREGISTRATION, &reference);
        }
    }
}

impl Handler for ServiceRegistrationHandler {
    fn kinds(&self) -> &'static [HandlerKind] {
        &[HandlerKind::ServiceProvider]
    }

    fn field(&self) -> &str {
        self.controller_field.as_deref().unwrap_or("")
    }

    fn manipulate(&self, instance: Weak<StoredInstance>, bundle_context: BundleContext) {
        let mut state = self.state.lock();
        state.instance = instance;
        state.bundle_context = Some(bundle_context);
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn clear(&self) {
        self.unregister();
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn current_value(&self) -> DependencyValue {
        DependencyValue::Missing
    }

    fn post_validate(&self) {
        let should_register = match &self.controller_field {
            Some(name) => self
                .state
                .lock()
                .instance
                .upgrade()
                .map(|i| i.get_controller_state(name))
                .unwrap_or(true),
            None => true,
        };
        if should_register {
            self.register();
        }
    }

    fn pre_invalidate(&self) {
        self.unregister();
    }

    fn on_controller_change(&self, name: &str, value: bool) {
        if self.controller_field.as_deref() != Some(name) {
            return;
        }
        if value {
            self.register();
        } else {
            self.unregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ComponentContext, FactoryContext};
    use crate::instance::ComponentCallbacks;
    use crate::ldap::Properties;
    use crate::registry::{EventDispatcher, ServiceRegistry};

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
    fn registers_on_post_validate_and_withdraws_on_pre_invalidate() {
        let (bundle_context, instance) = context();
        let handler = ServiceRegistrationHandler::new(
            vec!["spec.S".to_string()],
            None,
            Properties::new(),
            Arc::new(|_inst: &StoredInstance| Arc::new(5i32) as Arc<dyn Any + Send + Sync>),
        );
        handler.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        handler.post_validate();

        let found = bundle_context.get_all_service_references("spec.S", None).unwrap();
        assert_eq!(found.len(), 1);

        handler.pre_invalidate();
        let found = bundle_context.get_all_service_references("spec.S", None).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn controller_toggles_registration() {
        let (bundle_context, instance) = context();
        let handler = ServiceRegistrationHandler::new(
            vec!["spec.S".to_string()],
            Some("controller".to_string()),
            Properties::new(),
            Arc::new(|_inst: &StoredInstance| Arc::new(5i32) as Arc<dyn Any + Send + Sync>),
        );
        handler.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        instance.set_controller_state("controller", false);
        handler.post_validate();
        assert!(bundle_context.get_all_service_references("spec.S", None).unwrap().is_empty());

        instance.set_controller_state("controller", true);
        handler.on_controller_change("controller", true);
        assert_eq!(bundle_context.get_all_service_references("spec.S", None).unwrap().len(), 1);
    }
}
