//! The per-component state machine: creates the declared handlers, starts
//! them, and drives INVALID/VALID/ERRONEOUS/KILLED transitions as
//! dependency handlers report validity changes.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::{error, info, warn};

use crate::context::{BundleContext, ComponentContext};
use crate::error::{Result, RuntimeError};
use crate::handlers::{DependencyValue, Handler, HandlerFactoryRegistry, HandlerKind};
use crate::registry::ServiceReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Invalid,
    Valid,
    Erroneous,
    Killed,
}

type BindResult = std::result::Result<(), String>;

/// User lifecycle callbacks. Each takes the owning `StoredInstance` as
/// context so it can pull injected dependency values by field name via
/// [`StoredInstance::handler_value`] — Rust has no reflection to poke a
/// value into an arbitrary struct field the way the dynamic original does.
#[derive(Default)]
pub struct ComponentCallbacks {
    pub validate: Option<Box<dyn Fn(&StoredInstance) -> BindResult + Send + Sync>>,
    pub invalidate: Option<Box<dyn Fn(&StoredInstance) + Send + Sync>>,
    pub bind: Option<Box<dyn Fn(&StoredInstance, &str, &Arc<dyn Any + Send + Sync>, &ServiceReference) -> BindResult + Send + Sync>>,
    pub unbind: Option<Box<dyn Fn(&StoredInstance, &str, &Arc<dyn Any + Send + Sync>, &ServiceReference) + Send + Sync>>,
    pub update: Option<
        Box<dyn Fn(&StoredInstance, &str, &Arc<dyn Any + Send + Sync>, &ServiceReference, bool) + Send + Sync>,
    >,
    pub post_registration: Option<Box<dyn Fn(&StoredInstance, &ServiceReference) + Send + Sync>>,
    pub post_unregistration: Option<Box<dyn Fn(&StoredInstance, &ServiceReference) + Send + Sync>>,
}

pub struct StoredInstance {
    pub name: String,
    pub factory_name: String,
    pub bundle_context: BundleContext,
    state: ReentrantMutex<RefCell<State>>,
    handlers: parking_lot::RwLock<Vec<Arc<dyn Handler>>>,
    controller_state: parking_lot::Mutex<HashMap<String, bool>>,
    callbacks: ComponentCallbacks,
    span: tracing::Span,
}

impl StoredInstance {
    pub fn create(
        bundle_context: BundleContext,
        handler_registry: &HandlerFactoryRegistry,
        component_context: ComponentContext,
        callbacks: ComponentCallbacks,
    ) -> Result<Arc<Self>> {
        let name = component_context.instance_name.clone();
        let factory_name = component_context.factory_context.factory_name.clone();

        let mut handlers = Vec::new();
        for handler_id in component_context.factory_context.handler_config.keys() {
            let factory = handler_registry
                .get(handler_id)
                .ok_or_else(|| RuntimeError::UnknownHandlerFactory(handler_id.to_string()))?;
            handlers.extend(factory.get_handlers(&component_context)?);
        }

        let span = tracing::info_span!("component", name = %name, factory = %factory_name);
        let instance = Arc::new(StoredInstance {
            name: name.clone(),
            factory_name,
            bundle_context: bundle_context.clone(),
            state: ReentrantMutex::new(RefCell::new(State::Invalid)),
            handlers: parking_lot::RwLock::new(handlers),
            controller_state: parking_lot::Mutex::new(HashMap::new()),
            callbacks,
            span,
        });

        let _enter = instance.span.enter();
        let snapshot: Vec<Arc<dyn Handler>> = instance.handlers.read().clone();
        for handler in &snapshot {
            handler.manipulate(Arc::downgrade(&instance), bundle_context.clone());
        }
        for handler in &snapshot {
            handler.start()?;
        }
        for handler in &snapshot {
            handler.try_binding()?;
        }

        info!("component instance created");
        instance.update_validity();
        Ok(instance)
    }

    pub fn state(&self) -> State {
        *self.state.lock().borrow()
    }

    pub fn get_controller_state(&self, name: &str) -> bool {
        self.controller_state.lock().get(name).copied().unwrap_or(true)
    }

    pub fn set_controller_state(&self, name: &str, value: bool) {
        let changed = {
            let mut map = self.controller_state.lock();
            let previous = map.insert(name.to_string(), value);
            previous != Some(value)
        };
        if changed {
            self.with_provider_handlers(|h| h.on_controller_change(name, value));
        }
    }

    /// The current value to inject for a declared field, or `Missing` if
    /// no handler declares that field.
    pub fn handler_value(&self, field: &str) -> DependencyValue {
        self.handlers
            .read()
            .iter()
            .find(|h| h.field() == field)
            .map(|h| h.current_value())
            .unwrap_or(DependencyValue::Missing)
    }

    /// `false` once the instance has been killed; handlers use this to
    /// ignore events delivered after `stop()`/`clear()` raced a listener
    /// callback already in flight.
    pub fn check_event(&self) -> bool {
        self.state() != State::Killed
    }

    pub fn bind(&self, handler: &dyn Handler, service: Arc<dyn Any + Send + Sync>, reference: ServiceReference) -> Result<()> {
        let _enter = self.span.enter();
        self.update_validity();
        if let Some(cb) = &self.callbacks.bind {
            if let Err(reason) = cb(self, handler.field(), &service, &reference) {
                self.mark_erroneous(&reason);
                return Err(RuntimeError::ComponentCallbackFailure(reason));
            }
        }
        Ok(())
    }

    pub fn unbind(&self, handler: &dyn Handler, service: Arc<dyn Any + Send + Sync>, reference: ServiceReference) {
        let _enter = self.span.enter();
        if let Some(cb) = &self.callbacks.unbind {
            cb(self, handler.field(), &service, &reference);
        }
        self.update_validity();
    }

    pub fn update(
        &self,
        handler: &dyn Handler,
        service: Arc<dyn Any + Send + Sync>,
        reference: ServiceReference,
        key_changed: bool,
    ) {
        let _enter = self.span.enter();
        if let Some(cb) = &self.callbacks.update {
            cb(self, handler.field(), &service, &reference, key_changed);
        }
    }

    pub fn safe_callback(&self, name: &str, reference: &ServiceReference) {
        match name {
            crate::handlers::CALLBACK_POST_REGISTRATION => {
                if let Some(cb) = &self.callbacks.post_registration {
                    cb(self, reference);
                }
            }
            crate::handlers::CALLBACK_POST_UNREGISTRATION => {
                if let Some(cb) = &self.callbacks.post_unregistration {
                    cb(self, reference);
                }
            }
            other => warn!(callback = other, "unknown safe_callback name"),
        }
    }

    /// Forces handlers to re-subscribe; used by the variable-filter
    /// handler after it re-renders its filter.
    pub fn update_bindings(&self) {
        self.update_validity();
    }

    fn with_provider_handlers(&self, f: impl Fn(&dyn Handler)) {
        for handler in self.handlers.read().iter() {
            if handler.kinds().contains(&HandlerKind::ServiceProvider) {
                f(handler.as_ref());
            }
        }
    }

    fn update_validity(&self) {
        let all_dependencies_valid = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.kinds().contains(&HandlerKind::Dependency))
            .all(|h| h.is_valid());

        let transition = {
            let guard = self.state.lock();
            let mut state = guard.borrow_mut();
            if *state == State::Invalid && all_dependencies_valid {
                *state = State::Valid;
                Some(true)
            } else if *state == State::Valid && !all_dependencies_valid {
                *state = State::Invalid;
                Some(false)
            } else {
                None
            }
        };

        match transition {
            Some(true) => self.run_validate(),
            Some(false) => self.run_invalidate(),
            None => {}
        }
    }

    fn run_validate(&self) {
        let _enter = self.span.enter();
        if let Some(cb) = &self.callbacks.validate {
            if let Err(reason) = cb(self) {
                self.mark_erroneous(&reason);
                return;
            }
        }
        info!("component validated");
        self.with_provider_handlers(|h| h.post_validate());
    }

    fn run_invalidate(&self) {
        let _enter = self.span.enter();
        self.with_provider_handlers(|h| h.pre_invalidate());
        if let Some(cb) = &self.callbacks.invalidate {
            cb(self);
        }
        info!("component invalidated");
    }

    fn mark_erroneous(&self, reason: &str) {
        let _enter = self.span.enter();
        *self.state.lock().borrow_mut() = State::Erroneous;
        error!(reason, "component callback failed, marking ERRONEOUS");
    }

    /// Tears the instance down: stops every handler in reverse
    /// registration order, then clears them.
    pub fn kill(&self) {
        let _enter = self.span.enter();
        {
            let mut state = self.state.lock().borrow_mut();
            if *state == State::Killed {
                return;
            }
            *state = State::Killed;
        }

        self.with_provider_handlers(|h| h.pre_invalidate());
        if let Some(cb) = &self.callbacks.invalidate {
            cb(self);
        }

        let handlers: Vec<Arc<dyn Handler>> = self.handlers.read().clone();
        for handler in handlers.iter().rev() {
            handler.stop();
        }
        for handler in handlers.iter().rev() {
            handler.clear();
        }
        info!("component instance killed");
    }
}

impl std::fmt::Debug for StoredInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredInstance")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
