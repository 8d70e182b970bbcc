//! Pluggable per-instance policies: the seven dependency-handler kinds
//! plus the service-provider handler, all behind one `Handler` trait
//! object so [`crate::instance::StoredInstance`] can drive them uniformly.

pub mod aggregate;
pub mod best;
pub mod broadcast;
pub mod map;
pub mod provides;
pub mod simple;
pub mod temporal;
pub mod varfilter;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::context::{BundleContext, ComponentContext};
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::ldap::PropertyValue;
use crate::registry::ServiceReference;

pub use aggregate::AggregateDependency;
pub use best::BestDependency;
pub use broadcast::{BroadcastDependency, BroadcastHandle};
pub use map::MapDependency;
pub use provides::ServiceRegistrationHandler;
pub use simple::SimpleDependency;
pub use temporal::{TemporalDependency, TemporalHandle};
pub use varfilter::VariableFilterDependency;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Dependency,
    ServiceProvider,
}

/// What gets injected for a given field, queried by component code through
/// `StoredInstance::handler_value`. Rust has no runtime reflection to poke
/// a value into an arbitrary struct field, so injection here is a typed
/// pull (the field's current value, fetched by name) rather than Python's
/// dynamic `setattr`.
#[derive(Clone)]
pub enum DependencyValue {
    Missing,
    Single(Arc<dyn Any + Send + Sync>),
    Many(Vec<Arc<dyn Any + Send + Sync>>),
    Keyed(HashMap<Option<String>, Arc<dyn Any + Send + Sync>>),
    KeyedMany(HashMap<Option<String>, Vec<Arc<dyn Any + Send + Sync>>>),
    Broadcast(BroadcastHandle),
    Temporal(TemporalHandle),
}

/// A reusable per-field policy. Every method takes `&self`: handlers hold
/// their own interior lock (matching the "handlers hold their own
/// reentrant lock" rule in the concurrency design) so the same `Arc` can
/// be registered as a service listener and held by the instance manager at
/// once.
pub trait Handler: Send + Sync {
    fn kinds(&self) -> &'static [HandlerKind];

    fn field(&self) -> &str;

    /// Stores the back-reference to the owning instance and its bundle
    /// context. Called once, before `start`.
    fn manipulate(&self, instance: Weak<StoredInstance>, bundle_context: BundleContext);

    fn start(&self) -> Result<()>;

    /// Stops listening; returns the bindings that were active so the
    /// caller can decide whether to unbind them explicitly.
    fn stop(&self);

    fn clear(&self);

    fn is_valid(&self) -> bool;

    fn current_value(&self) -> DependencyValue {
        DependencyValue::Missing
    }

    /// Looks for already-registered matches immediately after `start`.
    fn try_binding(&self) -> Result<()> {
        Ok(())
    }

    fn post_validate(&self) {}

    fn pre_invalidate(&self) {}

    fn on_controller_change(&self, _name: &str, _value: bool) {}

    fn on_property_change(&self, _name: &str, _old: &PropertyValue, _new: &PropertyValue) {}
}

/// Builds the handler objects declared for one handler-id in a
/// `FactoryContext`.
pub trait HandlerFactory: Send + Sync {
    fn handler_id(&self) -> &'static str;

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>>;
}

/// Maps handler-id to the factory that builds per-instance handler
/// objects for it, populated once at framework construction.
#[derive(Default)]
pub struct HandlerFactoryRegistry {
    factories: HashMap<&'static str, Arc<dyn HandlerFactory>>,
}

impl HandlerFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(factory.handler_id(), factory);
    }

    pub fn get(&self, handler_id: &str) -> Option<&Arc<dyn HandlerFactory>> {
        self.factories.get(handler_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &&'static str> {
        self.factories.keys()
    }
}

pub const HANDLER_REQUIRES: &str = "ipopo.requires";
pub const HANDLER_REQUIRES_BEST: &str = "ipopo.requires.best";
pub const HANDLER_REQUIRES_MAP: &str = "ipopo.requires.map";
pub const HANDLER_REQUIRES_BROADCAST: &str = "ipopo.requires.broadcast";
pub const HANDLER_REQUIRES_VARIABLE_FILTER: &str = "ipopo.requires.variable_filter";
pub const HANDLER_REQUIRES_TEMPORAL: &str = "ipopo.requires.temporal";
pub const HANDLER_PROVIDES: &str = "ipopo.provides";

pub const CALLBACK_POST_REGISTRATION: &str = "post_registration";
pub const CALLBACK_POST_UNREGISTRATION: &str = "post_unregistration";

/// Logs and swallows a reference comparison used by every dependency
/// handler's `ServiceListener` impl to ignore stale events delivered
/// after `stop()`/`clear()` (mirrors `check_event`'s role upstream).
pub(crate) fn reference_eq(a: &ServiceReference, b: &ServiceReference) -> bool {
    a == b
}
