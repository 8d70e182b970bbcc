//! Per-bundle facade over the registry and dispatcher, plus the
//! declarative metadata (`Requirement`, `FactoryContext`, `ComponentContext`)
//! that a component factory is built from.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::instance::StoredInstance;
use crate::ldap::{combine_filters, Filter, Properties};
use crate::registry::{
    BundleListener, EventDispatcher, FrameworkStoppingListener, Provider, ServiceListener,
    ServiceReference, ServiceRegistration, ServiceRegistry,
};
use crate::BundleId;

/// Per-bundle facade over the service registry and event dispatcher. Every
/// `register_service` / `get_service` call is attributed to `bundle_id` so
/// usage counters and `hide_bundle_services` work correctly.
#[derive(Clone)]
pub struct BundleContext {
    pub bundle_id: BundleId,
    registry: ServiceRegistry,
    framework_properties: Arc<Properties>,
}

impl BundleContext {
    pub fn new(bundle_id: BundleId, registry: ServiceRegistry, framework_properties: Arc<Properties>) -> Self {
        Self {
            bundle_id,
            registry,
            framework_properties,
        }
    }

    pub fn framework_property(&self, key: &str) -> Option<crate::ldap::PropertyValue> {
        self.framework_properties.get(key).cloned()
    }

    pub fn register_service(
        &self,
        specs: Vec<String>,
        properties: Properties,
        provider: Provider,
    ) -> Result<ServiceRegistration> {
        self.registry.register(self.bundle_id, specs, properties, provider)
    }

    pub fn get_service(&self, reference: &ServiceReference) -> Result<Arc<dyn Any + Send + Sync>> {
        self.registry.get_service(self.bundle_id, reference)
    }

    pub fn unget_service(&self, reference: &ServiceReference) -> Result<bool> {
        self.registry.unget_service(self.bundle_id, reference)
    }

    pub fn get_service_reference(&self, spec: &str, filter: Option<&Filter>) -> Result<Option<ServiceReference>> {
        Ok(self
            .registry
            .find_service_references(Some(spec), filter, true)?
            .into_iter()
            .next())
    }

    pub fn get_all_service_references(&self, spec: &str, filter: Option<&Filter>) -> Result<Vec<ServiceReference>> {
        self.registry.find_service_references(Some(spec), filter, false)
    }

    pub fn add_service_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        spec: Option<&str>,
        filter: Option<Filter>,
    ) -> u64 {
        self.registry
            .dispatcher()
            .add_service_listener(self.bundle_id, listener, spec.map(str::to_string), filter)
    }

    pub fn remove_service_listener(&self, token: u64) {
        self.registry.dispatcher().remove_service_listener(token);
    }

    pub fn add_bundle_listener(&self, listener: Arc<dyn BundleListener>) {
        self.registry.dispatcher().add_bundle_listener(listener);
    }

    pub fn add_stopping_listener(&self, listener: Arc<dyn FrameworkStoppingListener>) {
        self.registry.dispatcher().add_stopping_listener(listener);
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        self.registry.dispatcher()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}

/// A single declared dependency: which specification, whether it is
/// aggregate/optional/immediate-rebind, and the filter to match against.
/// `full_filter` is `(objectClass=spec) & filter`, recomputed whenever
/// `filter` is replaced (e.g. by the variable-filter handler).
///
/// The last four fields are only meaningful to one particular handler
/// kind each (map/broadcast/temporal/variable-filter); keeping them here
/// rather than in a per-kind config type lets every handler-id share the
/// same `HandlerConfig::Requirements` payload shape.
#[derive(Clone)]
pub struct Requirement {
    pub specification: String,
    pub aggregate: bool,
    pub optional: bool,
    pub immediate_rebind: bool,
    pub filter: Option<Filter>,
    pub full_filter: Filter,
    pub key_property: Option<String>,
    pub allow_none: bool,
    pub muffle_exceptions: bool,
    pub trace_exceptions: bool,
    pub timeout: Option<std::time::Duration>,
    pub template: Option<String>,
}

impl Requirement {
    pub fn new(specification: impl Into<String>) -> Self {
        let specification = specification.into();
        let full_filter = combine_filters(&specification, None);
        Self {
            specification,
            aggregate: false,
            optional: false,
            immediate_rebind: false,
            filter: None,
            full_filter,
            key_property: None,
            allow_none: false,
            muffle_exceptions: false,
            trace_exceptions: false,
            timeout: None,
            template: None,
        }
    }

    pub fn aggregate(mut self, value: bool) -> Self {
        self.aggregate = value;
        self
    }

    pub fn optional(mut self, value: bool) -> Self {
        self.optional = value;
        self
    }

    pub fn immediate_rebind(mut self, value: bool) -> Self {
        self.immediate_rebind = value;
        self
    }

    pub fn key_property(mut self, key: impl Into<String>) -> Self {
        self.key_property = Some(key.into());
        self
    }

    /// Whether a service missing the key property is still accepted,
    /// bucketed under the `None` key, by a map dependency. Independent of
    /// `optional`, which instead governs whether an empty binding set
    /// keeps the component valid.
    pub fn allow_none(mut self, value: bool) -> Self {
        self.allow_none = value;
        self
    }

    pub fn muffle_exceptions(mut self, value: bool) -> Self {
        self.muffle_exceptions = value;
        self
    }

    pub fn trace_exceptions(mut self, value: bool) -> Self {
        self.trace_exceptions = value;
        self
    }

    pub fn timeout(mut self, value: std::time::Duration) -> Self {
        self.timeout = Some(value);
        self
    }

    pub fn template(mut self, value: impl Into<String>) -> Self {
        self.template = Some(value.into());
        self
    }

    pub fn set_filter(&mut self, filter: Option<Filter>) {
        self.full_filter = combine_filters(&self.specification, filter.as_ref());
        self.filter = filter;
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.set_filter(Some(filter));
        self
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }
}

/// Per-class descriptor built by a [`FactoryContextBuilder`]. Plays the
/// role decorator metadata plays upstream: factory name, declared
/// handler configuration, and lifecycle callback markers, all as plain
/// values instead of annotations.
#[derive(Clone)]
pub struct FactoryContext {
    pub factory_name: String,
    pub singleton: bool,
    pub public_properties: Properties,
    pub hidden_properties: Properties,
    /// handler-id -> opaque configuration blob, interpreted by that
    /// handler's factory (e.g. the list of `Requirement`s for
    /// `"ipopo.requires"`).
    pub handler_config: HashMap<String, HandlerConfig>,
}

/// Per-handler-kind configuration payload threaded through
/// `FactoryContext::handler_config`. A real component model may want this
/// to be fully generic; in this runtime the seven dependency-handler
/// kinds and the service-provider kind are the only payload shapes, so a
/// closed enum is clearer than a trait-object bag.
#[derive(Clone)]
pub enum HandlerConfig {
    Requirements(Vec<(String, Requirement)>),
    Provides(Vec<ProvidesConfig>),
}

#[derive(Clone)]
pub struct ProvidesConfig {
    pub specs: Vec<String>,
    pub controller_field: Option<String>,
    pub is_factory: bool,
    pub is_prototype: bool,
    /// Builds the object actually handed to consumers. Rust has no bare
    /// "self" to register the way a decorated class instance does
    /// upstream, so the component factory supplies this instead.
    pub provider: Arc<dyn Fn(&StoredInstance) -> Arc<dyn Any + Send + Sync> + Send + Sync>,
}

impl FactoryContext {
    pub fn builder(factory_name: impl Into<String>) -> FactoryContextBuilder {
        FactoryContextBuilder {
            context: FactoryContext {
                factory_name: factory_name.into(),
                singleton: false,
                public_properties: Properties::new(),
                hidden_properties: Properties::new(),
                handler_config: HashMap::new(),
            },
        }
    }

    pub fn get_handler(&self, handler_id: &str) -> Option<&HandlerConfig> {
        self.handler_config.get(handler_id)
    }
}

pub struct FactoryContextBuilder {
    context: FactoryContext,
}

impl FactoryContextBuilder {
    pub fn property(mut self, key: impl Into<String>, value: impl Into<crate::ldap::PropertyValue>) -> Self {
        self.context.public_properties.insert(key.into(), value.into());
        self
    }

    pub fn hidden_property(mut self, key: impl Into<String>, value: impl Into<crate::ldap::PropertyValue>) -> Self {
        self.context.hidden_properties.insert(key.into(), value.into());
        self
    }

    pub fn provides(mut self, config: ProvidesConfig) -> Self {
        match self.context.handler_config.entry("ipopo.provides".to_string()).or_insert_with(|| HandlerConfig::Provides(Vec::new())) {
            HandlerConfig::Provides(list) => list.push(config),
            _ => unreachable!(),
        }
        self
    }

    pub fn requires(mut self, handler_id: impl Into<String>, field: impl Into<String>, requirement: Requirement) -> Self {
        match self
            .context
            .handler_config
            .entry(handler_id.into())
            .or_insert_with(|| HandlerConfig::Requirements(Vec::new()))
        {
            HandlerConfig::Requirements(list) => list.push((field.into(), requirement)),
            _ => unreachable!(),
        }
        self
    }

    pub fn build(self) -> FactoryContext {
        self.context
    }
}

/// Runtime instance descriptor: the merged public properties plus the
/// one-shot hidden properties a handler may `grab` exactly once.
pub struct ComponentContext {
    pub factory_context: Arc<FactoryContext>,
    pub instance_name: String,
    pub properties: Properties,
    hidden_properties: Option<Properties>,
}

impl ComponentContext {
    pub fn new(factory_context: Arc<FactoryContext>, instance_name: String, instance_properties: Properties) -> Self {
        let mut properties = factory_context.public_properties.clone();
        for (k, v) in instance_properties {
            properties.insert(k, v);
        }
        properties.insert("instance.name".to_string(), instance_name.clone().into());

        Self {
            hidden_properties: Some(factory_context.hidden_properties.clone()),
            factory_context,
            instance_name,
            properties,
        }
    }

    pub fn get_handler(&self, handler_id: &str) -> Option<&HandlerConfig> {
        self.factory_context.get_handler(handler_id)
    }

    pub fn has_hidden_properties(&self) -> bool {
        self.hidden_properties.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Consumes the hidden properties; a second call returns `None`.
    pub fn grab_hidden_properties(&mut self) -> Option<Properties> {
        self.hidden_properties.take()
    }
}
