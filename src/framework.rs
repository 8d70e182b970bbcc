//! The framework shell: owns the service registry, the handler-factory
//! registry, installed bundles, and running component instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::context::{BundleContext, ComponentContext, FactoryContext, HandlerConfig};
use crate::error::{Result, RuntimeError};
use crate::handlers::{
    AggregateDependency, BestDependency, BroadcastDependency, Handler, HandlerFactory,
    HandlerFactoryRegistry, MapDependency, ServiceRegistrationHandler, SimpleDependency,
    TemporalDependency, VariableFilterDependency, HANDLER_PROVIDES, HANDLER_REQUIRES,
    HANDLER_REQUIRES_BEST, HANDLER_REQUIRES_BROADCAST, HANDLER_REQUIRES_MAP,
    HANDLER_REQUIRES_TEMPORAL, HANDLER_REQUIRES_VARIABLE_FILTER,
};
use crate::instance::{ComponentCallbacks, StoredInstance};
use crate::ldap::Properties;
use crate::registry::{BundleEvent, BundleEventKind, EventDispatcher, ServiceRegistry};
use crate::{BundleId, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Installed,
    Starting,
    Active,
    Stopping,
    Resolved,
}

pub struct Bundle {
    pub id: BundleId,
    pub symbolic_name: String,
    pub state: BundleState,
}

struct RequiresFactory;
impl HandlerFactory for RequiresFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_REQUIRES
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Requirements(reqs)) = ctx.get_handler(HANDLER_REQUIRES) {
            for (field, requirement) in reqs {
                if requirement.aggregate {
                    out.push(AggregateDependency::new(field.clone(), requirement.copy()));
                } else {
                    out.push(SimpleDependency::new(field.clone(), requirement.copy()));
                }
            }
        }
        Ok(out)
    }
}

struct BestFactory;
impl HandlerFactory for BestFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_REQUIRES_BEST
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Requirements(reqs)) = ctx.get_handler(HANDLER_REQUIRES_BEST) {
            for (field, requirement) in reqs {
                out.push(BestDependency::new(field.clone(), requirement.copy()));
            }
        }
        Ok(out)
    }
}

struct MapFactory;
impl HandlerFactory for MapFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_REQUIRES_MAP
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Requirements(reqs)) = ctx.get_handler(HANDLER_REQUIRES_MAP) {
            for (field, requirement) in reqs {
                let key_property = requirement
                    .key_property
                    .clone()
                    .ok_or_else(|| RuntimeError::InvalidRequirement(format!("{field}: map dependency needs a key_property")))?;
                out.push(MapDependency::new(field.clone(), requirement.copy(), key_property, requirement.allow_none));
            }
        }
        Ok(out)
    }
}

struct BroadcastFactory;
impl HandlerFactory for BroadcastFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_REQUIRES_BROADCAST
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Requirements(reqs)) = ctx.get_handler(HANDLER_REQUIRES_BROADCAST) {
            for (field, requirement) in reqs {
                out.push(BroadcastDependency::new(
                    field.clone(),
                    requirement.copy(),
                    requirement.muffle_exceptions,
                    requirement.trace_exceptions,
                ));
            }
        }
        Ok(out)
    }
}

struct TemporalFactory;
impl HandlerFactory for TemporalFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_REQUIRES_TEMPORAL
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Requirements(reqs)) = ctx.get_handler(HANDLER_REQUIRES_TEMPORAL) {
            for (field, requirement) in reqs {
                let timeout = requirement.timeout.unwrap_or(std::time::Duration::from_secs(10));
                out.push(TemporalDependency::new(field.clone(), requirement.copy(), timeout));
            }
        }
        Ok(out)
    }
}

struct VariableFilterFactory;
impl HandlerFactory for VariableFilterFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_REQUIRES_VARIABLE_FILTER
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Requirements(reqs)) = ctx.get_handler(HANDLER_REQUIRES_VARIABLE_FILTER) {
            for (field, requirement) in reqs {
                let template = requirement
                    .template
                    .clone()
                    .ok_or_else(|| RuntimeError::InvalidRequirement(format!("{field}: variable-filter dependency needs a template")))?;
                out.push(VariableFilterDependency::new(
                    field.clone(),
                    requirement.specification.clone(),
                    requirement.aggregate,
                    requirement.optional,
                    template,
                    ctx.properties.clone(),
                ));
            }
        }
        Ok(out)
    }
}

struct ProvidesFactory;
impl HandlerFactory for ProvidesFactory {
    fn handler_id(&self) -> &'static str {
        HANDLER_PROVIDES
    }

    fn get_handlers(&self, ctx: &ComponentContext) -> Result<Vec<Arc<dyn Handler>>> {
        let mut out: Vec<Arc<dyn Handler>> = Vec::new();
        if let Some(HandlerConfig::Provides(configs)) = ctx.get_handler(HANDLER_PROVIDES) {
            for config in configs {
                out.push(ServiceRegistrationHandler::new(
                    config.specs.clone(),
                    config.controller_field.clone(),
                    ctx.properties.clone(),
                    config.provider.clone(),
                ));
            }
        }
        Ok(out)
    }
}

fn default_handler_registry() -> HandlerFactoryRegistry {
    let mut registry = HandlerFactoryRegistry::new();
    registry.register(Arc::new(RequiresFactory));
    registry.register(Arc::new(BestFactory));
    registry.register(Arc::new(MapFactory));
    registry.register(Arc::new(BroadcastFactory));
    registry.register(Arc::new(TemporalFactory));
    registry.register(Arc::new(VariableFilterFactory));
    registry.register(Arc::new(ProvidesFactory));
    registry
}

pub struct Framework {
    registry: ServiceRegistry,
    handler_registry: HandlerFactoryRegistry,
    next_bundle_id: AtomicU64,
    bundles: RwLock<HashMap<BundleId, Bundle>>,
    factories: RwLock<HashMap<String, (BundleId, Arc<FactoryContext>)>>,
    instances: RwLock<HashMap<String, Arc<StoredInstance>>>,
    framework_properties: Arc<Properties>,
}

impl Framework {
    pub fn new(config: Config) -> Arc<Self> {
        let mut properties = Properties::new();
        properties.insert("framework.log_level".to_string(), config.log_level.clone().into());

        Arc::new(Framework {
            registry: ServiceRegistry::new(Arc::new(EventDispatcher::new())),
            handler_registry: default_handler_registry(),
            next_bundle_id: AtomicU64::new(1),
            bundles: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            framework_properties: Arc::new(properties),
        })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn bundle_context(&self, bundle_id: BundleId) -> BundleContext {
        BundleContext::new(bundle_id, self.registry.clone(), self.framework_properties.clone())
    }

    #[instrument(skip(self))]
    pub fn install_bundle(&self, symbolic_name: impl Into<String>) -> BundleId {
        let symbolic_name = symbolic_name.into();
        let id = self.next_bundle_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.bundles.write().insert(
            id,
            Bundle {
                id,
                symbolic_name: symbolic_name.clone(),
                state: BundleState::Installed,
            },
        );
        self.registry
            .dispatcher()
            .fire_bundle_event(BundleEvent { kind: BundleEventKind::Installed, bundle_id: id });
        info!(bundle_id = id, symbolic_name, "bundle installed");
        id
    }

    pub fn start_bundle(&self, bundle_id: BundleId) -> Result<()> {
        self.set_bundle_state(bundle_id, BundleState::Starting)?;
        self.registry
            .dispatcher()
            .fire_bundle_event(BundleEvent { kind: BundleEventKind::Starting, bundle_id });

        self.set_bundle_state(bundle_id, BundleState::Active)?;
        self.registry
            .dispatcher()
            .fire_bundle_event(BundleEvent { kind: BundleEventKind::Started, bundle_id });
        Ok(())
    }

    /// Hides the bundle's published services before tearing down its
    /// component instances, the STOPPING-event delivery window described
    /// in the service registry design.
    pub fn stop_bundle(&self, bundle_id: BundleId) -> Result<()> {
        self.set_bundle_state(bundle_id, BundleState::Stopping)?;
        self.registry
            .dispatcher()
            .fire_bundle_event(BundleEvent { kind: BundleEventKind::Stopping, bundle_id });

        self.registry.hide_bundle_services(bundle_id);

        let instance_names: Vec<String> = self
            .instances
            .read()
            .iter()
            .filter(|(_, i)| i.bundle_context.bundle_id == bundle_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in instance_names {
            let _ = self.kill_instance(&name);
        }

        self.registry.unget_used_services(bundle_id);
        self.set_bundle_state(bundle_id, BundleState::Resolved)?;
        self.registry
            .dispatcher()
            .fire_bundle_event(BundleEvent { kind: BundleEventKind::Stopped, bundle_id });
        Ok(())
    }

    fn set_bundle_state(&self, bundle_id: BundleId, state: BundleState) -> Result<()> {
        let mut bundles = self.bundles.write();
        let bundle = bundles.get_mut(&bundle_id).ok_or(RuntimeError::BundleNotActive(bundle_id))?;
        bundle.state = state;
        Ok(())
    }

    /// Associates `factory` with the bundle that declared it; every
    /// instance later created from it gets a `BundleContext` scoped to
    /// that bundle, so `stop_bundle` tears down the right instances.
    pub fn register_factory(&self, bundle_id: BundleId, factory: FactoryContext) {
        self.factories
            .write()
            .insert(factory.factory_name.clone(), (bundle_id, Arc::new(factory)));
    }

    #[instrument(skip(self, properties, callbacks))]
    pub fn instantiate(
        &self,
        factory_name: &str,
        instance_name: impl Into<String>,
        properties: Properties,
        callbacks: ComponentCallbacks,
    ) -> Result<Arc<StoredInstance>> {
        let instance_name = instance_name.into();
        let (owning_bundle, factory) = self
            .factories
            .read()
            .get(factory_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownHandlerFactory(factory_name.to_string()))?;

        if self.instances.read().contains_key(&instance_name) {
            return Err(RuntimeError::DuplicateInstance(instance_name));
        }

        let component_context = ComponentContext::new(factory, instance_name.clone(), properties);
        let bundle_context = self.bundle_context(owning_bundle);
        let instance = StoredInstance::create(bundle_context, &self.handler_registry, component_context, callbacks)?;

        self.instances.write().insert(instance_name, instance.clone());
        Ok(instance)
    }

    pub fn kill_instance(&self, instance_name: &str) -> Result<()> {
        let instance = self
            .instances
            .write()
            .remove(instance_name)
            .ok_or_else(|| RuntimeError::UnknownInstance(instance_name.to_string()))?;
        instance.kill();
        Ok(())
    }

    pub fn get_instance(&self, instance_name: &str) -> Option<Arc<StoredInstance>> {
        self.instances.read().get(instance_name).cloned()
    }

    pub fn stop(&self) {
        self.registry.dispatcher().fire_framework_stopping();
        let bundle_ids: Vec<BundleId> = self.bundles.read().keys().copied().collect();
        for id in bundle_ids {
            if let Err(e) = self.stop_bundle(id) {
                warn!(bundle_id = id, error = %e, "error stopping bundle during framework shutdown");
            }
        }
    }
}
