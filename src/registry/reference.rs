use std::any::Any;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;

use crate::ldap::{Properties, PropertyValue};
use crate::{BundleId, ServiceId};

/// Scope under which a service was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Singleton,
    Bundle,
    Prototype,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Singleton => "singleton",
            Scope::Bundle => "bundle",
            Scope::Prototype => "prototype",
        }
    }
}

/// A service-producing factory, scoped per consuming bundle: every bundle
/// that calls `get_service` on a bundle-scope factory reference shares the
/// single instance the factory produces for that bundle.
pub trait ServiceFactory: Send + Sync {
    fn get_service(
        &self,
        bundle_id: BundleId,
        reference: &ServiceReference,
    ) -> Arc<dyn Any + Send + Sync>;

    fn unget_service(
        &self,
        bundle_id: BundleId,
        reference: &ServiceReference,
        instance: Arc<dyn Any + Send + Sync>,
    );
}

/// A service-producing factory scoped per `get_service` call: every call
/// produces a fresh instance, even for the same consuming bundle.
pub trait PrototypeServiceFactory: Send + Sync {
    fn get_service(
        &self,
        bundle_id: BundleId,
        reference: &ServiceReference,
    ) -> Arc<dyn Any + Send + Sync>;

    fn unget_service(
        &self,
        bundle_id: BundleId,
        reference: &ServiceReference,
        instance: Arc<dyn Any + Send + Sync>,
    );
}

struct ServiceReferenceInner {
    id: ServiceId,
    bundle_id: BundleId,
    specs: Vec<String>,
    scope: Scope,
    properties: RwLock<Properties>,
    ranking: AtomicI64,
    // Non-owning relation: which bundles currently hold a usage count on
    // this reference. Keyed lookup only, dropped with the bundle — never
    // an owning pointer back to the bundle.
    using_bundles: DashSet<BundleId>,
}

/// A stable, cheaply-cloneable handle to a published service.
///
/// Equality, hashing and ordering are all defined purely in terms of
/// `service.id`: two clones of the same reference compare equal, and the
/// registry's per-specification lists are kept sorted by
/// `(-ranking, +service_id)` using this `Ord` impl directly.
#[derive(Clone)]
pub struct ServiceReference {
    inner: Arc<ServiceReferenceInner>,
}

impl ServiceReference {
    pub(crate) fn new(
        id: ServiceId,
        bundle_id: BundleId,
        specs: Vec<String>,
        scope: Scope,
        properties: Properties,
        ranking: i64,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceReferenceInner {
                id,
                bundle_id,
                specs,
                scope,
                properties: RwLock::new(properties),
                ranking: AtomicI64::new(ranking),
                using_bundles: DashSet::new(),
            }),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    pub fn bundle_id(&self) -> BundleId {
        self.inner.bundle_id
    }

    pub fn specs(&self) -> &[String] {
        &self.inner.specs
    }

    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    pub fn ranking(&self) -> i64 {
        self.inner.ranking.load(AtomicOrdering::SeqCst)
    }

    pub fn get_properties(&self) -> Properties {
        self.inner.properties.read().clone()
    }

    pub fn get_property(&self, key: &str) -> Option<PropertyValue> {
        self.inner.properties.read().get(key).cloned()
    }

    /// `(-ranking, +service_id)`: higher ranking sorts first, ties broken
    /// by lower id.
    pub fn sort_key(&self) -> (i64, ServiceId) {
        (-self.ranking(), self.inner.id)
    }

    pub fn mark_using(&self, bundle_id: BundleId) {
        self.inner.using_bundles.insert(bundle_id);
    }

    pub fn unmark_using(&self, bundle_id: BundleId) {
        self.inner.using_bundles.remove(&bundle_id);
    }

    pub fn using_bundles(&self) -> Vec<BundleId> {
        self.inner.using_bundles.iter().map(|b| *b).collect()
    }

    /// Replaces the property map wholesale and updates the cached ranking;
    /// used by `ServiceRegistration::set_properties` after it has computed
    /// the merged map and filtered forbidden keys.
    pub(crate) fn replace_properties(&self, props: Properties, ranking: i64) {
        *self.inner.properties.write() = props;
        self.inner.ranking.store(ranking, AtomicOrdering::SeqCst);
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl std::fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.inner.id)
            .field("specs", &self.inner.specs)
            .field("ranking", &self.ranking())
            .finish()
    }
}

/// Per (bundle, reference) count of outstanding `get_service` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageCounter(pub u32);

/// Per-bundle bookkeeping for a factory-produced service: one cached
/// instance + counter for a bundle-scope factory, or a growable list of
/// distinct instances for a prototype-scope factory.
pub enum FactoryCounter {
    Bundle {
        instance: Arc<dyn Any + Send + Sync>,
        count: u32,
    },
    Prototype {
        instances: Vec<Arc<dyn Any + Send + Sync>>,
    },
}
