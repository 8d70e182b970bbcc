// Integration tests exercising full framework scenarios end to end,
// through the public `Framework`/`BundleContext` surface rather than a
// single module's internals.

use std::any::Any;
use std::sync::{Arc, Mutex};

use rusty_ipopo::context::{FactoryContext, ProvidesConfig, Requirement};
use rusty_ipopo::framework::Framework;
use rusty_ipopo::handlers::HANDLER_REQUIRES;
use rusty_ipopo::instance::{ComponentCallbacks, StoredInstance};
use rusty_ipopo::ldap::{Filter, Properties, PropertyValue};
use rusty_ipopo::registry::{Provider, ServiceEvent, ServiceEventKind, ServiceListener};
use rusty_ipopo::Config;

struct RecordingListener {
    events: Mutex<Vec<ServiceEventKind>>,
}

impl ServiceListener for RecordingListener {
    fn service_changed(&self, event: &ServiceEvent) {
        self.events.lock().unwrap().push(event.kind);
    }
}

#[test]
fn s3_end_match_through_bundle_context() {
    let framework = Framework::new(Config::default());
    let bundle_id = framework.install_bundle("scenario.s3");
    framework.start_bundle(bundle_id).unwrap();
    let bundle_context = framework.bundle_context(bundle_id);

    let listener = Arc::new(RecordingListener {
        events: Mutex::new(Vec::new()),
    });
    let filter = Filter::parse("(x=1)").unwrap();
    bundle_context.add_service_listener(listener.clone(), Some("S"), Some(filter));

    let mut props = Properties::new();
    props.insert("x".to_string(), PropertyValue::Int(1));
    let registration = bundle_context
        .register_service(vec!["S".to_string()], props, Provider::Instance(Arc::new(1i32)))
        .unwrap();

    let mut update = Properties::new();
    update.insert("x".to_string(), PropertyValue::Int(2));
    registration.set_properties(update).unwrap();

    let mut update = Properties::new();
    update.insert("x".to_string(), PropertyValue::Int(1));
    registration.set_properties(update).unwrap();

    assert_eq!(
        *listener.events.lock().unwrap(),
        vec![
            ServiceEventKind::Registered,
            ServiceEventKind::ModifiedEndmatch,
            ServiceEventKind::Modified,
        ]
    );
}

const GREETING_SPEC: &str = "test.greeting";

fn provider_factory() -> FactoryContext {
    FactoryContext::builder("test.provider")
        .provides(ProvidesConfig {
            specs: vec![GREETING_SPEC.to_string()],
            controller_field: None,
            is_factory: false,
            is_prototype: false,
            provider: Arc::new(|_instance: &StoredInstance| Arc::new(7i32) as Arc<dyn Any + Send + Sync>),
        })
        .build()
}

fn consumer_factory() -> FactoryContext {
    FactoryContext::builder("test.consumer")
        .requires(HANDLER_REQUIRES, "greeting", Requirement::new(GREETING_SPEC))
        .build()
}

#[test]
fn provider_and_consumer_validate_and_invalidate_across_bundle_stop() {
    let framework = Framework::new(Config::default());
    let bundle_id = framework.install_bundle("scenario.lifecycle");
    framework.start_bundle(bundle_id).unwrap();

    framework.register_factory(bundle_id, provider_factory());
    framework.register_factory(bundle_id, consumer_factory());

    framework
        .instantiate("test.provider", "provider-1", Properties::new(), ComponentCallbacks::default())
        .unwrap();

    let validated = Arc::new(Mutex::new(false));
    let invalidated = Arc::new(Mutex::new(false));
    let validated_clone = validated.clone();
    let invalidated_clone = invalidated.clone();

    let callbacks = ComponentCallbacks {
        validate: Some(Box::new(move |_inst: &StoredInstance| {
            *validated_clone.lock().unwrap() = true;
            Ok(())
        })),
        invalidate: Some(Box::new(move |_inst: &StoredInstance| {
            *invalidated_clone.lock().unwrap() = true;
        })),
        ..ComponentCallbacks::default()
    };

    let consumer = framework
        .instantiate("test.consumer", "consumer-1", Properties::new(), callbacks)
        .unwrap();

    assert!(*validated.lock().unwrap());
    assert_eq!(consumer.state(), rusty_ipopo::instance::State::Valid);

    framework.stop_bundle(bundle_id).unwrap();

    assert!(*invalidated.lock().unwrap());
}
