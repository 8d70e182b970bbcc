//! Small demo binary: boots a [`Framework`], registers two component
//! factories (a provider and a consumer wired through a simple
//! dependency), and instantiates one of each to show the validate/bind
//! lifecycle end to end.

use std::any::Any;
use std::sync::Arc;

use tracing::info;

use rusty_ipopo::context::{FactoryContext, ProvidesConfig, Requirement};
use rusty_ipopo::framework::Framework;
use rusty_ipopo::handlers::HANDLER_REQUIRES;
use rusty_ipopo::instance::{ComponentCallbacks, StoredInstance};
use rusty_ipopo::ldap::Properties;
use rusty_ipopo::registry::ServiceReference;
use rusty_ipopo::Config;

const GREETING_SPEC: &str = "demo.greeting";

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("starting rusty-ipopo demo");

    let framework = Framework::new(Config::default());
    let bundle_id = framework.install_bundle("demo.bundle");
    framework.start_bundle(bundle_id).expect("bundle starts");

    framework.register_factory(bundle_id, provider_factory());
    framework.register_factory(bundle_id, consumer_factory());

    let _provider = framework
        .instantiate(
            "demo.provider",
            "provider-1",
            Properties::new(),
            ComponentCallbacks::default(),
        )
        .expect("provider instantiates");

    let callbacks = ComponentCallbacks {
        bind: Some(Box::new(
            |_instance: &StoredInstance, field: &str, service: &Arc<dyn Any + Send + Sync>, _reference: &ServiceReference| {
                let greeting = service.downcast_ref::<String>().expect("greeting is a String");
                info!(field, greeting, "consumer bound to greeting service");
                Ok(())
            },
        )),
        validate: Some(Box::new(|_instance: &StoredInstance| {
            info!("consumer validated");
            Ok(())
        })),
        ..ComponentCallbacks::default()
    };

    let consumer = framework
        .instantiate("demo.consumer", "consumer-1", Properties::new(), callbacks)
        .expect("consumer instantiates");

    info!(state = ?consumer.state(), "consumer final state");

    framework.stop();
}

fn provider_factory() -> FactoryContext {
    FactoryContext::builder("demo.provider")
        .provides(ProvidesConfig {
            specs: vec![GREETING_SPEC.to_string()],
            controller_field: None,
            is_factory: false,
            is_prototype: false,
            provider: Arc::new(|_instance: &StoredInstance| {
                Arc::new(String::from("hello from rusty-ipopo")) as Arc<dyn Any + Send + Sync>
            }),
        })
        .build()
}

fn consumer_factory() -> FactoryContext {
    FactoryContext::builder("demo.consumer")
        .requires(HANDLER_REQUIRES, "greeting", Requirement::new(GREETING_SPEC))
        .build()
}
