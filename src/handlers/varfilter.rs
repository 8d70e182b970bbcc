//! Wraps a [`super::simple::SimpleDependency`] or
//! [`super::aggregate::AggregateDependency`] and re-renders its filter
//! whenever a referenced component property changes. Composition over
//! the multiple-inheritance mixin the original uses to share this
//! behaviour between its single and aggregate dependency classes.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{AggregateDependency, DependencyValue, Handler, HandlerKind, SimpleDependency};
use crate::context::{BundleContext, Requirement};
use crate::error::Result;
use crate::instance::StoredInstance;
use crate::ldap::{combine_filters, Filter, Properties, PropertyValue};

enum Child {
    Simple(Arc<SimpleDependency>),
    Aggregate(Arc<AggregateDependency>),
}

impl Child {
    fn as_handler(&self) -> &dyn Handler {
        match self {
            Child::Simple(h) => h.as_ref(),
            Child::Aggregate(h) => h.as_ref(),
        }
    }

    fn build(aggregate: bool, field: &str, requirement: Requirement) -> Self {
        if aggregate {
            Child::Aggregate(AggregateDependency::new(field.to_string(), requirement))
        } else {
            Child::Simple(SimpleDependency::new(field.to_string(), requirement))
        }
    }
}

/// Finds every `{key}` placeholder in a filter template.
fn find_keys(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                key.push(c);
            }
            if !key.is_empty() {
                keys.push(key);
            }
        }
    }
    keys
}

fn render(template: &str, properties: &Properties) -> String {
    let mut rendered = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut key = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                key.push(c);
            }
            match properties.get(&key) {
                Some(PropertyValue::Str(s)) => rendered.push_str(s),
                Some(other) => rendered.push_str(&format!("{other:?}")),
                None => {}
            }
        } else {
            rendered.push(c);
        }
    }
    rendered
}

struct State {
    instance: Weak<StoredInstance>,
    bundle_context: Option<BundleContext>,
    child: Child,
    known_properties: Properties,
    rendered_filter: String,
}

pub struct VariableFilterDependency {
    field: String,
    specification: String,
    aggregate: bool,
    optional: bool,
    template: String,
    keys: Vec<String>,
    state: Mutex<State>,
}

impl VariableFilterDependency {
    pub fn new(
        field: impl Into<String>,
        specification: impl Into<String>,
        aggregate: bool,
        optional: bool,
        template: impl Into<String>,
        initial_properties: Properties,
    ) -> Arc<Self> {
        let field = field.into();
        let specification = specification.into();
        let template = template.into();
        let keys = find_keys(&template);
        let rendered = render(&template, &initial_properties);
        let requirement = build_requirement(&specification, aggregate, optional, &rendered);
        let child = Child::build(aggregate, &field, requirement);

        Arc::new(VariableFilterDependency {
            field,
            specification,
            aggregate,
            optional,
            template,
            keys,
            state: Mutex::new(State {
                instance: Weak::new(),
                bundle_context: None,
                child,
                known_properties: initial_properties,
                rendered_filter: rendered,
            }),
        })
    }

    /// Re-renders the filter given the current known properties; if the
    /// rendered text changed, stops the current child, builds a fresh one
    /// with the new filter, and restarts it against the live instance.
    fn reset_if_changed(&self) -> Result<()> {
        let mut state = self.state.lock();
        let rendered = render(&self.template, &state.known_properties);
        if rendered == state.rendered_filter {
            return Ok(());
        }

        let requirement = build_requirement(&self.specification, self.aggregate, self.optional, &rendered);
        let instance = state.instance.clone();
        let bundle_context = state.bundle_context.clone();

        state.child.as_handler().stop();
        state.child.as_handler().clear();

        let new_child = Child::build(self.aggregate, &self.field, requirement);
        if let (Some(bundle_context), true) = (bundle_context.clone(), instance.upgrade().is_some()) {
            new_child.as_handler().manipulate(instance, bundle_context);
        }
        new_child.as_handler().start()?;
        let result = new_child.as_handler().try_binding();
        state.child = new_child;
        state.rendered_filter = rendered;
        result
    }
}

fn build_requirement(specification: &str, aggregate: bool, optional: bool, rendered_filter: &str) -> Requirement {
    let filter = Filter::parse(rendered_filter).ok();
    let mut requirement = Requirement::new(specification).aggregate(aggregate).optional(optional);
    if let Some(filter) = filter {
        requirement.set_filter(Some(filter));
    } else {
        requirement.full_filter = combine_filters(specification, None);
    }
    requirement
}

impl Handler for VariableFilterDependency {
    fn kinds(&self) -> &'static [HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn manipulate(&self, instance: Weak<StoredInstance>, bundle_context: BundleContext) {
        let mut state = self.state.lock();
        state.child.as_handler().manipulate(instance.clone(), bundle_context.clone());
        state.instance = instance;
        state.bundle_context = Some(bundle_context);
    }

    fn start(&self) -> Result<()> {
        self.state.lock().child.as_handler().start()
    }

    fn stop(&self) {
        self.state.lock().child.as_handler().stop();
    }

    fn clear(&self) {
        self.state.lock().child.as_handler().clear();
    }

    fn is_valid(&self) -> bool {
        self.state.lock().child.as_handler().is_valid()
    }

    fn current_value(&self) -> DependencyValue {
        match &self.state.lock().child {
            Child::Simple(h) => h.current_value(),
            Child::Aggregate(h) => h.current_value(),
        }
    }

    fn try_binding(&self) -> Result<()> {
        self.state.lock().child.as_handler().try_binding()
    }

    fn on_property_change(&self, name: &str, _old: &PropertyValue, new: &PropertyValue) {
        if !self.keys.iter().any(|k| k == name) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.known_properties.insert(name.to_string(), new.clone());
        }
        let _ = self.reset_if_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_keys_extracts_placeholders() {
        assert_eq!(find_keys("(kind={kind})"), vec!["kind".to_string()]);
        assert_eq!(find_keys("(x=1)"), Vec::<String>::new());
    }

    #[test]
    fn render_substitutes_known_property() {
        let mut props = Properties::new();
        props.insert("kind".to_string(), "red".into());
        assert_eq!(render("(kind={kind})", &props), "(kind=red)");
    }
}
