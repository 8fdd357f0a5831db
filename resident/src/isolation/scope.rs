use fnv::FnvHashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::isolation::ambient::Ambient;

pub type Listener = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub data: serde_json::Value,
}

///
/// Listeners registered while handling a request. They belong to that
/// request only and are dropped on purge.
///
#[derive(Default)]
pub struct EventRegistry {
    listeners: HashMap<String, Vec<Listener>>,
}

impl EventRegistry {
    pub fn on<F>(&mut self, name: &str, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners
            .entry(name.to_owned())
            .or_default()
            .push(Box::new(listener));
    }

    pub fn off(&mut self, name: &str) -> usize {
        self.listeners.remove(name).map(|l| l.len()).unwrap_or(0)
    }

    /// Calls every listener for `name` in registration order, returning how
    /// many were called.
    pub fn trigger(&self, name: &str, data: serde_json::Value) -> usize {
        let listeners = match self.listeners.get(name) {
            Some(listeners) => listeners,
            None => return 0,
        };
        let event = Event {
            name: name.to_owned(),
            data,
        };

        for listener in listeners.iter() {
            listener(&event);
        }

        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.listener_count();
        self.listeners.clear();
        count
    }
}

///
/// Request-lifetime component instances keyed by type.
///
#[derive(Default)]
pub struct ComponentCache {
    instances: FnvHashMap<TypeId, Box<dyn Any + Send>>,
}

impl ComponentCache {
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.instances
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.instances
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>())
    }

    pub fn insert<T: Any + Send>(&mut self, value: T) {
        self.instances.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub(crate) fn insert_boxed(&mut self, id: TypeId, value: Box<dyn Any + Send>) {
        self.instances.insert(id, value);
    }

    pub(crate) fn get_boxed_mut(&mut self, id: &TypeId) -> Option<&mut Box<dyn Any + Send>> {
        self.instances.get_mut(id)
    }

    pub fn contains<T: Any + Send>(&self) -> bool {
        self.instances.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.instances.len();
        self.instances.clear();
        count
    }
}

///
/// What the router resolved for the current request.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteState {
    pub module: Option<String>,
    pub controller: Option<String>,
    pub action: Option<String>,
    /// Behaviors attached to the active controller.
    pub behaviors: Vec<String>,
    pub loaded_modules: Vec<String>,
}

impl RouteState {
    pub fn is_empty(&self) -> bool {
        self == &RouteState::default()
    }

    pub fn clear(&mut self) -> bool {
        let had_state = !self.is_empty();
        *self = RouteState::default();
        had_state
    }
}

///
/// Nesting stack and id counter used by templates to render widgets.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WidgetStack {
    stack: Vec<String>,
    counter: u64,
}

impl WidgetStack {
    /// Opens a widget and returns its generated id (`w0`, `w1`, ...).
    pub fn begin(&mut self, name: &str) -> String {
        let id = format!("w{}", self.counter);
        self.counter += 1;
        self.stack.push(name.to_owned());
        id
    }

    pub fn end(&mut self) -> Option<String> {
        self.stack.pop()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn clear(&mut self) -> bool {
        let dirty = self.counter > 0 || !self.stack.is_empty();
        self.stack.clear();
        self.counter = 0;
        dirty
    }
}

///
/// Every piece of mutable state a request can touch besides its response and
/// session. Scopes are pooled by the worker and must come back pristine.
///
#[derive(Default)]
pub struct RequestScope {
    pub ambient: Ambient,
    pub events: EventRegistry,
    pub components: ComponentCache,
    pub route: RouteState,
    pub widgets: WidgetStack,
}

impl RequestScope {
    pub fn new() -> RequestScope {
        RequestScope::default()
    }

    pub fn is_pristine(&self) -> bool {
        self.ambient.is_empty()
            && self.events.listener_count() == 0
            && self.components.is_empty()
            && self.route.is_empty()
            && self.widgets == WidgetStack::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn it_should_call_listeners_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut events = EventRegistry::default();

        let first = calls.clone();
        events.on("saved", move |_| {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = calls.clone();
        events.on("saved", move |e| {
            assert_eq!(e.data["id"], 7);
            second.fetch_add(10, Ordering::SeqCst);
        });

        assert_eq!(events.trigger("saved", serde_json::json!({ "id": 7 })), 2);
        assert_eq!(events.trigger("missing", serde_json::Value::Null), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn it_should_key_components_by_type() {
        struct Counter(u32);
        let mut cache = ComponentCache::default();

        cache.insert(Counter(1));
        cache.insert(String::from("user"));
        if let Some(counter) = cache.get_mut::<Counter>() {
            counter.0 += 1;
        }

        assert_eq!(cache.get::<Counter>().map(|c| c.0), Some(2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.clear(), 2);
        assert!(!cache.contains::<String>());
    }

    #[test]
    fn it_should_number_widgets() {
        let mut widgets = WidgetStack::default();

        assert_eq!(widgets.begin("form"), "w0");
        assert_eq!(widgets.begin("field"), "w1");
        assert_eq!(widgets.end(), Some("field".to_owned()));
        assert_eq!(widgets.depth(), 1);
        assert!(widgets.clear());
        assert_eq!(widgets.counter(), 0);
    }
}
