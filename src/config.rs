//! Configuration surface the host application implements against; the
//! core itself never reads config, so this module exists only to give
//! the plugin layer a concrete contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A named key-value source with change notification, in the same
/// trait-with-a-no-op-default shape as `ShouldSample`/`IdGenerator`: a
/// small trait the host supplies an implementation of.
pub trait ConfigSource: Send + Sync {
    /// A string property, or `""` if unset.
    fn get_string(&self, name: &str) -> String;
    /// A boolean property, or `false` if unset.
    fn get_bool(&self, name: &str) -> bool;
    /// A floating-point property, or `None` if unset.
    fn get_double(&self, name: &str) -> Option<f64>;
    /// Register a callback invoked after any property changes. Order and
    /// delivery mechanism are host-defined; a source that can't change at
    /// runtime may drop the listener.
    fn register_listener(&self, listener: Box<dyn Fn() + Send + Sync>);
}

/// The default `ConfigSource`: every property reads as unset, listeners are
/// dropped. Suitable for a host that has no configuration store.
#[derive(Debug, Default)]
pub struct NoopConfigSource;

impl ConfigSource for NoopConfigSource {
    fn get_string(&self, _name: &str) -> String {
        String::new()
    }

    fn get_bool(&self, _name: &str) -> bool {
        false
    }

    fn get_double(&self, _name: &str) -> Option<f64> {
        None
    }

    fn register_listener(&self, _listener: Box<dyn Fn() + Send + Sync>) {}
}

#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
struct InMemoryState {
    strings: HashMap<String, String>,
    bools: HashMap<String, bool>,
    doubles: HashMap<String, f64>,
    listeners: Vec<Box<dyn Fn() + Send + Sync>>,
}

/// An in-memory `ConfigSource` for exercising the plugin-facing contract in
/// tests: values can be mutated after construction and listeners fire on
/// every mutation.
#[cfg(any(test, feature = "testing"))]
#[derive(Default)]
pub struct InMemoryConfigSource {
    state: Mutex<InMemoryState>,
}

#[cfg(any(test, feature = "testing"))]
impl InMemoryConfigSource {
    pub fn new() -> Self {
        InMemoryConfigSource {
            state: Mutex::new(InMemoryState::default()),
        }
    }

    pub fn set_string(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.lock().unwrap().strings.insert(name.into(), value.into());
        self.notify();
    }

    pub fn set_bool(&self, name: impl Into<String>, value: bool) {
        self.state.lock().unwrap().bools.insert(name.into(), value);
        self.notify();
    }

    pub fn set_double(&self, name: impl Into<String>, value: f64) {
        self.state.lock().unwrap().doubles.insert(name.into(), value);
        self.notify();
    }

    fn notify(&self) {
        for listener in self.state.lock().unwrap().listeners.iter() {
            listener();
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl ConfigSource for InMemoryConfigSource {
    fn get_string(&self, name: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .strings
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn get_bool(&self, name: &str) -> bool {
        self.state.lock().unwrap().bools.get(name).copied().unwrap_or(false)
    }

    fn get_double(&self, name: &str) -> Option<f64> {
        self.state.lock().unwrap().doubles.get(name).copied()
    }

    fn register_listener(&self, listener: Box<dyn Fn() + Send + Sync>) {
        self.state.lock().unwrap().listeners.push(listener);
    }
}

/// A shared, trait-object handle to any `ConfigSource`, the shape an
/// `AgentFacade` actually holds.
pub type SharedConfigSource = Arc<dyn ConfigSource>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn noop_source_returns_documented_defaults() {
        let source = NoopConfigSource;
        assert_eq!(source.get_string("anything"), "");
        assert!(!source.get_bool("anything"));
        assert_eq!(source.get_double("anything"), None);
    }

    #[test]
    fn in_memory_source_round_trips_values() {
        let source = InMemoryConfigSource::new();
        source.set_string("name", "traceagent");
        source.set_bool("enabled", true);
        source.set_double("threshold", 0.5);
        assert_eq!(source.get_string("name"), "traceagent");
        assert!(source.get_bool("enabled"));
        assert_eq!(source.get_double("threshold"), Some(0.5));
        assert_eq!(source.get_string("missing"), "");
    }

    #[test]
    fn listener_fires_on_every_mutation() {
        let source = InMemoryConfigSource::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        source.register_listener(Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        source.set_bool("a", true);
        source.set_bool("b", false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
