//! Deferred span payloads.
//!
//! Formatting a span's description and building its context map costs
//! allocations the hot path should not pay unless a reader actually asks
//! for them. A [`MessageSupplier`] defers that work until snapshot time.

use std::fmt;

/// A span or event payload: display text plus an ordered context map.
#[derive(Debug, Clone, Default)]
pub struct Message {
    text: String,
    context: Vec<(String, String)>,
}

impl Message {
    /// Build a message with no context map.
    pub fn new(text: impl Into<String>) -> Self {
        Message {
            text: text.into(),
            context: Vec::new(),
        }
    }

    /// Build a message with a context map.
    pub fn with_context(text: impl Into<String>, context: Vec<(String, String)>) -> Self {
        Message {
            text: text.into(),
            context,
        }
    }

    /// The display text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The context map, in insertion order.
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A deferred producer of a [`Message`], evaluated only when a reader
/// (typically the snapshot serializer) needs the payload.
pub trait MessageSupplier: Send + Sync {
    /// Produce the message. May be called more than once; implementations
    /// should be cheap to call repeatedly or memoize internally.
    fn get(&self) -> Message;
}

impl MessageSupplier for Message {
    fn get(&self) -> Message {
        self.clone()
    }
}

impl<F> MessageSupplier for F
where
    F: Fn() -> Message + Send + Sync,
{
    fn get(&self) -> Message {
        self()
    }
}

/// A boxed, shareable [`MessageSupplier`]; this is the type `Span` and
/// `Trace` actually store, since a supplier is produced once by a plugin
/// and then read by any number of snapshotting threads.
pub type SharedMessageSupplier = std::sync::Arc<dyn MessageSupplier>;

/// Wrap a plain string as a [`SharedMessageSupplier`] with no context map.
pub fn text(s: impl Into<String>) -> SharedMessageSupplier {
    std::sync::Arc::new(Message::new(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_supplier_is_lazy_and_repeatable() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let supplier = move || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Message::new("built lazily")
        };
        // constructing the closure above must not have invoked it
        let m1 = supplier.get();
        let m2 = supplier.get();
        assert_eq!(m1.text(), "built lazily");
        assert_eq!(m2.text(), "built lazily");
    }

    #[test]
    fn context_map_preserves_insertion_order() {
        let m = Message::with_context(
            "root",
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
        );
        assert_eq!(m.context()[0].0, "b");
        assert_eq!(m.context()[1].0, "a");
    }
}
