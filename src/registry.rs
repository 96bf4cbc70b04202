//! Handler registry: per-event callbacks invoked in registration order.
//!
//! Handlers are registered per event name and invoked in registration order.
//! Dispatch takes a read-lock snapshot of the handler list before invoking
//! anything, then marks a `Once` handler `ConsumedOnce` under the write lock
//! immediately before invoking it, re-checking its kind first — so two
//! concurrent dispatches of the same event can race for a `Once` handler but
//! only one of them wins, and a handler already consumed is never run twice.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::error;

pub type HandlerFn = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Kind {
    Normal,
    Once,
    ConsumedOnce,
}

struct Entry {
    kind: Kind,
    handler: HandlerFn,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Entry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, name: impl Into<String>, f: impl Fn(Value) + Send + Sync + 'static) {
        self.register(name.into(), Kind::Normal, Arc::new(f));
    }

    pub fn once(&self, name: impl Into<String>, f: impl Fn(Value) + Send + Sync + 'static) {
        self.register(name.into(), Kind::Once, Arc::new(f));
    }

    fn register(&self, name: String, kind: Kind, handler: HandlerFn) {
        self.handlers
            .write()
            .unwrap()
            .entry(name)
            .or_default()
            .push(Entry { kind, handler });
    }

    /// Invoke every non-consumed handler registered for `name`, in
    /// registration order, marking `Once` handlers consumed exactly once.
    pub fn dispatch(&self, name: &str, data: Value) {
        let snapshot: Vec<(usize, HandlerFn, bool)> = {
            let guard = self.handlers.read().unwrap();
            match guard.get(name) {
                Some(entries) => entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.kind != Kind::ConsumedOnce)
                    .map(|(i, e)| (i, e.handler.clone(), e.kind == Kind::Once))
                    .collect(),
                None => return,
            }
        };

        for (idx, handler, is_once) in snapshot {
            if is_once && !self.try_consume(name, idx) {
                // Lost the race to another concurrent dispatch of the same event.
                continue;
            }
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(data.clone())));
            if result.is_err() {
                error!(event = name, "handler panicked, dispatch continues");
            }
        }
    }

    /// Bounded compare-and-swap: only the first caller to observe `Once`
    /// (not yet `ConsumedOnce`) at this index wins and gets `true`.
    fn try_consume(&self, name: &str, idx: usize) -> bool {
        let mut guard = self.handlers.write().unwrap();
        let Some(entries) = guard.get_mut(name) else {
            return false;
        };
        let Some(entry) = entries.get_mut(idx) else {
            return false;
        };
        if entry.kind != Kind::Once {
            return false;
        }
        entry.kind = Kind::ConsumedOnce;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn once_handler_invoked_at_most_once() {
        let registry = HandlerRegistry::new();
        let count = StdArc::new(AtomicU32::new(0));
        let c = count.clone();
        registry.once("GUILD_CREATE", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        registry.dispatch("GUILD_CREATE", serde_json::json!({"id": "123"}));
        registry.dispatch("GUILD_CREATE", serde_json::json!({"id": "456"}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn normal_handlers_run_every_time_in_order() {
        let registry = HandlerRegistry::new();
        let order = StdArc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        registry.on("X", move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        registry.on("X", move |_| o2.lock().unwrap().push(2));
        registry.dispatch("X", Value::Null);
        registry.dispatch("X", Value::Null);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_block_remaining_handlers() {
        let registry = HandlerRegistry::new();
        registry.on("X", |_| panic!("boom"));
        let ran = StdArc::new(AtomicU32::new(0));
        let r = ran.clone();
        registry.on("X", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        registry.dispatch("X", Value::Null);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_event_name_is_a_no_op() {
        let registry = HandlerRegistry::new();
        registry.dispatch("NEVER_REGISTERED", Value::Null);
    }
}
