use crate::types::BizEvent;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub type EventCallback = Arc<dyn Fn(BizEvent) + Send + Sync>;

/// Fan-out point for service events. Both the LAN and cloud services emit
/// through one dispatcher so the application sees a single stream.
///
/// The callback is copied out of the lock before invocation; no internal
/// lock is ever held while application code runs.
#[derive(Default)]
pub struct EventDispatcher {
    callback: Mutex<Option<EventCallback>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: Option<EventCallback>) {
        *self.callback.lock().unwrap() = callback;
    }

    pub fn emit(&self, event: BizEvent) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        } else {
            debug!(method = ?event.method, "event dropped, no callback registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_invokes_registered_callback() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        dispatcher.set_callback(Some(Arc::new(move |event| {
            assert_eq!(event.method, Method::OnPrinterListChanged);
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        dispatcher.emit(BizEvent::new(
            Method::OnPrinterListChanged,
            serde_json::json!({}),
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        dispatcher.set_callback(None);
        dispatcher.emit(BizEvent::new(Method::OnPrinterListChanged, serde_json::json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
