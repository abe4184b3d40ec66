pub mod elegoo_cc;
pub mod elegoo_cc2;
pub mod moonraker;

use crate::errors::ErrorCode;
use crate::types::{Method, PrinterInfo, PrinterType};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Cadence of the background sweep that frees expired request records.
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A wire payload produced by `convert_request`, ready to send.
#[derive(Debug, Clone)]
pub struct PrinterRequest {
    pub request_id: String,
    pub method: Method,
    pub payload: String,
    pub code: ErrorCode,
    pub message: String,
}

impl PrinterRequest {
    pub fn ok(request_id: String, method: Method, payload: String) -> Self {
        Self {
            request_id,
            method,
            payload,
            code: ErrorCode::Success,
            message: "ok".to_string(),
        }
    }

    pub fn error(method: Method, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            method,
            payload: String::new(),
            code,
            message: message.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.code == ErrorCode::Success
    }
}

/// A normalized response extracted from a wire payload. An empty
/// `request_id` marks the payload as noise for the caller.
#[derive(Debug, Clone)]
pub struct PrinterResponse {
    pub request_id: String,
    pub method: Method,
    pub code: ErrorCode,
    pub message: String,
    pub data: Option<Value>,
}

impl PrinterResponse {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            request_id: String::new(),
            method: Method::Unknown,
            code: ErrorCode::Success,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.request_id.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PrinterEvent {
    pub method: Method,
    pub data: Option<Value>,
}

impl PrinterEvent {
    pub fn none() -> Self {
        Self {
            method: Method::Unknown,
            data: None,
        }
    }

    pub fn new(method: Method, data: Value) -> Self {
        Self {
            method,
            data: Some(data),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.method != Method::Unknown && self.data.is_some()
    }
}

/// Delivery order of the pieces carried by one wire message. A single
/// message may be both an ack and a state delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Response,
    Event,
}

pub type SendCallback = Arc<dyn Fn(PrinterRequest) + Send + Sync>;

/// Translates between the canonical method/event vocabulary and one printer
/// family's wire format. Adapters are stateful: they track the request ids
/// they handed out (for response correlation) and the merged status view.
pub trait Adapter: Send + Sync {
    /// Produce the wire payload for a canonical method, assign a request id
    /// and record it for later correlation. A failure is reported in-band
    /// through `code`/`message`.
    fn convert_request(&self, method: Method, params: &Value, timeout: Duration) -> PrinterRequest;

    /// Extract a response. The request id must match an entry previously
    /// recorded by `convert_request`; otherwise the result is invalid and
    /// the caller treats the payload as noise.
    fn convert_to_response(&self, wire: &str) -> PrinterResponse;

    /// Extract an event; `Method::Unknown` signals "not an event".
    fn convert_to_event(&self, wire: &str) -> PrinterEvent;

    /// Enumerate what one wire message carries, in delivery order.
    fn parse_message_kinds(&self, wire: &str) -> Vec<MessageKind>;

    fn supported_printer_types(&self) -> Vec<PrinterType>;
    fn adapter_info(&self) -> &'static str;
    fn printer_info(&self) -> PrinterInfo;

    /// The merged full-state view (empty object when nothing cached).
    fn cached_full_status(&self) -> Value;
    fn clear_status_cache(&self);

    fn set_send_callback(&self, callback: SendCallback);

    /// Emit an unsolicited request (e.g. a status refresh) through the send
    /// callback.
    fn send_to_printer(&self, method: Method, params: Value);

    /// Drop request records whose timeout has elapsed. Only frees memory;
    /// waking the caller on expiry is the session's job.
    fn expire_stale_requests(&self);
}

// ---------------------------------------------------------------------------
// Request tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub standard_message_id: String,
    pub request_id: String,
    pub method: Method,
    pub issued_at: Instant,
    pub timeout: Duration,
}

/// Request-id bookkeeping shared by all adapter implementations.
#[derive(Default)]
pub struct PendingTracker {
    records: Mutex<HashMap<String, RequestRecord>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, standard_message_id: String, request_id: String, method: Method, timeout: Duration) {
        let mut records = self.records.lock().unwrap();
        records.insert(
            request_id.clone(),
            RequestRecord {
                standard_message_id,
                request_id,
                method,
                issued_at: Instant::now(),
                timeout,
            },
        );
    }

    pub fn find(&self, request_id: &str) -> Option<RequestRecord> {
        self.records.lock().unwrap().get(request_id).cloned()
    }

    pub fn remove(&self, request_id: &str) -> Option<RequestRecord> {
        self.records.lock().unwrap().remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expire_stale(&self) {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, record| record.issued_at.elapsed() <= record.timeout);
        let expired = before - records.len();
        if expired > 0 {
            debug!("cleaned up {} expired request records", expired);
        }
    }
}

/// Correlation id used on the SDK side of the pending map.
pub fn generate_message_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("msg_{}_{}", millis, suffix)
}

/// 5-digit numeric wire id, the widest format every family accepts.
pub fn generate_request_id() -> String {
    rand::thread_rng().gen_range(10000u32..=99999).to_string()
}

pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Status cache + delta merge
// ---------------------------------------------------------------------------

/// Consecutive non-contiguous sequence ids tolerated before a full-status
/// resync is requested.
const RESYNC_THRESHOLD: u32 = 5;

struct StatusCacheInner {
    cached: Value,
    has_full: bool,
    last_seq: Option<i64>,
    non_contiguous: u32,
}

/// The merged full-state view for one printer. Deltas merge field-wise: a
/// field present in the delta replaces the previous value whether it is an
/// object or a scalar. A full snapshot replaces the cache entirely.
pub struct StatusCache {
    inner: Mutex<StatusCacheInner>,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatusCacheInner {
                cached: Value::Object(Default::default()),
                has_full: false,
                last_seq: None,
                non_contiguous: 0,
            }),
        }
    }

    /// Store a full snapshot, replacing whatever was merged before. Returns
    /// the new view.
    pub fn apply_full(&self, status: &Value) -> Value {
        let mut inner = self.inner.lock().unwrap();
        inner.cached = status.clone();
        inner.has_full = true;
        inner.cached.clone()
    }

    /// Merge a delta into the cached view and return the merged object.
    pub fn apply_delta(&self, delta: &Value) -> Value {
        let mut inner = self.inner.lock().unwrap();
        if let (Value::Object(cached), Value::Object(delta)) = (&mut inner.cached, delta) {
            for (key, value) in delta {
                cached.insert(key.clone(), value.clone());
            }
        }
        inner.cached.clone()
    }

    pub fn has_full(&self) -> bool {
        self.inner.lock().unwrap().has_full
    }

    pub fn snapshot(&self) -> Value {
        self.inner.lock().unwrap().cached.clone()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cached = Value::Object(Default::default());
        inner.has_full = false;
        inner.last_seq = None;
        inner.non_contiguous = 0;
    }

    /// Track a status sequence id; returns true when enough consecutive
    /// gaps were seen that the caller should request a full refresh.
    pub fn track_sequence(&self, seq: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let contiguous = match inner.last_seq {
            Some(last) => seq == last + 1,
            None => true,
        };
        inner.last_seq = Some(seq);
        if contiguous {
            inner.non_contiguous = 0;
            return false;
        }
        inner.non_contiguous += 1;
        if inner.non_contiguous >= RESYNC_THRESHOLD {
            inner.non_contiguous = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_merge_replaces_fields_and_full_replaces_everything() {
        let cache = StatusCache::new();
        cache.apply_full(&json!({"machine_status": {"status": 1}, "temps": {"nozzle": 210}}));
        let merged = cache.apply_delta(&json!({"temps": {"nozzle": 215}}));
        assert_eq!(merged["temps"]["nozzle"], 215);
        assert_eq!(merged["machine_status"]["status"], 1);

        let replaced = cache.apply_full(&json!({"machine_status": {"status": 2}}));
        assert!(replaced.get("temps").is_none());
    }

    #[test]
    fn clear_returns_empty_object() {
        let cache = StatusCache::new();
        cache.apply_full(&json!({"a": 1}));
        cache.clear();
        assert_eq!(cache.snapshot(), json!({}));
        assert!(!cache.has_full());
    }

    #[test]
    fn five_consecutive_gaps_trigger_resync() {
        let cache = StatusCache::new();
        assert!(!cache.track_sequence(1));
        assert!(!cache.track_sequence(2));
        // Gaps: 4, 7, 9, 12, 15 -> the fifth consecutive gap trips it.
        assert!(!cache.track_sequence(4));
        assert!(!cache.track_sequence(7));
        assert!(!cache.track_sequence(9));
        assert!(!cache.track_sequence(12));
        assert!(cache.track_sequence(15));
        // Counter resets afterwards.
        assert!(!cache.track_sequence(20));
    }

    #[test]
    fn contiguous_sequence_resets_the_gap_counter() {
        let cache = StatusCache::new();
        assert!(!cache.track_sequence(1));
        assert!(!cache.track_sequence(5));
        assert!(!cache.track_sequence(6)); // contiguous again
        assert!(!cache.track_sequence(8));
        assert!(!cache.track_sequence(10));
        assert!(!cache.track_sequence(12));
        assert!(!cache.track_sequence(14));
        assert!(cache.track_sequence(16)); // fifth gap since the reset
    }

    #[test]
    fn tracker_expires_only_elapsed_records() {
        let tracker = PendingTracker::new();
        tracker.record(
            "msg_a".into(),
            "10001".into(),
            Method::GetPrinterStatus,
            Duration::from_secs(60),
        );
        tracker.record(
            "msg_b".into(),
            "10002".into(),
            Method::StartPrint,
            Duration::from_millis(0),
        );
        tracker.expire_stale();
        assert!(tracker.find("10001").is_some());
        assert!(tracker.find("10002").is_none());
    }

    #[test]
    fn request_ids_are_five_digit_numeric() {
        for _ in 0..100 {
            let id = generate_request_id();
            assert_eq!(id.len(), 5);
            assert!(id.parse::<u32>().unwrap() >= 10000);
        }
    }
}
