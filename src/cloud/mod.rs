pub mod api;
pub mod credentials;
pub mod http;
pub mod mqtt;
pub mod rtm;
pub mod service;

use crate::adapter::Adapter;
use crate::types::PrinterInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use service::CloudService;

/// Upload bookkeeping for one printer; telemetry reads it to synthesize a
/// uniform "uploading" machine status.
#[derive(Debug, Clone, Default)]
pub struct UploadState {
    pub uploading: bool,
    pub progress: u8,
}

/// Registries shared between the cloud sub-services. The service facade
/// owns them; the MQTT subscriber and the RTM channel hold clones.
#[derive(Default)]
pub struct CloudRegistry {
    printers: Mutex<Vec<PrinterInfo>>,
    adapters: Mutex<HashMap<String, Arc<dyn Adapter>>>,
    upload_states: Mutex<HashMap<String, UploadState>>,
}

impl CloudRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_printers(&self, printers: Vec<PrinterInfo>, adapters: HashMap<String, Arc<dyn Adapter>>) {
        *self.printers.lock().unwrap() = printers;
        *self.adapters.lock().unwrap() = adapters;
    }

    pub fn printers(&self) -> Vec<PrinterInfo> {
        self.printers.lock().unwrap().clone()
    }

    pub fn printer_by_id(&self, printer_id: &str) -> Option<PrinterInfo> {
        self.printers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.printer_id == printer_id)
            .cloned()
    }

    pub fn printer_by_serial(&self, serial: &str) -> Option<PrinterInfo> {
        self.printers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.serial_number == serial)
            .cloned()
    }

    pub fn adapter(&self, printer_id: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.lock().unwrap().get(printer_id).cloned()
    }

    pub fn set_upload_state(&self, printer_id: &str, state: UploadState) {
        self.upload_states
            .lock()
            .unwrap()
            .insert(printer_id.to_string(), state);
    }

    pub fn clear_upload_state(&self, printer_id: &str) {
        self.upload_states.lock().unwrap().remove(printer_id);
    }

    pub fn upload_state(&self, printer_id: &str) -> Option<UploadState> {
        self.upload_states.lock().unwrap().get(printer_id).cloned()
    }
}
