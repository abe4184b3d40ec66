//! LAN and cloud connectivity SDK for Elegoo and Moonraker 3D printers.
//!
//! Two service facades cover the two access paths: [`LanService`] for
//! printers discovered and driven on the local network (UDP discovery,
//! MQTT/WebSocket sessions, HTTP file transfer) and [`CloudService`] for
//! remote printers behind the vendor cloud (REST, MQTT telemetry, RTM
//! request/response). Both deliver events through one callback surface and
//! report failures with the stable [`ErrorCode`] taxonomy.

pub mod adapter;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod lan;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod types;

pub use cloud::CloudService;
pub use config::{CloudConfig, DiscoveryParams, LanConfig};
pub use errors::{ErrorCode, Result, SdkError};
pub use events::EventCallback;
pub use lan::LanService;
pub use types::{
    AuthMode, BizEvent, ConnectParams, ConnectionState, Method, PrinterInfo, PrinterType,
};
