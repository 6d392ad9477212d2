//! watchdog-service: scanning, verification, monitoring and alert delivery
//! on top of `watchdog-core`.

pub mod alerting;
pub mod integrity;
pub mod service;

pub use integrity::monitor::{MonitorConfig, MonitorHandle, MonitorState};
pub use service::{FileVerdict, IntegrityService, ScanSummary, VerifySummary};
