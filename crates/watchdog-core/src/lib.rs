//! watchdog-core: file integrity baseline engine
//!
//! # Model
//! A baseline maps each monitored path to a [`models::FileRecord`]: content
//! digests under several algorithms, a metadata snapshot, and an optional
//! Ed25519 signature over the record's identity. Verification re-hashes the
//! file and classifies it as UNCHANGED, MODIFIED or DELETED, raising alerts.
//!
//! # Persistence
//! The whole [`models::BaselineDocument`] (records, alerts, scan history,
//! statistics) is stored as one JSON file replaced by atomic rename.

pub mod alert;
pub mod detector;
pub mod error;
pub mod hashing;
pub mod models;
pub mod paths;
pub mod settings;
pub mod signing;
pub mod store;

pub use alert::Deliver;
pub use detector::{classify, Classification, Observation};
pub use error::{Result, WatchdogError};
pub use settings::WatchdogSettings;
pub use signing::KeyStore;
pub use store::BaselineStore;
