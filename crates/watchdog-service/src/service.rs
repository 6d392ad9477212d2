//! The integrity service: owns the live baseline document and serializes
//! every read-modify-write against it.
//!
//! Scans and verify passes compute their results off the lock-free path
//! (walking and hashing on the rayon pool), then apply them to a clone of
//! the document under the lock. The clone is saved and only then swapped in.
//! Alerts are delivered after the lock is released.

use crate::integrity::scanner::{IntegrityScanner, ScanError};
use crate::integrity::verifier::{self, CheckOutcome, FileCheck};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use watchdog_core::alert::Deliver;
use watchdog_core::models::{
    Alert, AlertType, BaselineDocument, FileStatus, ScanHistoryEntry, Statistics, StatusCounts,
};
use watchdog_core::settings::WatchdogSettings;
use watchdog_core::signing::KeyStore;
use watchdog_core::store::{self, BaselineStore};
use watchdog_core::{Result, WatchdogError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub files_scanned: u64,
    pub directories_scanned: u64,
    pub skipped_directories: Vec<PathBuf>,
    pub errors: Vec<ScanError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    pub unchanged_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub error_count: u64,
    /// Alerts newly queued by this pass
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVerdict {
    pub path: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
}

struct State {
    store: BaselineStore,
    doc: BaselineDocument,
}

pub struct IntegrityService {
    settings: WatchdogSettings,
    state: Mutex<State>,
    keys: Option<Arc<KeyStore>>,
    sink: Arc<dyn Deliver>,
    scanner: IntegrityScanner,
}

/// Baseline key for `path`. A deleted file cannot be canonicalized, so its
/// parent directory is resolved instead and the file name joined back on.
fn tracked_key(path: &Path) -> String {
    if let Ok(p) = path.canonicalize() {
        return p.display().to_string();
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name).display().to_string(),
        _ => path.display().to_string(),
    }
}

fn join_error(e: tokio::task::JoinError) -> WatchdogError {
    WatchdogError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("blocking task failed: {e}"),
    ))
}

impl IntegrityService {
    /// Build a service over an explicit store and key material.
    pub fn new(
        settings: WatchdogSettings,
        store: BaselineStore,
        keys: Option<KeyStore>,
        sink: Arc<dyn Deliver>,
    ) -> Result<Self> {
        let mut settings = settings;
        settings.normalize();
        settings.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.performance.workers)
            .thread_name(|i| format!("watchdog-hash-{i}"))
            .build()
            .map_err(|e| WatchdogError::Config(format!("hashing pool: {e}")))?;
        let scanner = IntegrityScanner::new(
            settings.hash_algorithm,
            settings.algorithms.clone(),
            Arc::new(pool),
        );

        let doc = store.load();
        info!(
            path = %store.path().display(),
            files = doc.files.len(),
            signed = keys.is_some(),
            "integrity service ready"
        );

        Ok(Self {
            settings,
            state: Mutex::new(State { store, doc }),
            keys: keys.map(Arc::new),
            sink,
            scanner,
        })
    }

    /// Resolve storage paths from `settings`, load keys when signing is
    /// enabled, and build the service. A key failure is logged and the
    /// service runs unsigned.
    pub fn open(settings: WatchdogSettings, sink: Arc<dyn Deliver>) -> Result<Self> {
        let store = BaselineStore::new(settings.baseline_path()?);
        let keys = if settings.signatures.enabled {
            let dir = settings.keys_dir()?;
            match KeyStore::load_or_create(&dir) {
                Ok(k) => Some(k),
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "failed to load signing keys; running unsigned");
                    None
                }
            }
        } else {
            None
        };
        Self::new(settings, store, keys, sink)
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    pub fn key_store(&self) -> Option<&KeyStore> {
        self.keys.as_deref()
    }

    fn signer(&self) -> (Option<SigningKey>, Option<String>) {
        if !self.settings.signatures.enabled {
            return (None, None);
        }
        match &self.keys {
            None => (None, Some("signing keys unavailable".to_string())),
            Some(ks) => match ks.signing_key() {
                Ok(k) => (Some(k.clone()), None),
                Err(e) => (None, Some(e.to_string())),
            },
        }
    }

    fn verifier(&self) -> Option<VerifyingKey> {
        if !self.settings.signatures.enabled {
            return None;
        }
        self.keys.as_ref().map(|k| *k.verifying_key())
    }

    fn commit(&self, state: &mut State, mut doc: BaselineDocument) -> Result<()> {
        doc.statistics.total_files_monitored = doc.files.len() as u64;
        doc.enforce_retention(
            self.settings.retention.max_alerts,
            self.settings.retention.max_scan_history,
        );
        state.store.save(&doc)?;
        state.doc = doc;
        Ok(())
    }

    async fn dispatch(&self, alerts: &[Alert]) {
        for alert in alerts {
            if !self.sink.deliver_alert(alert).await {
                warn!(path = %alert.file_path, alert = alert.alert_type.as_str(), "alert not delivered");
            }
        }
    }

    /// Scan `directories` and replace the baseline with fresh NEW records.
    /// Alerts and scan history are kept.
    pub async fn create_baseline(
        &self,
        directories: Vec<PathBuf>,
        extensions: Vec<String>,
    ) -> Result<ScanSummary> {
        if let Some(bad) = extensions.iter().find(|e| !e.starts_with('.') || e.len() < 2) {
            return Err(WatchdogError::Config(format!(
                "file type filter {bad:?} must start with '.'"
            )));
        }

        let mut state = self.state.lock().await;
        let (signer, signer_error) = self.signer();
        let scanner = self.scanner.clone();
        let (dirs, exts) = (directories.clone(), extensions.clone());
        let outcome =
            tokio::task::spawn_blocking(move || scanner.scan(&dirs, &exts, signer.as_ref()))
                .await
                .map_err(join_error)?;

        let signature_error = signer_error.or(outcome.signature_error);
        if let Some(reason) = &signature_error {
            warn!(reason = %reason, "baseline records stored without signatures");
        }

        let files_scanned = outcome.records.len() as u64;
        let now = Utc::now();
        let mut doc = state.doc.clone();
        doc.files = outcome.records;
        doc.scan_history.push(ScanHistoryEntry {
            timestamp: now,
            directories,
            extensions,
            files_scanned,
            errors: outcome.errors.len() as u64,
            duration_ms: outcome.duration_ms,
        });
        doc.statistics.total_scans += 1;
        doc.statistics.last_scan = Some(now);
        self.commit(&mut state, doc)?;

        info!(files = files_scanned, "baseline committed");
        Ok(ScanSummary {
            files_scanned,
            directories_scanned: outcome.directories_scanned,
            skipped_directories: outcome.skipped_directories,
            errors: outcome.errors,
            signature_error,
            duration_ms: outcome.duration_ms,
        })
    }

    /// Re-scan the configured roots with the configured filters.
    pub async fn create_baseline_from_settings(&self) -> Result<ScanSummary> {
        self.create_baseline(
            self.settings.monitored_dirs.clone(),
            self.settings.file_types.clone(),
        )
        .await
    }

    /// Whether `alert` reports a condition not already alerted for the record.
    ///
    /// A status transition always alerts. A file that stays MODIFIED alerts
    /// again only when its content differs from the last reported digest, and
    /// a signature failure is reported once per record.
    fn is_new_condition(
        doc: &BaselineDocument,
        previous: FileStatus,
        since: DateTime<Utc>,
        alert: &Alert,
    ) -> bool {
        match alert.alert_type {
            AlertType::FileModified if previous == FileStatus::Modified => doc
                .last_alert_since(&alert.file_path, AlertType::FileModified, since)
                .and_then(|last| last.details.current_digest())
                != alert.details.current_digest(),
            AlertType::FileModified => true,
            AlertType::FileDeleted => previous != FileStatus::Deleted,
            AlertType::SignatureInvalid => {
                !doc.has_alert_since(&alert.file_path, alert.alert_type, since)
            }
        }
    }

    /// Merge classification results into `doc`, returning the summary and
    /// the alerts that were not already raised for the same record.
    fn apply_checks(doc: &mut BaselineDocument, checks: Vec<FileCheck>) -> VerifySummary {
        let mut summary = VerifySummary::default();
        for check in checks {
            let classification = match check.outcome {
                CheckOutcome::StillDeleted => {
                    summary.deleted_count += 1;
                    continue;
                }
                CheckOutcome::Failed(reason) => {
                    warn!(path = %check.path, error = %reason, "could not verify file");
                    summary.error_count += 1;
                    continue;
                }
                CheckOutcome::Classified(c) => c,
            };
            match classification.status {
                FileStatus::Deleted => summary.deleted_count += 1,
                FileStatus::Modified => summary.modified_count += 1,
                _ => summary.unchanged_count += 1,
            }

            let Some(record) = doc.files.get_mut(&check.path) else {
                continue;
            };
            let previous = record.status;
            record.status = classification.status;
            let since = record.timestamp;

            if let Some(alert) = classification.alert {
                if !Self::is_new_condition(doc, previous, since, &alert) {
                    continue;
                }
                warn!(
                    path = %alert.file_path,
                    alert = alert.alert_type.as_str(),
                    severity = alert.severity.as_str(),
                    "integrity alert raised"
                );
                doc.alerts.push(alert.clone());
                summary.alerts.push(alert);
            }
        }
        doc.statistics.total_alerts_generated += summary.alerts.len() as u64;
        summary
    }

    /// Verify every tracked record and commit the results in one save.
    pub async fn verify_all(&self) -> Result<VerifySummary> {
        let summary = {
            let mut state = self.state.lock().await;
            let records: Vec<_> = state.doc.files.values().cloned().collect();
            let pool = self.scanner.pool().clone();
            let key = self.verifier();
            let checks = tokio::task::spawn_blocking(move || {
                verifier::check_all(&pool, &records, key.as_ref())
            })
            .await
            .map_err(join_error)?;

            let mut doc = state.doc.clone();
            let summary = Self::apply_checks(&mut doc, checks);
            doc.statistics.total_scans += 1;
            doc.statistics.last_verification = Some(Utc::now());
            self.commit(&mut state, doc)?;
            summary
        };

        info!(
            unchanged = summary.unchanged_count,
            modified = summary.modified_count,
            deleted = summary.deleted_count,
            errors = summary.error_count,
            alerts = summary.alerts.len(),
            "verification pass complete"
        );
        self.dispatch(&summary.alerts).await;
        Ok(summary)
    }

    /// Verify a single tracked path and commit its new status.
    pub async fn verify_one(&self, path: &Path) -> Result<FileVerdict> {
        let key = tracked_key(path);

        let (verdict, alerts) = {
            let mut state = self.state.lock().await;
            let record = state
                .doc
                .files
                .get(&key)
                .cloned()
                .ok_or_else(|| WatchdogError::NotTracked(key.clone()))?;
            let verifying = self.verifier();
            let check = tokio::task::spawn_blocking(move || {
                verifier::check_one(&record, verifying.as_ref())
            })
            .await
            .map_err(join_error)??;

            let classified_alert = match &check.outcome {
                CheckOutcome::Classified(c) => c.alert.clone(),
                _ => None,
            };
            let mut doc = state.doc.clone();
            let summary = Self::apply_checks(&mut doc, vec![check]);
            doc.statistics.last_verification = Some(Utc::now());
            let status = doc
                .files
                .get(&key)
                .map(|r| r.status)
                .unwrap_or(FileStatus::Deleted);
            self.commit(&mut state, doc)?;

            (
                FileVerdict {
                    path: key,
                    status,
                    alert: classified_alert,
                },
                summary.alerts,
            )
        };

        self.dispatch(&alerts).await;
        Ok(verdict)
    }

    /// The full document as pretty JSON, in the persisted layout.
    pub async fn export_snapshot(&self) -> Result<String> {
        let state = self.state.lock().await;
        Ok(serde_json::to_string_pretty(&state.doc)?)
    }

    /// Write the snapshot to `path` atomically.
    pub async fn export_to(&self, path: &Path) -> Result<()> {
        let json = self.export_snapshot().await?;
        store::write_atomic(path, json.as_bytes())?;
        info!(path = %path.display(), "baseline exported");
        Ok(())
    }

    pub async fn snapshot(&self) -> BaselineDocument {
        self.state.lock().await.doc.clone()
    }

    pub async fn statistics(&self) -> Statistics {
        self.state.lock().await.doc.statistics.clone()
    }

    pub async fn status_counts(&self) -> StatusCounts {
        self.state.lock().await.doc.status_counts()
    }
}
