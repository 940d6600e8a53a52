//! Record store, image pipeline, and sync-log collaborator interfaces for
//! LotSync, plus the retry and per-vendor serialization machinery shared by
//! their implementations.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotsync_core::{SyncResult, SyncStatus, VehicleRecord, VendorStatus};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotsync-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only availability failures are worth retrying; constraint and not-found
/// errors will fail identically on every attempt.
pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Unavailable(_) => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No retries and no sleeping; used by tests and by callers that prefer
    /// fail-fast semantics.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run a store operation with capped exponential backoff on transient
/// failures. Non-retryable errors are returned immediately.
pub async fn retry_store_op<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if classify_store_error(&err) == RetryDisposition::Retryable
                    && attempt < policy.max_retries =>
            {
                warn!(attempt, error = %err, "transient store failure, retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Partial-field write against a stored vehicle. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct VehicleUpdate {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,
    pub price: Option<f64>,
    pub odometer: Option<u32>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub body_type: Option<String>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
    pub images: Option<Vec<String>>,
    pub vendor_status: Option<VendorStatus>,
    pub sync_status: Option<SyncStatus>,
    pub is_published: Option<bool>,
    pub last_seen_from_vendor: Option<DateTime<Utc>>,
}

impl VehicleUpdate {
    /// Apply this update in place. `last_seen_from_vendor` only ever moves
    /// forward; a stale timestamp in the update is ignored.
    pub fn apply(&self, vehicle: &mut VehicleRecord, now: DateTime<Utc>) {
        if let Some(v) = &self.make {
            vehicle.make = v.clone();
        }
        if let Some(v) = &self.model {
            vehicle.model = v.clone();
        }
        if let Some(v) = self.year {
            vehicle.year = v;
        }
        if let Some(v) = self.price {
            vehicle.price = v;
        }
        if let Some(v) = self.odometer {
            vehicle.odometer = v;
        }
        if let Some(v) = &self.description {
            vehicle.description = v.clone();
        }
        if let Some(v) = &self.color {
            vehicle.color = Some(v.clone());
        }
        if let Some(v) = &self.body_type {
            vehicle.body_type = Some(v.clone());
        }
        if let Some(v) = &self.transmission {
            vehicle.transmission = Some(v.clone());
        }
        if let Some(v) = &self.fuel_type {
            vehicle.fuel_type = Some(v.clone());
        }
        if let Some(v) = &self.images {
            vehicle.images = v.clone();
        }
        if let Some(v) = self.vendor_status {
            vehicle.vendor_status = v;
        }
        if let Some(v) = self.sync_status {
            vehicle.sync_status = v;
        }
        if let Some(v) = self.is_published {
            vehicle.is_published = v;
        }
        if let Some(v) = self.last_seen_from_vendor {
            if v > vehicle.last_seen_from_vendor {
                vehicle.last_seen_from_vendor = v;
            }
        }
        vehicle.updated_at = now;
    }
}

/// Persistence boundary for vehicle rows. Reads and writes are always scoped
/// by vendor id at the call site; implementations never match records across
/// vendors.
#[async_trait]
pub trait VehicleStore: Send + Sync {
    async fn find_by_vendor(&self, vendor_id: &str) -> Result<Vec<VehicleRecord>, StoreError>;

    /// Persist a new record, failing with [`StoreError::Constraint`] when a
    /// record with the same VIN already exists for that vendor.
    async fn create(&self, record: VehicleRecord) -> Result<Uuid, StoreError>;

    /// Returns `Ok(false)` when no record with the given id exists.
    async fn update(&self, id: Uuid, update: &VehicleUpdate) -> Result<bool, StoreError>;
}

fn duplicate_vin(records: &HashMap<Uuid, VehicleRecord>, candidate: &VehicleRecord) -> bool {
    let Some(vin) = candidate.vin.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
        return false;
    };
    records.values().any(|existing| {
        existing.vendor_id == candidate.vendor_id
            && existing
                .vin
                .as_deref()
                .map(str::trim)
                .is_some_and(|e| e.eq_ignore_ascii_case(vin))
    })
}

/// In-memory store used by tests and by embedded callers that bring their
/// own persistence.
#[derive(Debug, Default)]
pub struct MemoryVehicleStore {
    vehicles: Mutex<HashMap<Uuid, VehicleRecord>>,
}

impl MemoryVehicleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, bypassing constraint checks. Test setup helper.
    pub async fn insert(&self, record: VehicleRecord) {
        self.vehicles.lock().await.insert(record.id, record);
    }

    pub async fn get(&self, id: Uuid) -> Option<VehicleRecord> {
        self.vehicles.lock().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<VehicleRecord> {
        self.vehicles.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl VehicleStore for MemoryVehicleStore {
    async fn find_by_vendor(&self, vendor_id: &str) -> Result<Vec<VehicleRecord>, StoreError> {
        let vehicles = self.vehicles.lock().await;
        Ok(vehicles
            .values()
            .filter(|v| v.vendor_id == vendor_id)
            .cloned()
            .collect())
    }

    async fn create(&self, record: VehicleRecord) -> Result<Uuid, StoreError> {
        let mut vehicles = self.vehicles.lock().await;
        if duplicate_vin(&vehicles, &record) {
            return Err(StoreError::Constraint(format!(
                "duplicate VIN {} for vendor {}",
                record.vin.as_deref().unwrap_or_default(),
                record.vendor_id
            )));
        }
        let id = record.id;
        vehicles.insert(id, record);
        Ok(id)
    }

    async fn update(&self, id: Uuid, update: &VehicleUpdate) -> Result<bool, StoreError> {
        let mut vehicles = self.vehicles.lock().await;
        match vehicles.get_mut(&id) {
            Some(vehicle) => {
                update.apply(vehicle, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// File-backed store: one JSON document holding every vehicle row, rewritten
/// atomically (temp file + rename) on every mutation. Suits the single
/// dealership scale this system targets.
#[derive(Debug)]
pub struct JsonVehicleStore {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl JsonVehicleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<Uuid, VehicleRecord>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let records: Vec<VehicleRecord> = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt vehicle file: {e}")))?;
                Ok(records.into_iter().map(|r| (r.id, r)).collect())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn save(&self, records: &HashMap<Uuid, VehicleRecord>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut rows: Vec<&VehicleRecord> = records.values().collect();
        rows.sort_by_key(|r| r.id);
        let bytes = serde_json::to_vec_pretty(&rows)
            .map_err(|e| StoreError::Unavailable(format!("serializing vehicle file: {e}")))?;

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(temp_name);
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io(err))
            }
        }
    }
}

#[async_trait]
impl VehicleStore for JsonVehicleStore {
    async fn find_by_vendor(&self, vendor_id: &str) -> Result<Vec<VehicleRecord>, StoreError> {
        let _guard = self.io_lock.lock().await;
        let records = self.load().await?;
        Ok(records
            .into_values()
            .filter(|v| v.vendor_id == vendor_id)
            .collect())
    }

    async fn create(&self, record: VehicleRecord) -> Result<Uuid, StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut records = self.load().await?;
        if duplicate_vin(&records, &record) {
            return Err(StoreError::Constraint(format!(
                "duplicate VIN {} for vendor {}",
                record.vin.as_deref().unwrap_or_default(),
                record.vendor_id
            )));
        }
        let id = record.id;
        records.insert(id, record);
        self.save(&records).await?;
        Ok(id)
    }

    async fn update(&self, id: Uuid, update: &VehicleUpdate) -> Result<bool, StoreError> {
        let _guard = self.io_lock.lock().await;
        let mut records = self.load().await?;
        let Some(vehicle) = records.get_mut(&id) else {
            return Ok(false);
        };
        update.apply(vehicle, Utc::now());
        self.save(&records).await?;
        Ok(true)
    }
}

/// One image-processing request covering every vehicle touched by a sync run
/// that still carries raw vendor URLs.
#[derive(Debug, Clone, Serialize)]
pub struct ImageJob {
    pub job_id: String,
    pub vendor_name: String,
    pub vehicle_ids: Vec<Uuid>,
}

/// Fire-and-forget trigger for the external image ingestion pipeline.
/// Returns whether the pipeline accepted the job; rejection or failure never
/// aborts the sync run that emitted it.
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    async fn enqueue(&self, job: &ImageJob) -> anyhow::Result<bool>;
}

/// HTTP trigger: POSTs the job to the pipeline endpoint, retrying transient
/// failures with capped exponential backoff.
#[derive(Debug)]
pub struct HttpImagePipeline {
    client: reqwest::Client,
    endpoint: String,
    backoff: BackoffPolicy,
}

impl HttpImagePipeline {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building image pipeline http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl ImagePipeline for HttpImagePipeline {
    async fn enqueue(&self, job: &ImageJob) -> anyhow::Result<bool> {
        for attempt in 0..=self.backoff.max_retries {
            let result = self.client.post(&self.endpoint).json(job).send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(true);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    warn!(job_id = %job.job_id, %status, "image pipeline rejected job");
                    return Ok(false);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(err).context("enqueueing image job");
                }
            }
        }
        Ok(false)
    }
}

/// Pipeline stand-in for deployments without an image service configured.
#[derive(Debug, Default)]
pub struct DisabledImagePipeline;

#[async_trait]
impl ImagePipeline for DisabledImagePipeline {
    async fn enqueue(&self, _job: &ImageJob) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Best-effort audit trail for sync runs. Failures are observability losses,
/// never correctness losses.
#[async_trait]
pub trait SyncLogSink: Send + Sync {
    async fn record(&self, result: &SyncResult) -> anyhow::Result<()>;
}

/// Appends one JSON line per sync run.
#[derive(Debug)]
pub struct FileSyncLog {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileSyncLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl SyncLogSink for FileSyncLog {
    async fn record(&self, result: &SyncResult) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(result).context("serializing sync result")?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().await.context("flushing sync log")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NullSyncLog;

#[async_trait]
impl SyncLogSink for NullSyncLog {
    async fn record(&self, _result: &SyncResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// At-most-one-in-flight-per-vendor gate. The reconciliation read-then-write
/// sequence is not atomic, so two runs for the same vendor must never
/// interleave; distinct vendors proceed independently.
#[derive(Debug, Default)]
pub struct VendorGate {
    per_vendor: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl VendorGate {
    pub fn new() -> Self {
        Self::default()
    }

    async fn semaphore_for(&self, vendor_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_vendor.lock().await;
        map.entry(vendor_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    pub async fn acquire(&self, vendor_id: &str) -> OwnedSemaphorePermit {
        self.semaphore_for(vendor_id)
            .await
            .acquire_owned()
            .await
            .expect("vendor gate semaphore not closed")
    }

    pub async fn try_acquire(&self, vendor_id: &str) -> Option<OwnedSemaphorePermit> {
        self.semaphore_for(vendor_id)
            .await
            .try_acquire_owned()
            .ok()
    }
}
