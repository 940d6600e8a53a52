//! Vendor inventory reconciliation: matching, the create/update/retire state
//! machine, image-need detection, and sync-run reporting.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lotsync_adapters::{adapter_for_vendor, GenericJsonAdapter, VendorAdapter};
use lotsync_core::{
    SyncResult, SyncRunStatus, SyncStatus, VehicleRecord, VendorRecord, VendorStatus,
    INTERNAL_VENDOR_ID,
};
use lotsync_store::{
    retry_store_op, BackoffPolicy, DisabledImagePipeline, FileSyncLog, HttpImagePipeline, ImageJob,
    ImagePipeline, JsonVehicleStore, SyncLogSink, VehicleStore, VehicleUpdate, VendorGate,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotsync-sync";

pub const DEFAULT_GRACE_PERIOD_DAYS: u32 = 3;
pub const DEFAULT_AUTO_REMOVE_AFTER_DAYS: u32 = 7;

#[derive(Debug, Error)]
#[error("auto_remove_after_days ({auto_remove_after_days}) must be >= grace_period_days ({grace_period_days})")]
pub struct InvalidRetirementPolicy {
    pub grace_period_days: u32,
    pub auto_remove_after_days: u32,
}

/// How long a vehicle absent from its vendor feed stays visible, then
/// hidden, before being retired for good.
#[derive(Debug, Clone, Copy)]
pub struct RetirementPolicy {
    grace_period_days: i64,
    auto_remove_after_days: i64,
}

impl RetirementPolicy {
    pub fn new(
        grace_period_days: u32,
        auto_remove_after_days: u32,
    ) -> Result<Self, InvalidRetirementPolicy> {
        if auto_remove_after_days < grace_period_days {
            return Err(InvalidRetirementPolicy {
                grace_period_days,
                auto_remove_after_days,
            });
        }
        Ok(Self {
            grace_period_days: i64::from(grace_period_days),
            auto_remove_after_days: i64::from(auto_remove_after_days),
        })
    }

    pub fn grace_period_days(&self) -> i64 {
        self.grace_period_days
    }

    pub fn auto_remove_after_days(&self) -> i64 {
        self.auto_remove_after_days
    }
}

impl Default for RetirementPolicy {
    fn default() -> Self {
        Self {
            grace_period_days: i64::from(DEFAULT_GRACE_PERIOD_DAYS),
            auto_remove_after_days: i64::from(DEFAULT_AUTO_REMOVE_AFTER_DAYS),
        }
    }
}

/// Retirement tier for a vehicle missing from the current feed. The two-stage
/// grace period absorbs scrape flakiness: a transiently missing vehicle stays
/// on the storefront, then hides, and only leaves tracking once the vendor
/// has stopped listing it for `auto_remove_after_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirementTier {
    /// Flagged unlisted but still published; the feed may come back.
    GraceVisible,
    /// Hidden from the storefront, retained for admin views.
    GraceHidden,
    /// Fully exited the vendor feed; terminal.
    Remove,
}

/// Boundary is inclusive on the hidden side: `days == grace` hides.
pub fn retirement_tier(days_since_last_seen: i64, policy: RetirementPolicy) -> RetirementTier {
    if days_since_last_seen < policy.grace_period_days {
        RetirementTier::GraceVisible
    } else if days_since_last_seen < policy.auto_remove_after_days {
        RetirementTier::GraceHidden
    } else {
        RetirementTier::Remove
    }
}

fn normalize_identifier(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_uppercase)
}

/// Decide whether an incoming vendor record corresponds to one of the
/// vendor's stored vehicles. Per-candidate precedence: a VIN comparison, when
/// both sides carry one, is authoritative and never falls through to stock
/// numbers; stock numbers likewise preempt the make/model/year fallback. The
/// fallback is known to conflate same-trim vehicles and is kept only for
/// feeds lacking identifiers.
pub fn find_match<'a>(
    incoming: &VendorRecord,
    existing: &'a [VehicleRecord],
) -> Option<&'a VehicleRecord> {
    let vin = normalize_identifier(incoming.vin.as_deref());
    let stock = normalize_identifier(incoming.stock_number.as_deref());

    for candidate in existing {
        let candidate_vin = normalize_identifier(candidate.vin.as_deref());
        if let (Some(a), Some(b)) = (&vin, &candidate_vin) {
            if a == b {
                return Some(candidate);
            }
            continue;
        }

        let candidate_stock = normalize_identifier(candidate.stock_number.as_deref());
        if let (Some(a), Some(b)) = (&stock, &candidate_stock) {
            if a == b {
                return Some(candidate);
            }
            continue;
        }

        if incoming.make.eq_ignore_ascii_case(&candidate.make)
            && incoming.model.eq_ignore_ascii_case(&candidate.model)
            && incoming.year == candidate.year
        {
            return Some(candidate);
        }
    }
    None
}

/// A vehicle needs image processing while its first image is still a raw
/// vendor URL rather than a resolved image-store reference.
pub fn needs_image_processing(images: &[String]) -> bool {
    images
        .first()
        .is_some_and(|url| url.starts_with("http://") || url.starts_with("https://"))
}

fn image_job_id(vendor_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "{vendor_id}-{}-{}",
        now.format("%Y%m%d%H%M%S"),
        Uuid::new_v4().simple()
    )
}

/// The reconciliation engine. Straight-line, non-reentrant per vendor; the
/// caller serializes same-vendor runs (see [`lotsync_store::VendorGate`]).
pub struct Reconciler<S: VehicleStore> {
    store: Arc<S>,
    images: Arc<dyn ImagePipeline>,
    log: Arc<dyn SyncLogSink>,
    backoff: BackoffPolicy,
}

impl<S: VehicleStore> Reconciler<S> {
    pub fn new(store: Arc<S>, images: Arc<dyn ImagePipeline>, log: Arc<dyn SyncLogSink>) -> Self {
        Self {
            store,
            images,
            log,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reconcile one vendor's freshly scraped feed against the record store.
    ///
    /// Malformed records and per-record store failures are skipped and
    /// degrade the run to `partial`; only a failed fetch of the existing
    /// baseline aborts the run, since reconciling against a missing baseline
    /// would duplicate every vehicle in the feed.
    pub async fn sync_vendor_inventory(
        &self,
        vendor_id: &str,
        vendor_name: &str,
        policy: RetirementPolicy,
        feed: &[JsonValue],
    ) -> SyncResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, vendor_id, records = feed.len(), "vendor sync starting");

        if vendor_id == INTERNAL_VENDOR_ID {
            let result = SyncResult::failed(
                run_id,
                vendor_id,
                started_at,
                feed.len(),
                "refusing to reconcile manually-entered internal inventory",
            );
            self.record_result(&result).await;
            return result;
        }

        let adapter: Box<dyn VendorAdapter> =
            adapter_for_vendor(vendor_id).unwrap_or_else(|| Box::new(GenericJsonAdapter));

        // Step A: baseline fetch, scoped to this vendor.
        let existing = match retry_store_op(&self.backoff, || self.store.find_by_vendor(vendor_id))
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                warn!(%run_id, vendor_id, error = %err, "existing-record fetch failed; aborting run");
                let result = SyncResult::failed(
                    run_id,
                    vendor_id,
                    started_at,
                    feed.len(),
                    format!("fetching existing records: {err}"),
                );
                self.record_result(&result).await;
                return result;
            }
        };

        let now = Utc::now();
        let mut matched_ids: HashSet<Uuid> = HashSet::new();
        let mut new_vehicles = 0usize;
        let mut updated_vehicles = 0usize;
        let mut unlisted_vehicles = 0usize;
        let mut removed_vehicles = 0usize;
        let mut skipped_records = 0usize;
        let mut image_candidates: Vec<Uuid> = Vec::new();

        // Step B: upsert pass over the incoming feed.
        for (index, raw) in feed.iter().enumerate() {
            let record = match adapter.normalize(raw) {
                Ok(record) => record,
                Err(err) => {
                    warn!(index, error = %err, "skipping malformed vendor record");
                    skipped_records += 1;
                    continue;
                }
            };

            match find_match(&record, &existing) {
                None => {
                    let vehicle =
                        VehicleRecord::from_first_sighting(vendor_id, vendor_name, &record, now);
                    let images = vehicle.images.clone();
                    match retry_store_op(&self.backoff, || self.store.create(vehicle.clone())).await
                    {
                        Ok(id) => {
                            new_vehicles += 1;
                            if needs_image_processing(&images) {
                                image_candidates.push(id);
                            }
                        }
                        Err(err) => {
                            warn!(
                                vin = record.vin.as_deref().unwrap_or("-"),
                                stock_number = record.stock_number.as_deref().unwrap_or("-"),
                                error = %err,
                                "creating vehicle failed; record skipped"
                            );
                            skipped_records += 1;
                        }
                    }
                }
                Some(matched) => {
                    if !matched_ids.insert(matched.id) {
                        warn!(
                            vehicle_id = %matched.id,
                            index,
                            "second feed row matched an already-synced vehicle; record skipped"
                        );
                        skipped_records += 1;
                        continue;
                    }

                    if matched.is_frozen_for_sync() {
                        // Sold vehicles still get their sighting refreshed,
                        // but no vendor-driven status or field changes.
                        let refresh = VehicleUpdate {
                            last_seen_from_vendor: Some(now),
                            ..Default::default()
                        };
                        if let Err(err) = retry_store_op(&self.backoff, || {
                            self.store.update(matched.id, &refresh)
                        })
                        .await
                        {
                            warn!(vehicle_id = %matched.id, error = %err, "sighting refresh failed");
                            skipped_records += 1;
                        }
                        continue;
                    }

                    let changed = record.price != matched.price
                        || record.odometer != matched.odometer
                        || record.description != matched.description;

                    // Images are deliberately not overwritten: once the image
                    // pipeline has replaced the raw URLs with store
                    // references, a later sync must not reset them.
                    let update = VehicleUpdate {
                        make: Some(record.make.clone()),
                        model: Some(record.model.clone()),
                        year: Some(record.year),
                        price: Some(record.price),
                        odometer: Some(record.odometer),
                        description: Some(record.description.clone()),
                        color: record.color.clone(),
                        body_type: record.body_type.clone(),
                        transmission: record.transmission.clone(),
                        fuel_type: record.fuel_type.clone(),
                        images: None,
                        vendor_status: Some(VendorStatus::Active),
                        sync_status: Some(SyncStatus::Synced),
                        is_published: Some(true),
                        last_seen_from_vendor: Some(now),
                    };
                    match retry_store_op(&self.backoff, || self.store.update(matched.id, &update))
                        .await
                    {
                        Ok(true) => {
                            if changed {
                                updated_vehicles += 1;
                            }
                            if needs_image_processing(&matched.images) {
                                image_candidates.push(matched.id);
                            }
                        }
                        Ok(false) => {
                            warn!(
                                vehicle_id = %matched.id,
                                "vehicle vanished before update; record skipped"
                            );
                            skipped_records += 1;
                        }
                        Err(err) => {
                            warn!(
                                vehicle_id = %matched.id,
                                vin = record.vin.as_deref().unwrap_or("-"),
                                error = %err,
                                "updating vehicle failed; record skipped"
                            );
                            skipped_records += 1;
                        }
                    }
                }
            }
        }

        // Step C: retirement pass over stored vehicles missing from the feed.
        // Removed is terminal; a record retired in an earlier run must not be
        // rewritten or recounted.
        for vehicle in existing.iter().filter(|v| !matched_ids.contains(&v.id)) {
            if vehicle.is_frozen_for_sync() || vehicle.vendor_status == VendorStatus::Removed {
                continue;
            }
            let days_since_last_seen = (now - vehicle.last_seen_from_vendor).num_days();
            let update = match retirement_tier(days_since_last_seen, policy) {
                RetirementTier::GraceVisible => VehicleUpdate {
                    vendor_status: Some(VendorStatus::Unlisted),
                    sync_status: Some(SyncStatus::PendingRemoval),
                    is_published: Some(true),
                    ..Default::default()
                },
                RetirementTier::GraceHidden => VehicleUpdate {
                    vendor_status: Some(VendorStatus::Unlisted),
                    sync_status: Some(SyncStatus::PendingRemoval),
                    is_published: Some(false),
                    ..Default::default()
                },
                RetirementTier::Remove => VehicleUpdate {
                    vendor_status: Some(VendorStatus::Removed),
                    sync_status: Some(SyncStatus::Synced),
                    is_published: Some(false),
                    ..Default::default()
                },
            };
            match retry_store_op(&self.backoff, || self.store.update(vehicle.id, &update)).await {
                Ok(true) => match update.vendor_status {
                    Some(VendorStatus::Removed) => removed_vehicles += 1,
                    _ => unlisted_vehicles += 1,
                },
                Ok(false) => {
                    warn!(vehicle_id = %vehicle.id, "vehicle vanished before retirement update");
                    skipped_records += 1;
                }
                Err(err) => {
                    warn!(vehicle_id = %vehicle.id, days_since_last_seen, error = %err,
                        "retirement update failed");
                    skipped_records += 1;
                }
            }
        }

        // Step D: one image job for everything still carrying raw URLs.
        let image_processing_triggered = if image_candidates.is_empty() {
            false
        } else {
            let job = ImageJob {
                job_id: image_job_id(vendor_id, now),
                vendor_name: vendor_name.to_string(),
                vehicle_ids: image_candidates,
            };
            match self.images.enqueue(&job).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(job_id = %job.job_id, "image pipeline did not accept job");
                    false
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "image pipeline enqueue failed");
                    false
                }
            }
        };

        let status = if skipped_records > 0 {
            SyncRunStatus::Partial
        } else {
            SyncRunStatus::Success
        };
        let result = SyncResult {
            run_id,
            vendor_id: vendor_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            vehicles_found: feed.len(),
            new_vehicles,
            updated_vehicles,
            unlisted_vehicles,
            removed_vehicles,
            skipped_records,
            image_processing_triggered,
            status,
            error_message: None,
        };
        info!(
            %run_id,
            vendor_id,
            vehicles_found = result.vehicles_found,
            new = result.new_vehicles,
            updated = result.updated_vehicles,
            unlisted = result.unlisted_vehicles,
            removed = result.removed_vehicles,
            skipped = result.skipped_records,
            "vendor sync complete"
        );
        self.record_result(&result).await;
        result
    }

    async fn record_result(&self, result: &SyncResult) {
        if let Err(err) = self.log.record(result).await {
            warn!(run_id = %result.run_id, error = %err, "sync log sink failed");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorRegistry {
    pub vendors: Vec<VendorConfig>,
}

impl VendorRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    pub vendor_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub feed_path: Option<String>,
    #[serde(default)]
    pub grace_period_days: Option<u32>,
    #[serde(default)]
    pub auto_remove_after_days: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl VendorConfig {
    pub fn retirement_policy(&self) -> Result<RetirementPolicy, InvalidRetirementPolicy> {
        RetirementPolicy::new(
            self.grace_period_days.unwrap_or(DEFAULT_GRACE_PERIOD_DAYS),
            self.auto_remove_after_days
                .unwrap_or(DEFAULT_AUTO_REMOVE_AFTER_DAYS),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub vehicles_path: PathBuf,
    pub reports_dir: PathBuf,
    pub sync_log_path: PathBuf,
    pub image_pipeline_url: Option<String>,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            vehicles_path: std::env::var("LOTSYNC_VEHICLES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/vehicles.json")),
            reports_dir: std::env::var("LOTSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            sync_log_path: std::env::var("LOTSYNC_SYNC_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports/sync_runs.jsonl")),
            image_pipeline_url: std::env::var("LOTSYNC_IMAGE_PIPELINE_URL").ok(),
            http_timeout_secs: std::env::var("LOTSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("LOTSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub synced_vendors: usize,
    pub results: Vec<SyncResult>,
    pub reports_dir: String,
}

/// Orchestrates reconciliation across every configured vendor: loads the
/// vendor registry and scraped feed files, serializes same-vendor runs, and
/// writes a per-run report directory.
pub struct SyncPipeline {
    config: SyncConfig,
    reconciler: Reconciler<JsonVehicleStore>,
    gate: VendorGate,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(JsonVehicleStore::new(&config.vehicles_path));
        let images: Arc<dyn ImagePipeline> = match &config.image_pipeline_url {
            Some(url) => Arc::new(HttpImagePipeline::new(
                url.clone(),
                StdDuration::from_secs(config.http_timeout_secs),
            )?),
            None => Arc::new(DisabledImagePipeline),
        };
        let log: Arc<dyn SyncLogSink> = Arc::new(FileSyncLog::new(&config.sync_log_path));
        Ok(Self {
            reconciler: Reconciler::new(store, images, log),
            gate: VendorGate::new(),
            config,
        })
    }

    pub async fn run_once(&self) -> Result<PipelineRunSummary> {
        let started_at = Utc::now();
        let registry = VendorRegistry::load(self.config.workspace_root.join("vendors.yaml")).await?;
        let enabled: Vec<_> = registry.vendors.into_iter().filter(|v| v.enabled).collect();

        let mut results = Vec::new();
        for vendor in &enabled {
            results.push(self.sync_vendor(vendor).await);
        }

        Ok(PipelineRunSummary {
            started_at,
            finished_at: Utc::now(),
            synced_vendors: enabled.len(),
            results,
            reports_dir: self.config.reports_dir.display().to_string(),
        })
    }

    pub async fn run_vendor(&self, vendor_id: &str) -> Result<SyncResult> {
        let registry = VendorRegistry::load(self.config.workspace_root.join("vendors.yaml")).await?;
        let vendor = registry
            .vendors
            .into_iter()
            .find(|v| v.vendor_id == vendor_id)
            .with_context(|| format!("vendor {vendor_id} not present in vendors.yaml"))?;
        Ok(self.sync_vendor(&vendor).await)
    }

    async fn sync_vendor(&self, vendor: &VendorConfig) -> SyncResult {
        let _permit = self.gate.acquire(&vendor.vendor_id).await;

        let feed = match self.load_feed(vendor).await {
            Ok(feed) => feed,
            Err(err) => {
                warn!(vendor_id = %vendor.vendor_id, error = %err, "feed unreadable; run failed");
                let result = SyncResult::failed(
                    Uuid::new_v4(),
                    &vendor.vendor_id,
                    Utc::now(),
                    0,
                    format!("loading feed: {err}"),
                );
                self.write_run_report(&result).await;
                return result;
            }
        };
        let policy = match vendor.retirement_policy() {
            Ok(policy) => policy,
            Err(err) => {
                let result = SyncResult::failed(
                    Uuid::new_v4(),
                    &vendor.vendor_id,
                    Utc::now(),
                    feed.len(),
                    err.to_string(),
                );
                self.write_run_report(&result).await;
                return result;
            }
        };

        let result = self
            .reconciler
            .sync_vendor_inventory(&vendor.vendor_id, &vendor.display_name, policy, &feed)
            .await;
        self.write_run_report(&result).await;
        result
    }

    async fn load_feed(&self, vendor: &VendorConfig) -> Result<Vec<JsonValue>> {
        let path = match &vendor.feed_path {
            Some(rel) => self.config.workspace_root.join(rel),
            None => self
                .config
                .workspace_root
                .join("feeds")
                .join(&vendor.vendor_id)
                .join("feed.json"),
        };
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Report failures are logged, never propagated: a sync that reconciled
    /// correctly is not failed by observability.
    async fn write_run_report(&self, result: &SyncResult) {
        if let Err(err) = write_run_report(&self.config.reports_dir, result).await {
            warn!(run_id = %result.run_id, error = %err, "writing run report failed");
        }
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(
                            synced_vendors = summary.synced_vendors,
                            "scheduled sync complete"
                        ),
                        Err(err) => warn!(error = %err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<PipelineRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

pub async fn write_run_report(reports_dir: &Path, result: &SyncResult) -> Result<()> {
    let run_dir = reports_dir.join(result.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(result).context("serializing sync result")?;
    fs::write(run_dir.join("sync_result.json"), json)
        .await
        .context("writing sync_result.json")?;

    let status = match result.status {
        SyncRunStatus::Success => "success",
        SyncRunStatus::Partial => "partial",
        SyncRunStatus::Failed => "failed",
    };
    let brief = format!(
        "# LotSync Run Brief\n\n- Run ID: `{}`\n- Vendor: {}\n- Started: {}\n- Finished: {}\n- Status: {}\n\n## Counts\n- found: {}\n- new: {}\n- updated: {}\n- unlisted: {}\n- removed: {}\n- skipped: {}\n- image job triggered: {}\n{}",
        result.run_id,
        result.vendor_id,
        result.started_at,
        result.finished_at,
        status,
        result.vehicles_found,
        result.new_vehicles,
        result.updated_vehicles,
        result.unlisted_vehicles,
        result.removed_vehicles,
        result.skipped_records,
        result.image_processing_triggered,
        result
            .error_message
            .as_deref()
            .map(|msg| format!("\n## Error\n{msg}\n"))
            .unwrap_or_default()
    );
    fs::write(run_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;
    Ok(())
}

/// Markdown digest of the most recent sync runs, newest first.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# LotSync Recent Runs".to_string(), String::new()];
    for dir in dirs {
        let result_path = dir.path().join("sync_result.json");
        let result: SyncResult = serde_json::from_str(
            &std::fs::read_to_string(&result_path)
                .with_context(|| format!("reading {}", result_path.display()))?,
        )
        .with_context(|| format!("parsing {}", result_path.display()))?;

        lines.push(format!("## Run `{}`", result.run_id));
        lines.push(format!("- vendor: {}", result.vendor_id));
        lines.push(format!("- status: {:?}", result.status));
        lines.push(format!(
            "- found {} / new {} / updated {} / unlisted {} / removed {} / skipped {}",
            result.vehicles_found,
            result.new_vehicles,
            result.updated_vehicles,
            result.unlisted_vehicles,
            result.removed_vehicles,
            result.skipped_records,
        ));
        if let Some(msg) = &result.error_message {
            lines.push(format!("- error: {msg}"));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use lotsync_store::{MemoryVehicleStore, NullSyncLog, StoreError};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    struct RecordingPipeline {
        jobs: Mutex<Vec<ImageJob>>,
        accept: bool,
    }

    impl RecordingPipeline {
        fn new(accept: bool) -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                accept,
            }
        }
    }

    #[async_trait]
    impl ImagePipeline for RecordingPipeline {
        async fn enqueue(&self, job: &ImageJob) -> anyhow::Result<bool> {
            self.jobs.lock().await.push(job.clone());
            Ok(self.accept)
        }
    }

    struct FailingPipeline;

    #[async_trait]
    impl ImagePipeline for FailingPipeline {
        async fn enqueue(&self, _job: &ImageJob) -> anyhow::Result<bool> {
            Err(anyhow::anyhow!("image service unreachable"))
        }
    }

    #[derive(Default)]
    struct MemorySyncLog {
        results: Mutex<Vec<SyncResult>>,
    }

    #[async_trait]
    impl SyncLogSink for MemorySyncLog {
        async fn record(&self, result: &SyncResult) -> anyhow::Result<()> {
            self.results.lock().await.push(result.clone());
            Ok(())
        }
    }

    /// Store whose baseline fetch can be made to fail persistently.
    struct UnreachableStore {
        inner: MemoryVehicleStore,
        fail_finds: AtomicBool,
    }

    impl UnreachableStore {
        fn new() -> Self {
            Self {
                inner: MemoryVehicleStore::new(),
                fail_finds: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl VehicleStore for UnreachableStore {
        async fn find_by_vendor(&self, vendor_id: &str) -> Result<Vec<VehicleRecord>, StoreError> {
            if self.fail_finds.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("edge database offline".into()));
            }
            self.inner.find_by_vendor(vendor_id).await
        }

        async fn create(&self, record: VehicleRecord) -> Result<Uuid, StoreError> {
            self.inner.create(record).await
        }

        async fn update(&self, id: Uuid, update: &VehicleUpdate) -> Result<bool, StoreError> {
            self.inner.update(id, update).await
        }
    }

    /// Store whose rows disappear between the baseline fetch and the update.
    struct GhostUpdateStore {
        inner: MemoryVehicleStore,
    }

    #[async_trait]
    impl VehicleStore for GhostUpdateStore {
        async fn find_by_vendor(&self, vendor_id: &str) -> Result<Vec<VehicleRecord>, StoreError> {
            self.inner.find_by_vendor(vendor_id).await
        }

        async fn create(&self, record: VehicleRecord) -> Result<Uuid, StoreError> {
            self.inner.create(record).await
        }

        async fn update(&self, _id: Uuid, _update: &VehicleUpdate) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    fn reconciler(
        store: Arc<MemoryVehicleStore>,
        images: Arc<dyn ImagePipeline>,
    ) -> Reconciler<MemoryVehicleStore> {
        Reconciler::new(store, images, Arc::new(NullSyncLog)).with_backoff(BackoffPolicy::none())
    }

    fn lambert_feed_record(vin: &str, price: f64) -> JsonValue {
        json!({
            "vin": vin,
            "stockNumber": "LA-1042",
            "make": "Honda",
            "model": "Accord",
            "year": 2019,
            "price": price,
            "mileage": 42_100,
            "photos": [{"url": "https://cdn.lambert.example/1042-front.jpg"}],
            "details": {"description": "One owner, clean history"}
        })
    }

    fn seeded_vehicle(vendor_id: &str, vin: &str, last_seen_days_ago: i64) -> VehicleRecord {
        let record = VendorRecord {
            vin: Some(vin.to_string()),
            stock_number: Some("LA-1042".to_string()),
            make: "Honda".to_string(),
            model: "Accord".to_string(),
            year: 2019,
            price: 18995.0,
            odometer: 42_100,
            images: vec!["https://cdn.lambert.example/1042-front.jpg".to_string()],
            description: "One owner, clean history".to_string(),
            color: None,
            body_type: None,
            transmission: None,
            fuel_type: None,
        };
        let mut vehicle = VehicleRecord::from_first_sighting(
            vendor_id,
            "Lambert Auto",
            &record,
            Utc::now() - Duration::days(last_seen_days_ago),
        );
        vehicle.updated_at = vehicle.last_seen_from_vendor;
        vehicle
    }

    #[tokio::test]
    async fn first_sighting_creates_active_published_vehicle() {
        let store = Arc::new(MemoryVehicleStore::new());
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![lambert_feed_record("1HGCM82633A004352", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.status, SyncRunStatus::Success);
        assert_eq!(result.vehicles_found, 1);
        assert_eq!(result.new_vehicles, 1);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].vendor_status, VendorStatus::Active);
        assert!(stored[0].is_published);
    }

    #[tokio::test]
    async fn identical_resubmission_is_a_noop_refresh() {
        let store = Arc::new(MemoryVehicleStore::new());
        let seeded = seeded_vehicle("lambert", "1HGCM82633A004352", 1);
        let old_seen = seeded.last_seen_from_vendor;
        store.insert(seeded).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![lambert_feed_record("1HGCM82633A004352", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.new_vehicles, 0);
        assert_eq!(result.updated_vehicles, 0);
        assert_eq!(result.status, SyncRunStatus::Success);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert!(stored[0].last_seen_from_vendor > old_seen);
        assert_eq!(stored[0].vendor_status, VendorStatus::Active);
    }

    #[tokio::test]
    async fn price_change_counts_as_update() {
        let store = Arc::new(MemoryVehicleStore::new());
        store.insert(seeded_vehicle("lambert", "1HGCM82633A004352", 1)).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![lambert_feed_record("1HGCM82633A004352", 17995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.updated_vehicles, 1);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored[0].price, 17995.0);
    }

    #[tokio::test]
    async fn cosmetic_field_change_is_not_counted_as_update() {
        let store = Arc::new(MemoryVehicleStore::new());
        store.insert(seeded_vehicle("lambert", "1HGCM82633A004352", 1)).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let mut raw = lambert_feed_record("1HGCM82633A004352", 18995.0);
        raw["details"]["color"] = json!("Midnight Blue");
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[raw])
            .await;

        assert_eq!(result.updated_vehicles, 0);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored[0].color.as_deref(), Some("Midnight Blue"));
    }

    #[tokio::test]
    async fn absence_inside_grace_period_unlists_but_keeps_published() {
        let store = Arc::new(MemoryVehicleStore::new());
        store.insert(seeded_vehicle("lambert", "VINA", 2)).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;

        assert_eq!(result.unlisted_vehicles, 1);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored[0].vendor_status, VendorStatus::Unlisted);
        assert_eq!(stored[0].sync_status, SyncStatus::PendingRemoval);
        assert!(stored[0].is_published);
    }

    #[tokio::test]
    async fn grace_boundary_day_is_hidden() {
        let store = Arc::new(MemoryVehicleStore::new());
        store.insert(seeded_vehicle("lambert", "VINA", 3)).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;

        assert_eq!(result.unlisted_vehicles, 1);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored[0].vendor_status, VendorStatus::Unlisted);
        assert!(!stored[0].is_published);
    }

    #[tokio::test]
    async fn long_absence_removes_and_unpublishes() {
        let store = Arc::new(MemoryVehicleStore::new());
        store.insert(seeded_vehicle("lambert", "VINA", 10)).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;

        assert_eq!(result.removed_vehicles, 1);
        assert_eq!(result.unlisted_vehicles, 0);
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored[0].vendor_status, VendorStatus::Removed);
        assert_eq!(stored[0].sync_status, SyncStatus::Synced);
        assert!(!stored[0].is_published);
    }

    #[tokio::test]
    async fn retirement_progresses_unlisted_then_removed() {
        let store = Arc::new(MemoryVehicleStore::new());
        let vehicle = seeded_vehicle("lambert", "VINA", 4);
        let id = vehicle.id;
        store.insert(vehicle).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;
        let mut after_first = store.get(id).await.unwrap();
        assert_eq!(after_first.vendor_status, VendorStatus::Unlisted);

        // The vendor stays silent for another week.
        after_first.last_seen_from_vendor = Utc::now() - Duration::days(11);
        store.insert(after_first).await;
        engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;
        assert_eq!(store.get(id).await.unwrap().vendor_status, VendorStatus::Removed);
    }

    #[tokio::test]
    async fn removed_vehicles_are_not_recounted_on_later_runs() {
        let store = Arc::new(MemoryVehicleStore::new());
        let vehicle = seeded_vehicle("lambert", "VINA", 30);
        let id = vehicle.id;
        store.insert(vehicle).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let first = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;
        assert_eq!(first.removed_vehicles, 1);
        let retired_at = store.get(id).await.unwrap().updated_at;

        let second = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &[])
            .await;
        assert_eq!(second.removed_vehicles, 0);
        assert_eq!(second.unlisted_vehicles, 0);
        assert_eq!(second.status, SyncRunStatus::Success);
        // Terminal record is left untouched, not rewritten.
        let after = store.get(id).await.unwrap();
        assert_eq!(after.vendor_status, VendorStatus::Removed);
        assert_eq!(after.updated_at, retired_at);
    }

    #[tokio::test]
    async fn second_feed_row_matching_same_vehicle_is_skipped() {
        let store = Arc::new(MemoryVehicleStore::new());
        // Identifier-poor record: matching runs on the shared stock number.
        let mut seeded = seeded_vehicle("lambert", "VINA", 1);
        seeded.vin = None;
        let id = seeded.id;
        store.insert(seeded).await;
        let pipeline = Arc::new(RecordingPipeline::new(true));
        let engine = reconciler(store.clone(), pipeline.clone());

        // Both rows carry stock LA-1042 and match the same stored vehicle.
        let feed = vec![
            lambert_feed_record("VINA", 17995.0),
            lambert_feed_record("VINB", 16995.0),
        ];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.updated_vehicles, 1);
        assert_eq!(result.skipped_records, 1);
        assert_eq!(result.status, SyncRunStatus::Partial);
        assert_eq!(store.find_by_vendor("lambert").await.unwrap().len(), 1);
        // The image batch names the vehicle once.
        let jobs = pipeline.jobs.lock().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].vehicle_ids, vec![id]);
    }

    #[tokio::test]
    async fn update_of_vanished_vehicle_counts_as_skipped() {
        let store = Arc::new(GhostUpdateStore {
            inner: MemoryVehicleStore::new(),
        });
        store.inner.insert(seeded_vehicle("lambert", "VINA", 1)).await;
        let engine = Reconciler::new(
            store.clone(),
            Arc::new(RecordingPipeline::new(true)) as Arc<dyn ImagePipeline>,
            Arc::new(NullSyncLog),
        )
        .with_backoff(BackoffPolicy::none());

        let feed = vec![lambert_feed_record("VINA", 17995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.updated_vehicles, 0);
        assert_eq!(result.skipped_records, 1);
        assert_eq!(result.status, SyncRunStatus::Partial);
        assert!(!result.image_processing_triggered);
    }

    #[tokio::test]
    async fn malformed_record_degrades_run_to_partial() {
        let store = Arc::new(MemoryVehicleStore::new());
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![
            json!({"model": "Accord", "year": 2019, "price": 18995}),
            lambert_feed_record("1HGCM82633A004352", 18995.0),
        ];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.vehicles_found, 2);
        assert_eq!(result.new_vehicles, 1);
        assert_eq!(result.updated_vehicles, 0);
        assert_eq!(result.skipped_records, 1);
        assert_eq!(result.status, SyncRunStatus::Partial);
    }

    #[tokio::test]
    async fn duplicate_vin_within_one_feed_is_skipped() {
        let store = Arc::new(MemoryVehicleStore::new());
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![
            lambert_feed_record("1HGCM82633A004352", 18995.0),
            lambert_feed_record("1HGCM82633A004352", 18995.0),
        ];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.new_vehicles, 1);
        assert_eq!(result.skipped_records, 1);
        assert_eq!(result.status, SyncRunStatus::Partial);
        assert_eq!(store.find_by_vendor("lambert").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sold_vehicle_is_untouched_whether_present_or_absent() {
        let store = Arc::new(MemoryVehicleStore::new());
        let mut sold_present = seeded_vehicle("lambert", "VINA", 1);
        sold_present.is_sold = true;
        let present_id = sold_present.id;
        let mut sold_absent = seeded_vehicle("lambert", "VINB", 30);
        sold_absent.is_sold = true;
        sold_absent.stock_number = Some("LA-9999".to_string());
        let absent_id = sold_absent.id;
        store.insert(sold_present).await;
        store.insert(sold_absent).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![lambert_feed_record("VINA", 9999.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.updated_vehicles, 0);
        assert_eq!(result.unlisted_vehicles, 0);
        assert_eq!(result.removed_vehicles, 0);
        let present = store.get(present_id).await.unwrap();
        assert_eq!(present.vendor_status, VendorStatus::Active);
        assert!(present.is_published);
        assert_eq!(present.price, 18995.0);
        let absent = store.get(absent_id).await.unwrap();
        assert_eq!(absent.vendor_status, VendorStatus::Active);
        assert!(absent.is_published);
    }

    #[tokio::test]
    async fn vendors_never_see_each_others_records() {
        let store = Arc::new(MemoryVehicleStore::new());
        let northside = seeded_vehicle("northside", "1HGCM82633A004352", 1);
        let northside_id = northside.id;
        let northside_before = northside.clone();
        store.insert(northside).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        // Same VIN arrives from lambert: no cross-vendor match, new record.
        let feed = vec![lambert_feed_record("1HGCM82633A004352", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.new_vehicles, 1);
        assert_eq!(result.unlisted_vehicles, 0);
        assert_eq!(result.removed_vehicles, 0);
        assert_eq!(store.get(northside_id).await.unwrap(), northside_before);
        assert_eq!(store.find_by_vendor("lambert").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn vin_mismatch_never_falls_back_to_stock_number() {
        let store = Arc::new(MemoryVehicleStore::new());
        // Existing vehicle shares the stock number but not the VIN.
        store.insert(seeded_vehicle("lambert", "VINA", 1)).await;
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let feed = vec![lambert_feed_record("VINB", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.new_vehicles, 1);
        assert_eq!(store.find_by_vendor("lambert").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn baseline_fetch_failure_aborts_the_run() {
        let store = Arc::new(UnreachableStore::new());
        store.inner.insert(seeded_vehicle("lambert", "VINA", 10)).await;
        let log = Arc::new(MemorySyncLog::default());
        let engine = Reconciler::new(
            store.clone(),
            Arc::new(RecordingPipeline::new(true)) as Arc<dyn ImagePipeline>,
            log.clone(),
        )
        .with_backoff(BackoffPolicy::none());

        let feed = vec![lambert_feed_record("VINB", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.status, SyncRunStatus::Failed);
        assert!(result.error_message.as_deref().unwrap().contains("existing records"));
        assert_eq!(result.new_vehicles, 0);
        // Nothing was created and nothing was retired against the missing baseline.
        assert_eq!(store.inner.all().await.len(), 1);
        assert_eq!(
            store.inner.all().await[0].vendor_status,
            VendorStatus::Active
        );
        let logged = log.results.lock().await;
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].status, SyncRunStatus::Failed);
    }

    #[tokio::test]
    async fn one_image_job_covers_every_raw_url_vehicle() {
        let store = Arc::new(MemoryVehicleStore::new());
        let pipeline = Arc::new(RecordingPipeline::new(true));
        let engine = reconciler(store.clone(), pipeline.clone());

        let mut no_images = lambert_feed_record("VINC", 21995.0);
        no_images["photos"] = json!([]);
        no_images["stockNumber"] = json!("LA-3");
        let mut second = lambert_feed_record("VINB", 15995.0);
        second["stockNumber"] = json!("LA-2");
        let feed = vec![
            lambert_feed_record("VINA", 18995.0),
            second,
            no_images,
        ];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert!(result.image_processing_triggered);
        let jobs = pipeline.jobs.lock().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].vehicle_ids.len(), 2);
        assert!(jobs[0].job_id.starts_with("lambert-"));
        assert_eq!(jobs[0].vendor_name, "Lambert Auto");
    }

    #[tokio::test]
    async fn image_enqueue_failure_does_not_fail_the_run() {
        let store = Arc::new(MemoryVehicleStore::new());
        let engine = reconciler(store.clone(), Arc::new(FailingPipeline));

        let feed = vec![lambert_feed_record("VINA", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert_eq!(result.status, SyncRunStatus::Success);
        assert!(!result.image_processing_triggered);
        assert_eq!(result.new_vehicles, 1);
    }

    #[tokio::test]
    async fn resolved_images_do_not_retrigger_processing() {
        let store = Arc::new(MemoryVehicleStore::new());
        let mut resolved = seeded_vehicle("lambert", "VINA", 1);
        resolved.images = vec!["img-store://lambert/1042".to_string()];
        store.insert(resolved).await;
        let pipeline = Arc::new(RecordingPipeline::new(true));
        let engine = reconciler(store.clone(), pipeline.clone());

        let feed = vec![lambert_feed_record("VINA", 18995.0)];
        let result = engine
            .sync_vendor_inventory("lambert", "Lambert Auto", RetirementPolicy::default(), &feed)
            .await;

        assert!(!result.image_processing_triggered);
        assert!(pipeline.jobs.lock().await.is_empty());
        // Resolved references survive the descriptive-field overwrite.
        let stored = store.find_by_vendor("lambert").await.unwrap();
        assert_eq!(stored[0].images, vec!["img-store://lambert/1042".to_string()]);
    }

    #[tokio::test]
    async fn internal_inventory_is_refused() {
        let store = Arc::new(MemoryVehicleStore::new());
        let engine = reconciler(store.clone(), Arc::new(RecordingPipeline::new(true)));

        let result = engine
            .sync_vendor_inventory(
                INTERNAL_VENDOR_ID,
                "Internal",
                RetirementPolicy::default(),
                &[lambert_feed_record("VINA", 18995.0)],
            )
            .await;

        assert_eq!(result.status, SyncRunStatus::Failed);
        assert!(store.all().await.is_empty());
    }

    #[test]
    fn matcher_precedence_vin_then_stock_then_trim() {
        let with_vin = seeded_vehicle("lambert", "VINA", 1);
        let mut stock_only = seeded_vehicle("lambert", "VINB", 1);
        stock_only.vin = None;
        stock_only.stock_number = Some("LA-77".to_string());
        let mut trim_only = seeded_vehicle("lambert", "VINC", 1);
        trim_only.vin = None;
        trim_only.stock_number = None;
        trim_only.make = "Mazda".to_string();
        trim_only.model = "CX-5".to_string();
        trim_only.year = 2022;
        let existing = vec![with_vin.clone(), stock_only.clone(), trim_only.clone()];

        let mut incoming = VendorRecord {
            vin: Some("  vina ".to_string()),
            stock_number: None,
            make: "Honda".to_string(),
            model: "Accord".to_string(),
            year: 2019,
            price: 1.0,
            odometer: 0,
            images: vec![],
            description: String::new(),
            color: None,
            body_type: None,
            transmission: None,
            fuel_type: None,
        };
        assert_eq!(find_match(&incoming, &existing).unwrap().id, with_vin.id);

        incoming.vin = None;
        incoming.stock_number = Some("la-77".to_string());
        assert_eq!(find_match(&incoming, &existing).unwrap().id, stock_only.id);

        incoming.stock_number = None;
        incoming.make = "mazda".to_string();
        incoming.model = "cx-5".to_string();
        incoming.year = 2022;
        assert_eq!(find_match(&incoming, &existing).unwrap().id, trim_only.id);

        incoming.year = 2023;
        assert!(find_match(&incoming, &existing).is_none());
    }

    #[test]
    fn retirement_tiers_honor_boundaries() {
        let policy = RetirementPolicy::default();
        assert_eq!(retirement_tier(0, policy), RetirementTier::GraceVisible);
        assert_eq!(retirement_tier(2, policy), RetirementTier::GraceVisible);
        assert_eq!(retirement_tier(3, policy), RetirementTier::GraceHidden);
        assert_eq!(retirement_tier(6, policy), RetirementTier::GraceHidden);
        assert_eq!(retirement_tier(7, policy), RetirementTier::Remove);
        assert_eq!(retirement_tier(30, policy), RetirementTier::Remove);
    }

    #[test]
    fn policy_rejects_remove_before_grace() {
        assert!(RetirementPolicy::new(5, 3).is_err());
        assert!(RetirementPolicy::new(3, 3).is_ok());
    }

    #[test]
    fn raw_urls_need_processing_resolved_refs_do_not() {
        assert!(needs_image_processing(&["https://cdn.example/a.jpg".to_string()]));
        assert!(needs_image_processing(&["http://cdn.example/a.jpg".to_string()]));
        assert!(!needs_image_processing(&["img-store://abc".to_string()]));
        assert!(!needs_image_processing(&[]));
    }

    #[test]
    fn vendor_registry_parses_yaml() {
        let text = r"
vendors:
  - vendor_id: lambert
    display_name: Lambert Auto
    enabled: true
    grace_period_days: 2
    auto_remove_after_days: 5
  - vendor_id: northside
    display_name: Northside Motors
    enabled: false
";
        let registry: VendorRegistry = serde_yaml::from_str(text).unwrap();
        assert_eq!(registry.vendors.len(), 2);
        let policy = registry.vendors[0].retirement_policy().unwrap();
        assert_eq!(policy.grace_period_days(), 2);
        assert_eq!(policy.auto_remove_after_days(), 5);
        let default_policy = registry.vendors[1].retirement_policy().unwrap();
        assert_eq!(default_policy.grace_period_days(), 3);
    }

    #[tokio::test]
    async fn pipeline_run_once_writes_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::write(
            root.join("vendors.yaml"),
            "vendors:\n  - vendor_id: lambert\n    display_name: Lambert Auto\n    enabled: true\n",
        )
        .unwrap();
        std::fs::create_dir_all(root.join("feeds/lambert")).unwrap();
        std::fs::write(
            root.join("feeds/lambert/feed.json"),
            serde_json::to_vec(&vec![lambert_feed_record("1HGCM82633A004352", 18995.0)]).unwrap(),
        )
        .unwrap();

        let config = SyncConfig {
            workspace_root: root.to_path_buf(),
            vehicles_path: root.join("data/vehicles.json"),
            reports_dir: root.join("reports"),
            sync_log_path: root.join("reports/sync_runs.jsonl"),
            image_pipeline_url: None,
            http_timeout_secs: 5,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
        };
        let pipeline = SyncPipeline::new(config).unwrap();

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.synced_vendors, 1);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].new_vehicles, 1);

        let run_dir = root.join("reports").join(summary.results[0].run_id.to_string());
        assert!(run_dir.join("sync_result.json").exists());
        assert!(run_dir.join("run_brief.md").exists());
        assert!(root.join("reports/sync_runs.jsonl").exists());

        // A second pass over the identical feed is idempotent.
        let again = pipeline.run_once().await.unwrap();
        assert_eq!(again.results[0].new_vehicles, 0);
        assert_eq!(again.results[0].updated_vehicles, 0);

        let digest = report_recent_runs(5, &root.join("reports")).unwrap();
        assert!(digest.contains("lambert"));
    }
}
