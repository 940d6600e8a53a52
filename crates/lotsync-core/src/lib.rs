//! Core domain model for LotSync vendor inventory reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotsync-core";

/// Reserved vendor id for manually-entered inventory. Reconciliation never
/// touches records owned by this vendor.
pub const INTERNAL_VENDOR_ID: &str = "internal";

/// Reconciliation lifecycle state of a vendor-owned vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorStatus {
    Active,
    Unlisted,
    Removed,
    SoldByUs,
}

/// Whether reconciliation still considers a record live in the vendor feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    PendingRemoval,
}

/// Outcome classification of a whole sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Success,
    Partial,
    Failed,
}

/// Canonical shape of one vehicle listing scraped from a vendor feed.
/// Ephemeral: produced by a vendor adapter, consumed by one reconciliation
/// run, then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorRecord {
    pub vin: Option<String>,
    pub stock_number: Option<String>,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub odometer: u32,
    pub images: Vec<String>,
    pub description: String,
    pub color: Option<String>,
    pub body_type: Option<String>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
}

/// Persistent vehicle row as the record store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: Uuid,
    pub vin: Option<String>,
    pub stock_number: Option<String>,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub odometer: u32,
    pub images: Vec<String>,
    pub description: String,
    pub color: Option<String>,
    pub body_type: Option<String>,
    pub transmission: Option<String>,
    pub fuel_type: Option<String>,
    pub vendor_id: String,
    pub vendor_name: String,
    pub vendor_status: VendorStatus,
    pub sync_status: SyncStatus,
    pub is_published: bool,
    pub is_sold: bool,
    pub last_seen_from_vendor: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VehicleRecord {
    /// Build the persistent record for a vendor listing seen for the first
    /// time: active, synced, published, last seen now.
    pub fn from_first_sighting(
        vendor_id: &str,
        vendor_name: &str,
        record: &VendorRecord,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vin: record.vin.clone(),
            stock_number: record.stock_number.clone(),
            make: record.make.clone(),
            model: record.model.clone(),
            year: record.year,
            price: record.price,
            odometer: record.odometer,
            images: record.images.clone(),
            description: record.description.clone(),
            color: record.color.clone(),
            body_type: record.body_type.clone(),
            transmission: record.transmission.clone(),
            fuel_type: record.fuel_type.clone(),
            vendor_id: vendor_id.to_string(),
            vendor_name: vendor_name.to_string(),
            vendor_status: VendorStatus::Active,
            sync_status: SyncStatus::Synced,
            is_published: true,
            is_sold: false,
            last_seen_from_vendor: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sold records are terminal for reconciliation: vendor-driven status
    /// changes must never be applied to them again.
    pub fn is_frozen_for_sync(&self) -> bool {
        self.is_sold || self.vendor_status == VendorStatus::SoldByUs
    }
}

/// Aggregated outcome of one reconciliation run for one vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub vendor_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vehicles_found: usize,
    pub new_vehicles: usize,
    pub updated_vehicles: usize,
    pub unlisted_vehicles: usize,
    pub removed_vehicles: usize,
    pub skipped_records: usize,
    pub image_processing_triggered: bool,
    pub status: SyncRunStatus,
    pub error_message: Option<String>,
}

impl SyncResult {
    /// Result for a run that aborted before reconciling anything, e.g. when
    /// the baseline fetch of existing records failed.
    pub fn failed(
        run_id: Uuid,
        vendor_id: &str,
        started_at: DateTime<Utc>,
        vehicles_found: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            vendor_id: vendor_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            vehicles_found,
            new_vehicles: 0,
            updated_vehicles: 0,
            unlisted_vehicles: 0,
            removed_vehicles: 0,
            skipped_records: 0,
            image_processing_triggered: false,
            status: SyncRunStatus::Failed,
            error_message: Some(message.into()),
        }
    }
}
