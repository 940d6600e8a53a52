//! Vendor feed adapters: convert vendor-specific scraped JSON into the
//! canonical [`VendorRecord`] consumed by the reconciliation engine.

use lotsync_core::VendorRecord;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lotsync-adapters";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("vendor record missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("vendor record field `{field}` unusable: {message}")]
    InvalidField { field: &'static str, message: String },
}

/// One adapter per known vendor feed shape. Adapters are pure parsers: no
/// I/O, no state, and a single malformed record never poisons its batch.
pub trait VendorAdapter: Send + Sync {
    fn vendor_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn normalize(&self, raw: &JsonValue) -> Result<VendorRecord, NormalizeError>;
}

/// Normalize a whole scraped feed, yielding one result per raw record so the
/// caller can skip failures and keep going.
pub fn normalize_feed(
    adapter: &dyn VendorAdapter,
    raw_records: &[JsonValue],
) -> Vec<Result<VendorRecord, NormalizeError>> {
    raw_records.iter().map(|raw| adapter.normalize(raw)).collect()
}

pub fn adapter_for_vendor(vendor_id: &str) -> Option<Box<dyn VendorAdapter>> {
    match vendor_id {
        "lambert" => Some(Box::new(LambertAdapter)),
        "generic-json" => Some(Box::new(GenericJsonAdapter)),
        _ => None,
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Scraped feeds quote numerics as often as not ("$12,995", "42,100 km").
/// Accept a JSON number or a string with currency/grouping noise stripped.
fn json_number(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let node = json_at(value, path)?;
    if let Some(n) = node.as_f64() {
        return Some(n);
    }
    let text = node.as_str()?;
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn required_str(
    value: &JsonValue,
    paths: &[&[&str]],
    field: &'static str,
) -> Result<String, NormalizeError> {
    paths
        .iter()
        .find_map(|path| json_str(value, path))
        .ok_or(NormalizeError::MissingField { field })
}

fn required_number(
    value: &JsonValue,
    paths: &[&[&str]],
    field: &'static str,
) -> Result<f64, NormalizeError> {
    paths
        .iter()
        .find_map(|path| json_number(value, path))
        .ok_or(NormalizeError::MissingField { field })
}

fn year_from(raw: f64) -> Result<i32, NormalizeError> {
    let year = raw as i32;
    if !(1900..=2100).contains(&year) {
        return Err(NormalizeError::InvalidField {
            field: "year",
            message: format!("{raw} is not a model year"),
        });
    }
    Ok(year)
}

fn odometer_from(raw: Option<f64>) -> u32 {
    raw.filter(|v| *v >= 0.0).map(|v| v as u32).unwrap_or(0)
}

/// Lambert Auto's scraped feed: identifiers at the top level, descriptive
/// detail nested under `details`, photos as `photos[].url` or plain strings.
#[derive(Debug, Clone, Copy)]
pub struct LambertAdapter;

impl VendorAdapter for LambertAdapter {
    fn vendor_id(&self) -> &'static str {
        "lambert"
    }

    fn display_name(&self) -> &'static str {
        "Lambert Auto"
    }

    fn normalize(&self, raw: &JsonValue) -> Result<VendorRecord, NormalizeError> {
        let make = required_str(raw, &[&["make"], &["details", "make"]], "make")?;
        let model = required_str(raw, &[&["model"], &["details", "model"]], "model")?;
        let year = year_from(required_number(raw, &[&["year"], &["details", "year"]], "year")?)?;
        let price = required_number(raw, &[&["price"], &["pricing", "asking"]], "price")?;

        let mut images = json_string_vec(raw, &["photos"]);
        if images.is_empty() {
            if let Some(arr) = json_at(raw, &["photos"]).and_then(JsonValue::as_array) {
                images = arr
                    .iter()
                    .filter_map(|photo| photo.get("url").and_then(JsonValue::as_str))
                    .map(str::to_string)
                    .collect();
            }
        }

        Ok(VendorRecord {
            vin: json_str(raw, &["vin"]),
            stock_number: json_str(raw, &["stockNumber"]).or_else(|| json_str(raw, &["stock_number"])),
            make,
            model,
            year,
            price,
            odometer: odometer_from(
                json_number(raw, &["mileage"]).or_else(|| json_number(raw, &["odometer"])),
            ),
            images,
            description: json_str(raw, &["details", "description"])
                .or_else(|| json_str(raw, &["description"]))
                .unwrap_or_default(),
            color: json_str(raw, &["details", "color"]).or_else(|| json_str(raw, &["color"])),
            body_type: json_str(raw, &["details", "body"]).or_else(|| json_str(raw, &["bodyType"])),
            transmission: json_str(raw, &["details", "transmission"]),
            fuel_type: json_str(raw, &["details", "fuel"]),
        })
    }
}

/// Flat snake_case shape used by feeds without a dedicated adapter.
#[derive(Debug, Clone, Copy)]
pub struct GenericJsonAdapter;

impl VendorAdapter for GenericJsonAdapter {
    fn vendor_id(&self) -> &'static str {
        "generic-json"
    }

    fn display_name(&self) -> &'static str {
        "Generic JSON Feed"
    }

    fn normalize(&self, raw: &JsonValue) -> Result<VendorRecord, NormalizeError> {
        let make = required_str(raw, &[&["make"]], "make")?;
        let model = required_str(raw, &[&["model"]], "model")?;
        let year = year_from(required_number(raw, &[&["year"]], "year")?)?;
        let price = required_number(raw, &[&["price"]], "price")?;

        Ok(VendorRecord {
            vin: json_str(raw, &["vin"]),
            stock_number: json_str(raw, &["stock_number"]),
            make,
            model,
            year,
            price,
            odometer: odometer_from(json_number(raw, &["odometer"])),
            images: json_string_vec(raw, &["images"]),
            description: json_str(raw, &["description"]).unwrap_or_default(),
            color: json_str(raw, &["color"]),
            body_type: json_str(raw, &["body_type"]),
            transmission: json_str(raw, &["transmission"]),
            fuel_type: json_str(raw, &["fuel_type"]),
        })
    }
}
