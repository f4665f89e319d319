//! Core domain model for Hygrolog sensor reading reconciliation.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hygrolog-core";

/// Label given to every entry that was already present in the sensor store.
pub const EXISTING_SOURCE_LABEL: &str = "existing";
pub const UNKNOWN_SOURCE_LABEL: &str = "unknown";

/// Number of decimal places kept for temperature and humidity.
pub const READING_SCALE: u32 = 2;

/// Grouping key shared by every entry describing the same area at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingKey {
    pub area_code: String,
    pub timestamp: DateTime<Utc>,
}

/// A normalized reading, either freshly parsed from an upload or loaded back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedReading {
    pub area_code: String,
    pub area_name: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<Decimal>,
    pub humidity: Option<Decimal>,
    pub file_source: String,
    pub is_existing: bool,
}

impl ParsedReading {
    pub fn parsed(
        area_name: &str,
        timestamp: DateTime<Utc>,
        temperature: Option<Decimal>,
        humidity: Option<Decimal>,
        file_source: &str,
    ) -> Self {
        Self {
            area_code: normalize_area_code(area_name),
            area_name: area_name.trim().to_string(),
            timestamp,
            temperature: temperature.map(round_reading_value),
            humidity: humidity.map(round_reading_value),
            file_source: file_source.to_string(),
            is_existing: false,
        }
    }

    pub fn existing(
        area_name: &str,
        timestamp: DateTime<Utc>,
        temperature: Option<Decimal>,
        humidity: Option<Decimal>,
        file_source: &str,
    ) -> Self {
        Self {
            is_existing: true,
            ..Self::parsed(area_name, timestamp, temperature, humidity, file_source)
        }
    }

    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            area_code: self.area_code.clone(),
            timestamp: self.timestamp,
        }
    }

    /// A row with neither value carries nothing to reconcile.
    pub fn has_values(&self) -> bool {
        self.temperature.is_some() || self.humidity.is_some()
    }
}

pub fn round_reading_value(value: Decimal) -> Decimal {
    value.round_dp(READING_SCALE)
}

/// Normalizes a display area name into the code used as the store key.
///
/// Whitespace runs collapse into a single underscore and the result is uppercased,
/// so `" cold room  2 "` and `"Cold Room 2"` both map to `COLD_ROOM_2`.
pub fn normalize_area_code(area_name: &str) -> String {
    area_name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

/// Reduces a file path or URL to its last segment for display in source summaries.
pub fn source_label(file_source: &str) -> String {
    let without_suffix = file_source
        .trim()
        .split(&['?', '#'][..])
        .next()
        .unwrap_or_default();
    let segment = without_suffix
        .trim_end_matches(&['/', '\\'][..])
        .rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or_default()
        .trim();
    if segment.is_empty() {
        UNKNOWN_SOURCE_LABEL.to_string()
    } else {
        segment.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    New,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub label: String,
    pub count: u32,
    #[serde(rename = "type")]
    pub kind: SourceKind,
}

/// One distinct (temperature, humidity) pair observed for an area and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantAggregate {
    pub variant_id: Uuid,
    pub temperature: Option<Decimal>,
    pub humidity: Option<Decimal>,
    pub total_count: u32,
    pub new_count: u32,
    pub existing_count: u32,
    pub source_summaries: Vec<SourceSummary>,
}

impl VariantAggregate {
    pub fn counts_consistent(&self) -> bool {
        let summed: u32 = self.source_summaries.iter().map(|s| s.count).sum();
        self.total_count == self.new_count + self.existing_count && self.total_count == summed
    }

    /// Labels of the freshly parsed sources that produced this variant.
    pub fn new_source_labels(&self) -> Vec<&str> {
        self.source_summaries
            .iter()
            .filter(|s| s.kind == SourceKind::New)
            .map(|s| s.label.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Duplicate,
    Conflict,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Duplicate => "duplicate",
            AnomalyKind::Conflict => "conflict",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duplicate" => Ok(AnomalyKind::Duplicate),
            "conflict" => Ok(AnomalyKind::Conflict),
            other => Err(format!("unknown anomaly type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionAction {
    Skip,
    Overwrite,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Skip => "skip",
            ResolutionAction::Overwrite => "overwrite",
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(ResolutionAction::Skip),
            "overwrite" => Ok(ResolutionAction::Overwrite),
            other => Err(format!("unknown resolution action `{other}`")),
        }
    }
}

/// A pending decision point for one (area, timestamp) group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub batch_id: Uuid,
    pub task_id: Uuid,
    pub area_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub variants: Vec<VariantAggregate>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Anomaly {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Sum of freshly parsed rows across every variant.
    pub fn new_record_count(&self) -> u64 {
        self.variants.iter().map(|v| u64::from(v.new_count)).sum()
    }

    pub fn has_variant(&self, variant_id: Uuid) -> bool {
        self.variants.iter().any(|v| v.variant_id == variant_id)
    }
}

/// The anomaly as handed to the store for registration, before batch linkage and expiry are stamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    pub anomaly_id: Uuid,
    pub area_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub variants: Vec<VariantAggregate>,
}

/// Outcome of consuming one anomaly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub anomaly_id: Uuid,
    pub batch_id: Uuid,
    pub task_id: Uuid,
    pub area_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub action: ResolutionAction,
    pub chosen: Option<VariantAggregate>,
}

impl Resolution {
    pub fn from_anomaly(
        anomaly: Anomaly,
        action: ResolutionAction,
        chosen_variant_id: Option<Uuid>,
    ) -> Self {
        let chosen = select_variant(&anomaly.variants, action, chosen_variant_id).cloned();
        Self {
            anomaly_id: anomaly.anomaly_id,
            batch_id: anomaly.batch_id,
            task_id: anomaly.task_id,
            area_name: anomaly.area_name,
            timestamp: anomaly.timestamp,
            kind: anomaly.kind,
            action,
            chosen,
        }
    }
}

/// Picks the variant a resolution settles on.
///
/// Skip keeps what the store already holds: the first variant with existing rows, else the
/// first variant. Overwrite takes the explicitly chosen variant, else the first variant with
/// new rows, else the first variant.
pub fn select_variant(
    variants: &[VariantAggregate],
    action: ResolutionAction,
    chosen_variant_id: Option<Uuid>,
) -> Option<&VariantAggregate> {
    match action {
        ResolutionAction::Skip => variants
            .iter()
            .find(|v| v.existing_count > 0)
            .or_else(|| variants.first()),
        ResolutionAction::Overwrite => chosen_variant_id
            .and_then(|id| variants.iter().find(|v| v.variant_id == id))
            .or_else(|| variants.iter().find(|v| v.new_count > 0))
            .or_else(|| variants.first()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Status implied by the number of anomalies still pending for a task.
    pub fn from_pending(pending: u64) -> Self {
        if pending == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::Processing
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounters {
    pub records: i64,
    pub skipped: i64,
    pub imported: i64,
    pub duplicates: i64,
    pub conflicts: i64,
    pub anomalies_total: i64,
    pub anomalies_processed: i64,
    pub skip_count: i64,
    pub overwrite_count: i64,
    pub auto_resolved: i64,
    pub manual_resolved: i64,
}

/// One physical file within an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTask {
    pub task_id: Uuid,
    pub batch_id: Uuid,
    pub file_name: String,
    pub status: TaskStatus,
    pub counters: TaskCounters,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub progress_last_at: Option<DateTime<Utc>>,
}

impl ImportTask {
    pub fn new(batch_id: Uuid, file_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            batch_id,
            file_name: file_name.to_string(),
            status: TaskStatus::Pending,
            counters: TaskCounters::default(),
            error: None,
            created_at: now,
            progress_last_at: None,
        }
    }
}

/// Manual resolutions applied to one task in a single resolve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionTally {
    pub task_id: Uuid,
    pub action: ResolutionAction,
    pub resolved: i64,
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Source of "now" for expiry decisions, injectable for tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dec(s: &str) -> Decimal {
        s.parse::<Decimal>().unwrap()
    }

    fn variant(new_count: u32, existing_count: u32) -> VariantAggregate {
        let mut source_summaries = Vec::new();
        if new_count > 0 {
            source_summaries.push(SourceSummary {
                label: "upload.xlsx".into(),
                count: new_count,
                kind: SourceKind::New,
            });
        }
        if existing_count > 0 {
            source_summaries.push(SourceSummary {
                label: EXISTING_SOURCE_LABEL.into(),
                count: existing_count,
                kind: SourceKind::Existing,
            });
        }
        VariantAggregate {
            variant_id: Uuid::new_v4(),
            temperature: Some(dec("22.00")),
            humidity: Some(dec("50.00")),
            total_count: new_count + existing_count,
            new_count,
            existing_count,
            source_summaries,
        }
    }

    #[test]
    fn area_codes_collapse_whitespace_and_uppercase() {
        assert_eq!(normalize_area_code(" cold room  2 "), "COLD_ROOM_2");
        assert_eq!(normalize_area_code("Cold Room 2"), "COLD_ROOM_2");
        assert_eq!(normalize_area_code("lab"), "LAB");
    }

    #[test]
    fn source_labels_keep_last_segment() {
        assert_eq!(source_label("/uploads/2026/march.xlsx"), "march.xlsx");
        assert_eq!(source_label("C:\\data\\april.xls"), "april.xls");
        assert_eq!(
            source_label("https://files.example.com/batches/may.csv?sig=abc#top"),
            "may.csv"
        );
        assert_eq!(source_label("plain.xlsx"), "plain.xlsx");
        assert_eq!(source_label("https://files.example.com/dir/"), "dir");
        assert_eq!(source_label("   "), UNKNOWN_SOURCE_LABEL);
    }

    #[test]
    fn parsed_readings_round_to_two_places() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let reading = ParsedReading::parsed("Lab", ts, Some(dec("21.456")), None, "a.xlsx");
        assert_eq!(reading.temperature, Some(dec("21.46")));
        assert_eq!(reading.humidity, None);
        assert!(reading.has_values());
        assert!(!reading.is_existing);
        assert!(ParsedReading::existing("Lab", ts, None, None, "db").is_existing);
    }

    #[test]
    fn skip_prefers_variant_backed_by_existing_rows() {
        let variants = vec![variant(2, 0), variant(1, 1)];
        let picked = select_variant(&variants, ResolutionAction::Skip, None).unwrap();
        assert_eq!(picked.variant_id, variants[1].variant_id);

        let only_new = vec![variant(1, 0), variant(3, 0)];
        let picked = select_variant(&only_new, ResolutionAction::Skip, None).unwrap();
        assert_eq!(picked.variant_id, only_new[0].variant_id);
    }

    #[test]
    fn overwrite_prefers_chosen_then_new_then_first() {
        let variants = vec![variant(0, 1), variant(2, 0), variant(1, 0)];
        let chosen = variants[2].variant_id;
        assert_eq!(
            select_variant(&variants, ResolutionAction::Overwrite, Some(chosen))
                .unwrap()
                .variant_id,
            chosen
        );
        assert_eq!(
            select_variant(&variants, ResolutionAction::Overwrite, None)
                .unwrap()
                .variant_id,
            variants[1].variant_id
        );
        let existing_only = vec![variant(0, 1)];
        assert_eq!(
            select_variant(&existing_only, ResolutionAction::Overwrite, None)
                .unwrap()
                .variant_id,
            existing_only[0].variant_id
        );
        assert!(select_variant(&[], ResolutionAction::Overwrite, None).is_none());
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let anomaly = Anomaly {
            anomaly_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            area_name: "Lab".into(),
            timestamp: created,
            kind: AnomalyKind::Duplicate,
            variants: vec![variant(1, 1)],
            created_at: created,
            expires_at: Some(created + Duration::hours(24)),
        };
        assert!(!anomaly.is_expired(created + Duration::hours(23)));
        assert!(anomaly.is_expired(created + Duration::hours(24)));
        assert_eq!(anomaly.new_record_count(), 1);
    }

    #[test]
    fn wire_names_match_external_shape() {
        let json = serde_json::to_value(variant(1, 1)).unwrap();
        assert!(json.get("variantId").is_some());
        assert!(json.get("totalCount").is_some());
        assert_eq!(json["sourceSummaries"][0]["type"], "new");
        assert_eq!("Overwrite".parse::<ResolutionAction>(), Ok(ResolutionAction::Overwrite));
        assert!("merge".parse::<AnomalyKind>().is_err());
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }
}
