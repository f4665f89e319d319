//! Grouping of parsed and stored readings into auto-merged records and anomalies.

use std::collections::{BTreeMap, HashMap};

use hygrolog_core::{
    source_label, AnomalyKind, AnomalyRecord, ParsedReading, ReadingKey, SourceKind,
    SourceSummary, VariantAggregate, EXISTING_SOURCE_LABEL,
};
use hygrolog_storage::SensorUpsert;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Entries of one (area, timestamp) group that agree on both values.
#[derive(Debug, Clone)]
pub struct VariantBucket<'a> {
    pub variant_id: Uuid,
    pub temperature: Option<Decimal>,
    pub humidity: Option<Decimal>,
    pub entries: Vec<&'a ParsedReading>,
}

/// Splits a group into value buckets in first-seen order.
///
/// A missing value only matches another missing value, never a number.
pub fn bucket_variants<'a>(entries: &[&'a ParsedReading]) -> Vec<VariantBucket<'a>> {
    let mut buckets: Vec<VariantBucket<'a>> = Vec::new();
    let mut index: HashMap<(Option<Decimal>, Option<Decimal>), usize> = HashMap::new();
    for entry in entries {
        let values = (entry.temperature, entry.humidity);
        let slot = *index.entry(values).or_insert_with(|| {
            buckets.push(VariantBucket {
                variant_id: Uuid::new_v4(),
                temperature: entry.temperature,
                humidity: entry.humidity,
                entries: Vec::new(),
            });
            buckets.len() - 1
        });
        buckets[slot].entries.push(entry);
    }
    buckets
}

fn summary_label(entry: &ParsedReading) -> (SourceKind, String) {
    if entry.is_existing {
        (SourceKind::Existing, EXISTING_SOURCE_LABEL.to_string())
    } else {
        (SourceKind::New, source_label(&entry.file_source))
    }
}

pub fn build_aggregate(bucket: &VariantBucket<'_>) -> VariantAggregate {
    let mut source_summaries: Vec<SourceSummary> = Vec::new();
    for entry in &bucket.entries {
        let (kind, label) = summary_label(entry);
        match source_summaries
            .iter_mut()
            .find(|s| s.kind == kind && s.label == label)
        {
            Some(summary) => summary.count += 1,
            None => source_summaries.push(SourceSummary {
                label,
                count: 1,
                kind,
            }),
        }
    }
    let total_count = bucket.entries.len() as u32;
    let new_count = bucket.entries.iter().filter(|e| !e.is_existing).count() as u32;
    VariantAggregate {
        variant_id: bucket.variant_id,
        temperature: bucket.temperature,
        humidity: bucket.humidity,
        total_count,
        new_count,
        existing_count: total_count - new_count,
        source_summaries,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Groups whose new rows agreed and had nothing stored yet, ready to upsert.
    pub resolved: Vec<SensorUpsert>,
    pub anomalies: Vec<AnomalyRecord>,
    pub duplicate_count: u64,
    pub conflict_count: u64,
}

/// Classifies every (area, timestamp) group touched by `parsed`.
///
/// `existing` should hold stored readings for exactly the keys in `parsed`; stored groups with
/// no new rows are ignored.
pub fn reconcile(parsed: &[ParsedReading], existing: &[ParsedReading]) -> ReconcileOutcome {
    let mut groups: BTreeMap<ReadingKey, Vec<&ParsedReading>> = BTreeMap::new();
    for entry in existing.iter().chain(parsed.iter()) {
        groups.entry(entry.key()).or_default().push(entry);
    }

    let mut outcome = ReconcileOutcome::default();
    for (key, entries) in groups {
        let new_entries = entries.iter().filter(|e| !e.is_existing).collect::<Vec<_>>();
        let Some(first_new) = new_entries.first() else {
            continue;
        };
        let has_existing = new_entries.len() < entries.len();
        let buckets = bucket_variants(&entries);

        if buckets.len() == 1 && !has_existing {
            outcome.duplicate_count += (new_entries.len() as u64).saturating_sub(1);
            outcome.resolved.push(SensorUpsert {
                area_code: key.area_code,
                area_name: first_new.area_name.clone(),
                timestamp: key.timestamp,
                temperature: first_new.temperature,
                humidity: first_new.humidity,
                file_source: joined_labels(new_entries.iter().map(|e| e.file_source.as_str())),
            });
            continue;
        }

        let kind = if buckets.len() == 1 {
            outcome.duplicate_count += new_entries.len() as u64;
            AnomalyKind::Duplicate
        } else {
            outcome.conflict_count += 1;
            AnomalyKind::Conflict
        };
        outcome.anomalies.push(AnomalyRecord {
            anomaly_id: Uuid::new_v4(),
            area_name: first_new.area_name.clone(),
            timestamp: key.timestamp,
            kind,
            variants: buckets.iter().map(build_aggregate).collect(),
        });
    }
    outcome
}

/// De-duplicated source labels in first-seen order, joined for the `file_source` column.
pub fn joined_labels<'a>(sources: impl IntoIterator<Item = &'a str>) -> String {
    let mut labels: Vec<String> = Vec::new();
    for source in sources {
        let label = source_label(source);
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    fn dec(s: &str) -> Option<Decimal> {
        Some(s.parse().unwrap())
    }

    fn new_row(temp: Option<Decimal>, hum: Option<Decimal>, source: &str) -> ParsedReading {
        ParsedReading::parsed("Cold Room", ts(), temp, hum, source)
    }

    fn stored_row(temp: Option<Decimal>, hum: Option<Decimal>) -> ParsedReading {
        ParsedReading::existing("Cold Room", ts(), temp, hum, "earlier.xlsx")
    }

    #[test]
    fn missing_values_form_their_own_bucket() {
        let rows = [
            new_row(dec("22.00"), None, "a.xlsx"),
            new_row(dec("22.00"), dec("0.00"), "a.xlsx"),
            new_row(dec("22.00"), None, "b.xlsx"),
        ];
        let refs = rows.iter().collect::<Vec<_>>();
        let buckets = bucket_variants(&refs);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].entries.len(), 2);
        assert_eq!(buckets[0].humidity, None);
        assert_ne!(buckets[0].variant_id, buckets[1].variant_id);
    }

    #[test]
    fn aggregate_counts_line_up_with_summaries() {
        let rows = [
            stored_row(dec("22.00"), dec("50.00")),
            new_row(dec("22.00"), dec("50.00"), "/uploads/a.xlsx"),
            new_row(dec("22.00"), dec("50.00"), "/other/a.xlsx"),
            new_row(dec("22.00"), dec("50.00"), "https://host/b.xlsx?x=1"),
        ];
        let refs = rows.iter().collect::<Vec<_>>();
        let buckets = bucket_variants(&refs);
        let aggregate = build_aggregate(&buckets[0]);

        assert_eq!(aggregate.total_count, 4);
        assert_eq!(aggregate.new_count, 3);
        assert_eq!(aggregate.existing_count, 1);
        assert!(aggregate.counts_consistent());
        let labels = aggregate
            .source_summaries
            .iter()
            .map(|s| (s.label.as_str(), s.count, s.kind))
            .collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                (EXISTING_SOURCE_LABEL, 1, SourceKind::Existing),
                ("a.xlsx", 2, SourceKind::New),
                ("b.xlsx", 1, SourceKind::New),
            ]
        );
    }

    #[test]
    fn agreeing_new_rows_auto_merge() {
        let parsed = vec![
            new_row(dec("22.0"), dec("50.0"), "/in/a.xlsx"),
            new_row(dec("22.0"), dec("50.0"), "/in/b.xlsx"),
        ];
        let outcome = reconcile(&parsed, &[]);

        assert_eq!(outcome.resolved.len(), 1);
        assert!(outcome.anomalies.is_empty());
        assert_eq!(outcome.duplicate_count, 1);
        let record = &outcome.resolved[0];
        assert_eq!(record.area_code, "COLD_ROOM");
        assert_eq!(record.temperature, dec("22.00"));
        assert_eq!(record.file_source, "a.xlsx, b.xlsx");
    }

    #[test]
    fn agreement_with_stored_value_is_a_duplicate() {
        let parsed = vec![new_row(dec("22.0"), dec("50.0"), "a.xlsx")];
        let existing = vec![stored_row(dec("22.0"), dec("50.0"))];
        let outcome = reconcile(&parsed, &existing);

        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.duplicate_count, 1);
        let anomaly = &outcome.anomalies[0];
        assert_eq!(anomaly.kind, AnomalyKind::Duplicate);
        assert_eq!(anomaly.variants.len(), 1);
        assert_eq!(anomaly.variants[0].total_count, 2);
        assert_eq!(anomaly.variants[0].new_count, 1);
        assert_eq!(anomaly.variants[0].existing_count, 1);
    }

    #[test]
    fn disagreeing_new_rows_are_a_conflict() {
        let parsed = vec![
            new_row(dec("22.0"), dec("50.0"), "a.xlsx"),
            new_row(dec("21.5"), dec("49.0"), "a.xlsx"),
        ];
        let outcome = reconcile(&parsed, &[]);

        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.conflict_count, 1);
        assert_eq!(outcome.anomalies.len(), 1);
        let anomaly = &outcome.anomalies[0];
        assert_eq!(anomaly.kind, AnomalyKind::Conflict);
        assert_eq!(anomaly.variants.len(), 2);
        assert!(anomaly.variants.iter().all(|v| v.total_count == 1));
        assert!(anomaly.variants.iter().all(|v| v.counts_consistent()));
    }

    #[test]
    fn disagreement_with_stored_value_is_a_conflict_with_existing_first() {
        let parsed = vec![new_row(dec("23.0"), None, "a.xlsx")];
        let existing = vec![stored_row(dec("22.0"), None)];
        let outcome = reconcile(&parsed, &existing);

        let anomaly = &outcome.anomalies[0];
        assert_eq!(anomaly.kind, AnomalyKind::Conflict);
        assert_eq!(anomaly.variants[0].existing_count, 1);
        assert_eq!(anomaly.variants[1].new_count, 1);
        assert_eq!(outcome.duplicate_count, 0);
    }

    #[test]
    fn stored_only_groups_never_surface() {
        let other_time = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let existing = vec![
            stored_row(dec("22.0"), dec("50.0")),
            ParsedReading::existing("Cold Room", other_time, dec("1.0"), None, "x"),
        ];
        let parsed = vec![new_row(dec("22.0"), dec("50.0"), "a.xlsx")];
        let outcome = reconcile(&parsed, &existing);
        assert_eq!(outcome.anomalies.len(), 1);
        assert!(outcome.resolved.is_empty());

        let outcome = reconcile(&[], &existing);
        assert!(outcome.anomalies.is_empty());
        assert!(outcome.resolved.is_empty());
    }

    #[test]
    fn one_anomaly_per_group_not_per_row() {
        let parsed = vec![
            new_row(dec("22.0"), dec("50.0"), "a.xlsx"),
            new_row(dec("21.0"), dec("50.0"), "a.xlsx"),
            new_row(dec("20.0"), dec("50.0"), "b.xlsx"),
            new_row(dec("21.0"), dec("50.0"), "b.xlsx"),
        ];
        let outcome = reconcile(&parsed, &[]);
        assert_eq!(outcome.anomalies.len(), 1);
        assert_eq!(outcome.anomalies[0].variants.len(), 3);
    }
}
