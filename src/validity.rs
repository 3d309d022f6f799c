//! Separates entities that actually reported something from silent ones.
//!
//! A value is "real" unless it is null, zero, `false`, an empty or
//! placeholder string, or a container with nothing real inside.

use ahash::AHashSet;

use crate::types::{FieldValue, InvalidReason, MetricBundle, ValidityVerdict};

/// Strings upstream uses for "no value", compared case-insensitively
const PLACEHOLDER_STRINGS: [&str; 5] = ["n/a", "null", "none", "-", "unknown"];

#[derive(Debug, Clone)]
pub struct DataValidityFilter {
    placeholders: AHashSet<String>,
}

impl Default for DataValidityFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl DataValidityFilter {
    pub fn new() -> Self {
        Self {
            placeholders: PLACEHOLDER_STRINGS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn has_real_data(&self, bundle: &MetricBundle) -> ValidityVerdict {
        if bundle.metric_count() == 0 {
            return ValidityVerdict::no_data(InvalidReason::NoMetricsCollected);
        }
        if bundle.point_count() == 0 {
            return ValidityVerdict::no_data(InvalidReason::AllWindowsEmpty);
        }

        let any_real = bundle
            .windows()
            .flat_map(|(_, metrics)| metrics.values())
            .flatten()
            .flat_map(|point| point.values())
            .any(|value| self.is_real_value(value));

        if any_real {
            ValidityVerdict::real()
        } else {
            ValidityVerdict::no_data(InvalidReason::AllValuesPlaceholder)
        }
    }

    pub fn is_real_value(&self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Null => false,
            FieldValue::Bool(b) => *b,
            FieldValue::Number(n) => *n != 0.0 && !n.is_nan(),
            FieldValue::Text(s) => {
                let trimmed = s.trim();
                !trimmed.is_empty() && !self.placeholders.contains(&trimmed.to_lowercase())
            }
            FieldValue::List(items) => items.iter().any(|item| self.is_real_value(item)),
            FieldValue::Map(map) => map.values().any(|item| self.is_real_value(item)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{data_point_from_json, DataPoint, ObservationWindow};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn bundle_of(rows: Vec<serde_json::Value>) -> MetricBundle {
        let mut bundle = MetricBundle::new();
        bundle.insert(
            ObservationWindow::Last24Hours,
            "apdex",
            rows.into_iter().map(data_point_from_json).collect(),
        );
        bundle
    }

    #[rstest]
    #[case(FieldValue::Null, false)]
    #[case(FieldValue::Number(0.0), false)]
    #[case(FieldValue::Number(-0.0), false)]
    #[case(FieldValue::Number(f64::NAN), false)]
    #[case(FieldValue::Number(0.01), true)]
    #[case(FieldValue::Bool(false), false)]
    #[case(FieldValue::Bool(true), true)]
    #[case(FieldValue::Text("".into()), false)]
    #[case(FieldValue::Text("  ".into()), false)]
    #[case(FieldValue::Text("N/A".into()), false)]
    #[case(FieldValue::Text("Unknown".into()), false)]
    #[case(FieldValue::Text("-".into()), false)]
    #[case(FieldValue::Text("checkout-api".into()), true)]
    #[case(FieldValue::List(vec![]), false)]
    #[case(FieldValue::List(vec![FieldValue::Null, FieldValue::Text("none".into())]), false)]
    #[case(FieldValue::List(vec![FieldValue::Null, FieldValue::Number(3.0)]), true)]
    #[case(FieldValue::Map(BTreeMap::new()), false)]
    fn test_value_classification(#[case] value: FieldValue, #[case] real: bool) {
        assert_eq!(DataValidityFilter::new().is_real_value(&value), real);
    }

    #[test]
    fn test_all_null_bundle_is_invalid() {
        let filter = DataValidityFilter::new();
        let bundle = bundle_of(vec![json!({ "score": null, "name": null }), json!({ "score": 0 })]);
        assert_eq!(
            filter.has_real_data(&bundle),
            ValidityVerdict::no_data(InvalidReason::AllValuesPlaceholder)
        );
    }

    #[test]
    fn test_single_real_value_makes_bundle_valid() {
        let filter = DataValidityFilter::new();
        let mut bundle = bundle_of(vec![json!({ "score": null })]);
        let mut point = DataPoint::new();
        point.insert("cpuPercent".into(), FieldValue::Number(12.0));
        bundle.insert(ObservationWindow::Last7Days, "cpu", vec![point]);

        assert_eq!(filter.has_real_data(&bundle), ValidityVerdict::real());
    }

    #[test]
    fn test_empty_bundles_carry_reason() {
        let filter = DataValidityFilter::new();

        let mut failed_everywhere = MetricBundle::new();
        failed_everywhere.ensure_window(ObservationWindow::Last30Minutes);
        assert_eq!(
            filter.has_real_data(&failed_everywhere).reason,
            Some(InvalidReason::NoMetricsCollected)
        );

        let no_rows = bundle_of(Vec::new());
        assert_eq!(filter.has_real_data(&no_rows).reason, Some(InvalidReason::AllWindowsEmpty));
    }
}
