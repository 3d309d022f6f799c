// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// Entities, metric bundles and verdicts that flow from discovery to the
// published snapshot. All of them serialize into the durable snapshot file.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// Entity Domains
// ----------------------------------------------------------------------------

/// Domains the pipeline collects metrics for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityDomain {
    #[serde(rename = "APM")]
    Application,
    #[serde(rename = "BROWSER")]
    Browser,
    #[serde(rename = "INFRA")]
    Infrastructure,
    #[serde(rename = "DB")]
    Database,
    #[serde(rename = "MOBILE")]
    Mobile,
    #[serde(rename = "IOT")]
    Iot,
    #[serde(rename = "SERVERLESS")]
    Serverless,
    #[serde(rename = "SYNTH")]
    Synthetic,
    #[serde(rename = "EXT")]
    External,
}

impl EntityDomain {
    pub const ALL: [EntityDomain; 9] = [
        EntityDomain::Application,
        EntityDomain::Browser,
        EntityDomain::Infrastructure,
        EntityDomain::Database,
        EntityDomain::Mobile,
        EntityDomain::Iot,
        EntityDomain::Serverless,
        EntityDomain::Synthetic,
        EntityDomain::External,
    ];

    /// Upstream wire code
    pub fn code(&self) -> &'static str {
        match self {
            EntityDomain::Application => "APM",
            EntityDomain::Browser => "BROWSER",
            EntityDomain::Infrastructure => "INFRA",
            EntityDomain::Database => "DB",
            EntityDomain::Mobile => "MOBILE",
            EntityDomain::Iot => "IOT",
            EntityDomain::Serverless => "SERVERLESS",
            EntityDomain::Synthetic => "SYNTH",
            EntityDomain::External => "EXT",
        }
    }

    /// Parse an upstream wire code. Unsupported domains yield `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.code().eq_ignore_ascii_case(code))
    }
}

impl Display for EntityDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ----------------------------------------------------------------------------
// Entities
// ----------------------------------------------------------------------------

/// A monitored thing: application, host, database, browser app...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique id assigned upstream
    pub guid: String,
    pub name: String,
    pub domain: EntityDomain,
    /// Upstream subtype, e.g. APPLICATION or HOST
    #[serde(default)]
    pub entity_type: String,
    /// Whether upstream flags the entity as currently reporting
    #[serde(default)]
    pub reporting: bool,
    /// Tag key mapped to its ordered values
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Entity {
    pub fn new(guid: impl Into<String>, name: impl Into<String>, domain: EntityDomain) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            domain,
            entity_type: String::new(),
            reporting: false,
            tags: BTreeMap::new(),
        }
    }
}

// ----------------------------------------------------------------------------
// Observation Windows
// ----------------------------------------------------------------------------

/// Fixed look-back windows each metric is collected over
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObservationWindow {
    #[serde(rename = "30min")]
    Last30Minutes,
    #[serde(rename = "24h")]
    Last24Hours,
    #[serde(rename = "7d")]
    Last7Days,
    #[serde(rename = "30d")]
    Last30Days,
}

impl ObservationWindow {
    pub const ALL: [ObservationWindow; 4] = [
        ObservationWindow::Last30Minutes,
        ObservationWindow::Last24Hours,
        ObservationWindow::Last7Days,
        ObservationWindow::Last30Days,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ObservationWindow::Last30Minutes => "30min",
            ObservationWindow::Last24Hours => "24h",
            ObservationWindow::Last7Days => "7d",
            ObservationWindow::Last30Days => "30d",
        }
    }

    /// Time-range clause appended to every metric query
    pub fn since_clause(&self) -> &'static str {
        match self {
            ObservationWindow::Last30Minutes => "SINCE 30 MINUTES AGO",
            ObservationWindow::Last24Hours => "SINCE 24 HOURS AGO",
            ObservationWindow::Last7Days => "SINCE 7 DAYS AGO",
            ObservationWindow::Last30Days => "SINCE 30 DAYS AGO",
        }
    }
}

impl Display for ObservationWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ObservationWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|w| w.label() == s)
            .ok_or_else(|| format!("unknown observation window '{}'", s))
    }
}

// ----------------------------------------------------------------------------
// Field Values & Data Points
// ----------------------------------------------------------------------------

/// One field of a returned data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Null
    }
}

impl From<JsonValue> for FieldValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(b),
            JsonValue::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Null),
            JsonValue::String(s) => FieldValue::Text(s),
            JsonValue::Array(items) => FieldValue::List(items.into_iter().map(FieldValue::from).collect()),
            JsonValue::Object(map) => {
                FieldValue::Map(map.into_iter().map(|(k, v)| (k, FieldValue::from(v))).collect())
            }
        }
    }
}

/// A single returned row: field name to value
pub type DataPoint = BTreeMap<String, FieldValue>;

/// Convert a result row from the wire. Non-object rows land under `value`.
pub fn data_point_from_json(row: JsonValue) -> DataPoint {
    match row {
        JsonValue::Object(map) => map.into_iter().map(|(k, v)| (k, FieldValue::from(v))).collect(),
        other => {
            let mut point = DataPoint::new();
            point.insert("value".to_string(), FieldValue::from(other));
            point
        }
    }
}

// ----------------------------------------------------------------------------
// Metric Bundles
// ----------------------------------------------------------------------------

/// Window -> metric name -> data points. An empty list means the query
/// returned nothing; a metric missing from a window means the query failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricBundle {
    windows: BTreeMap<ObservationWindow, BTreeMap<String, Vec<DataPoint>>>,
}

impl MetricBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the rows returned for one metric in one window
    pub fn insert(&mut self, window: ObservationWindow, metric: impl Into<String>, points: Vec<DataPoint>) {
        self.windows.entry(window).or_default().insert(metric.into(), points);
    }

    /// Make sure a window is present even if every query in it failed
    pub fn ensure_window(&mut self, window: ObservationWindow) {
        self.windows.entry(window).or_default();
    }

    pub fn window(&self, window: ObservationWindow) -> Option<&BTreeMap<String, Vec<DataPoint>>> {
        self.windows.get(&window)
    }

    pub fn metric(&self, window: ObservationWindow, metric: &str) -> Option<&[DataPoint]> {
        self.windows.get(&window)?.get(metric).map(Vec::as_slice)
    }

    pub fn windows(&self) -> impl Iterator<Item = (&ObservationWindow, &BTreeMap<String, Vec<DataPoint>>)> {
        self.windows.iter()
    }

    /// No metric was recorded in any window
    pub fn is_empty(&self) -> bool {
        self.windows.values().all(BTreeMap::is_empty)
    }

    pub fn metric_count(&self) -> usize {
        self.windows.values().map(BTreeMap::len).sum()
    }

    pub fn point_count(&self) -> usize {
        self.windows
            .values()
            .flat_map(BTreeMap::values)
            .map(Vec::len)
            .sum()
    }
}

// ----------------------------------------------------------------------------
// Validity
// ----------------------------------------------------------------------------

/// Why an entity was judged to have no real data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// Every query for the entity failed
    NoMetricsCollected,
    /// Queries succeeded but returned no rows
    AllWindowsEmpty,
    /// Rows came back but only held null, zero or placeholder values
    AllValuesPlaceholder,
}

impl Display for InvalidReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::NoMetricsCollected => write!(f, "no metrics collected"),
            InvalidReason::AllWindowsEmpty => write!(f, "all windows empty"),
            InvalidReason::AllValuesPlaceholder => write!(f, "all values placeholder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityVerdict {
    pub has_real_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<InvalidReason>,
}

impl ValidityVerdict {
    pub fn real() -> Self {
        Self {
            has_real_data: true,
            reason: None,
        }
    }

    pub fn no_data(reason: InvalidReason) -> Self {
        Self {
            has_real_data: false,
            reason: Some(reason),
        }
    }
}

/// An entity with the bundle collected for it this cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: Entity,
    pub metrics: MetricBundle,
    pub verdict: ValidityVerdict,
}

// ----------------------------------------------------------------------------
// Circuit State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Upstream calls suspended until the cool-down elapses
    Open,
    /// Probing; a few successes close the circuit, any failure reopens it
    HalfOpen,
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_domain_codes() {
        assert_eq!(EntityDomain::from_code("APM"), Some(EntityDomain::Application));
        assert_eq!(EntityDomain::from_code("infra"), Some(EntityDomain::Infrastructure));
        assert_eq!(EntityDomain::from_code("VIZ"), None);
        assert_eq!(EntityDomain::from_code("AIOPS"), None);
        for domain in EntityDomain::ALL {
            assert_eq!(EntityDomain::from_code(domain.code()), Some(domain));
        }
    }

    #[test]
    fn test_window_labels() {
        assert_eq!("24h".parse::<ObservationWindow>(), Ok(ObservationWindow::Last24Hours));
        assert!("1h".parse::<ObservationWindow>().is_err());
        assert_eq!(ObservationWindow::Last7Days.since_clause(), "SINCE 7 DAYS AGO");
        assert_eq!(
            serde_json::to_string(&ObservationWindow::Last30Minutes).unwrap(),
            "\"30min\""
        );
    }

    #[test]
    fn test_field_value_from_json() {
        let point = data_point_from_json(json!({
            "score": 0.93,
            "name": "checkout",
            "ok": true,
            "missing": null,
            "tags": ["a", 1],
        }));
        assert_eq!(point["score"], FieldValue::Number(0.93));
        assert_eq!(point["name"], FieldValue::Text("checkout".into()));
        assert_eq!(point["ok"], FieldValue::Bool(true));
        assert_eq!(point["missing"], FieldValue::Null);
        assert_eq!(
            point["tags"],
            FieldValue::List(vec![FieldValue::Text("a".into()), FieldValue::Number(1.0)])
        );

        let scalar = data_point_from_json(json!(12));
        assert_eq!(scalar["value"], FieldValue::Number(12.0));
    }

    #[test]
    fn test_bundle_serializes_by_window() {
        let mut bundle = MetricBundle::new();
        assert!(bundle.is_empty());

        let mut point = DataPoint::new();
        point.insert("cpu".into(), FieldValue::Number(12.5));
        bundle.insert(ObservationWindow::Last24Hours, "cpu", vec![point]);
        bundle.insert(ObservationWindow::Last24Hours, "disk", Vec::new());
        bundle.ensure_window(ObservationWindow::Last7Days);

        assert!(!bundle.is_empty());
        assert_eq!(bundle.metric_count(), 2);
        assert_eq!(bundle.point_count(), 1);
        assert_eq!(bundle.metric(ObservationWindow::Last24Hours, "disk"), Some(&[][..]));

        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(
            json,
            json!({ "24h": { "cpu": [{ "cpu": 12.5 }], "disk": [] }, "7d": {} })
        );
        let back: MetricBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn test_circuit_state_wire_names() {
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"HALF_OPEN\"");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
    }
}
