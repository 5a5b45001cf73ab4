use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::playbook::RankedOpportunity;

/// Cap on accumulated refresh errors carried in `SnapshotMeta`.
pub const MAX_META_ERRORS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeLabel {
    RiskOn,
    RiskOff,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentScore {
    pub score: f64,
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeComponents {
    pub trend: ComponentScore,
    pub volatility: ComponentScore,
    pub breadth: ComponentScore,
    pub rates: ComponentScore,
    pub momentum: ComponentScore,
}

/// The regime endpoint's minimal playbook: primary + avoid lanes only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestedPlaybook {
    pub primary: Vec<String>,
    pub avoid: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeReport {
    pub regime_label: RegimeLabel,
    pub regime_score: f64,
    pub components: RegimeComponents,
    pub suggested_playbook: SuggestedPlaybook,
    #[serde(default)]
    pub source_health: HashMap<String, SourceStatus>,
}

/// One entry of an enriched playbook lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneEntry {
    pub strategy: String,
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub why: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaybookLanes {
    pub primary: Vec<LaneEntry>,
    pub secondary: Vec<LaneEntry>,
    pub avoid: Vec<LaneEntry>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl PlaybookLanes {
    /// True when at least one lane carries an entry.
    pub fn is_populated(&self) -> bool {
        !self.primary.is_empty() || !self.secondary.is_empty() || !self.avoid.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookReport {
    pub regime: Option<String>,
    pub playbook: PlaybookLanes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthColor {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub status: HealthColor,
    pub message: String,
    pub last_http: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Accept,
    Reject,
    Neutral,
    Error,
}

/// Result of a model-analysis inference call on one candidate trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEvaluation {
    pub recommendation: Recommendation,
    pub confidence: Option<f64>,
    pub summary: String,
    pub risk_level: Option<String>,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

/// All dashboard inputs for one instant.
///
/// `None` means the field has never been populated; a refresh that fails on a
/// field keeps the previous value and records the failure in `meta.errors`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotData {
    pub regime: Option<RegimeReport>,
    /// SPY / VIX / macro summaries, pass-through from the provider.
    pub market: Option<Value>,
    /// Playbook-ranked opportunity list from the latest scanner suite.
    pub opportunities: Vec<RankedOpportunity>,
    pub playbook: Option<PlaybookReport>,
    pub risk: Option<Value>,
    pub active_trades: Option<Value>,
    pub broker_orders: Option<Value>,
    pub broker_account: Option<Value>,
    pub signals: Option<Value>,
    pub sectors: Option<Value>,
    pub source_health: Option<HashMap<String, SourceStatus>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_success_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub partial: bool,
}

impl SnapshotMeta {
    /// Append a refresh error, dropping the oldest once the cap is reached.
    pub fn push_error(&mut self, err: String) {
        if self.errors.len() >= MAX_META_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(err);
    }
}

/// Immutable aggregate published by the home cache. Replaced atomically,
/// never patched in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: SnapshotData,
    pub meta: SnapshotMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_errors_capped() {
        let mut meta = SnapshotMeta::default();
        for i in 0..20 {
            meta.push_error(format!("e{i}"));
        }
        assert_eq!(meta.errors.len(), MAX_META_ERRORS);
        // Oldest entries dropped first
        assert_eq!(meta.errors[0], "e8");
        assert_eq!(meta.errors.last().unwrap(), "e19");
    }

    #[test]
    fn playbook_populated_checks_all_lanes() {
        let mut lanes = PlaybookLanes::default();
        assert!(!lanes.is_populated());
        lanes.avoid.push(LaneEntry {
            strategy: "iron_condor".into(),
            label: "Iron Condor".into(),
            confidence: 0.8,
            why: vec![],
        });
        assert!(lanes.is_populated());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snap = Snapshot {
            data: SnapshotData {
                regime: None,
                market: Some(serde_json::json!({"spy": {"price": 512.3}})),
                opportunities: vec![],
                playbook: None,
                risk: None,
                active_trades: None,
                broker_orders: None,
                broker_account: None,
                signals: None,
                sectors: None,
                source_health: None,
            },
            meta: SnapshotMeta {
                last_success_at: Some(Utc::now()),
                errors: vec!["regime: rate limited".into()],
                partial: true,
            },
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.meta.errors, snap.meta.errors);
        assert_eq!(back.meta.partial, snap.meta.partial);
        assert_eq!(back.meta.last_success_at, snap.meta.last_success_at);
        assert_eq!(
            back.data.market.as_ref().unwrap()["spy"]["price"],
            serde_json::json!(512.3)
        );
    }

    #[test]
    fn regime_label_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&RegimeLabel::RiskOn).unwrap(),
            "\"RISK_ON\""
        );
    }
}
