//! Playbook-weighted re-ranking: classify each opportunity into a lane and
//! bias its score by the lane multiplier.
//!
//! Lane source preference: the enriched playbook when it has any entry,
//! otherwise the regime's suggested playbook (primary + avoid only). With no
//! playbook at all, every opportunity is neutral and unpenalized.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::opportunity::{canonical_strategy, Opportunity};
use crate::orchestrator::desc_nulls_last;
use crate::snapshot::{PlaybookReport, RegimeReport};

const AVOID_MULTIPLIER: f64 = 0.60;
const NEUTRAL_WITH_PLAYBOOK_MULTIPLIER: f64 = 0.85;

/// Scores within one rounding step of each other are treated as tied.
pub const TIE_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Primary,
    Secondary,
    Neutral,
    Avoid,
}

impl Lane {
    /// Tie-break priority: primary wins ties, avoid loses them.
    fn priority(self) -> u8 {
        match self {
            Lane::Primary => 0,
            Lane::Secondary => 1,
            Lane::Neutral => 2,
            Lane::Avoid => 3,
        }
    }
}

/// Ranking annotation attached to a copy of each opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneAdjustment {
    pub base_score: f64,
    pub adjusted_score: f64,
    pub multiplier: f64,
    pub lane: Lane,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedOpportunity {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    #[serde(rename = "_pb")]
    pub pb: LaneAdjustment,
}

/// Canonicalized lane sets resolved from whichever playbook source applies.
struct LaneSets {
    primary: HashSet<String>,
    secondary: HashSet<String>,
    avoid: HashSet<String>,
    source: Option<&'static str>,
}

impl LaneSets {
    fn resolve(playbook: Option<&PlaybookReport>, regime: Option<&RegimeReport>) -> Self {
        if let Some(pb) = playbook {
            if pb.playbook.is_populated() {
                return Self {
                    primary: canon_set(pb.playbook.primary.iter().map(|e| e.strategy.as_str())),
                    secondary: canon_set(
                        pb.playbook.secondary.iter().map(|e| e.strategy.as_str()),
                    ),
                    avoid: canon_set(pb.playbook.avoid.iter().map(|e| e.strategy.as_str())),
                    source: Some("playbook"),
                };
            }
        }
        if let Some(r) = regime {
            let sp = &r.suggested_playbook;
            if !sp.primary.is_empty() || !sp.avoid.is_empty() {
                return Self {
                    primary: canon_set(sp.primary.iter().map(String::as_str)),
                    secondary: HashSet::new(),
                    avoid: canon_set(sp.avoid.iter().map(String::as_str)),
                    source: Some("regime"),
                };
            }
        }
        Self {
            primary: HashSet::new(),
            secondary: HashSet::new(),
            avoid: HashSet::new(),
            source: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty() && self.avoid.is_empty()
    }

    /// Avoid dominates; then primary, secondary, neutral.
    fn classify(&self, strategy: &str) -> Lane {
        let canon = canonical_strategy(strategy);
        if self.avoid.contains(&canon) {
            Lane::Avoid
        } else if self.primary.contains(&canon) {
            Lane::Primary
        } else if self.secondary.contains(&canon) {
            Lane::Secondary
        } else {
            Lane::Neutral
        }
    }
}

fn canon_set<'a>(tags: impl Iterator<Item = &'a str>) -> HashSet<String> {
    tags.map(canonical_strategy).collect()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Re-rank opportunities by playbook lane. Inputs are never mutated; each
/// output is a copy annotated with the applied adjustment.
pub fn rank(
    opportunities: &[Opportunity],
    playbook: Option<&PlaybookReport>,
    regime: Option<&RegimeReport>,
) -> Vec<RankedOpportunity> {
    let lanes = LaneSets::resolve(playbook, regime);
    let has_playbook = !lanes.is_empty();

    let mut ranked: Vec<RankedOpportunity> = opportunities
        .iter()
        .map(|opp| {
            let lane = lanes.classify(&opp.strategy);
            let mut reasons = Vec::new();
            let multiplier = match lane {
                Lane::Avoid => {
                    reasons.push(format!("{} is in the avoid lane", opp.strategy));
                    AVOID_MULTIPLIER
                }
                Lane::Primary => {
                    reasons.push(format!("{} is a primary strategy", opp.strategy));
                    1.0
                }
                Lane::Secondary => {
                    reasons.push(format!("{} is a secondary strategy", opp.strategy));
                    1.0
                }
                Lane::Neutral if has_playbook => {
                    reasons.push("not in any playbook lane".to_string());
                    NEUTRAL_WITH_PLAYBOOK_MULTIPLIER
                }
                Lane::Neutral => {
                    reasons.push("no playbook loaded; score unchanged".to_string());
                    1.0
                }
            };
            if let Some(source) = lanes.source {
                reasons.push(format!("lane source: {source}"));
            }
            let adjusted_score = round1((opp.score * multiplier).clamp(0.0, 100.0));
            RankedOpportunity {
                opportunity: opp.clone(),
                pb: LaneAdjustment {
                    base_score: opp.score,
                    adjusted_score,
                    multiplier,
                    lane,
                    reasons,
                },
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        // Quantized to one decimal, so an epsilon-sized gap is a tie.
        let ka = (a.pb.adjusted_score * 10.0).round() as i64;
        let kb = (b.pb.adjusted_score * 10.0).round() as i64;
        kb.cmp(&ka)
            .then_with(|| a.pb.lane.priority().cmp(&b.pb.lane.priority()))
            .then_with(|| {
                b.pb.base_score
                    .partial_cmp(&a.pb.base_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                desc_nulls_last(
                    a.opportunity.key_metrics.liquidity,
                    b.opportunity.key_metrics.liquidity,
                )
            })
            .then_with(|| desc_nulls_last(a.opportunity.ror, b.opportunity.ror))
    });

    ranked
}
