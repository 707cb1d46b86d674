//! Per-ad bid and pause policy.
//!
//! [`decide`] is a pure function of the current cycle's stats: it raises the
//! cpm of ads that listen cheaper than the target, lowers it for ads slightly
//! above target, pauses ads at or above the stop cost and resumes approved
//! paused ads that were not marked to stop.

use std::collections::{BTreeMap, BTreeSet};

use crate::constants::{CPM_LOWER_CEILING, CPM_RAISE_CEILING, CPM_STEP, STOP_COST_MULTIPLIER};
use crate::models::{AdStat, AdState, ApprovalStatus, RunStatus};

/// Business constants of the policy. Defaults are the values the cabinet
/// has always been run with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpm_raise_ceiling: f64,
    pub cpm_lower_ceiling: f64,
    pub cpm_step: f64,
    pub stop_cost_multiplier: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpm_raise_ceiling: CPM_RAISE_CEILING,
            cpm_lower_ceiling: CPM_LOWER_CEILING,
            cpm_step: CPM_STEP,
            stop_cost_multiplier: STOP_COST_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decisions {
    pub start: BTreeSet<i64>,
    pub stop: BTreeSet<i64>,
    pub cpm_updates: BTreeMap<i64, f64>,
}

impl Decisions {
    /// Stop every listed ad, nothing else.
    pub fn stop_all(ad_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            stop: ad_ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty() && self.cpm_updates.is_empty()
    }
}

pub fn decide(
    stats: &BTreeMap<i64, AdStat>,
    statuses: Option<&BTreeMap<i64, AdState>>,
    target_cost: f64,
    speed_coef: Option<f64>,
    thresholds: &Thresholds,
) -> Decisions {
    let mut target_cost = target_cost;
    let mut stop_cost = target_cost * thresholds.stop_cost_multiplier;
    // A zero or negative coefficient means none.
    if let Some(coef) = speed_coef.filter(|coef| *coef > 0.0) {
        target_cost *= coef;
        stop_cost *= coef;
    }

    let mut decisions = Decisions::default();

    for (&ad_id, stat) in stats {
        let Some(current_cost) = stat.cost_per_listen() else {
            continue;
        };

        if current_cost <= target_cost && stat.cpm <= thresholds.cpm_raise_ceiling {
            decisions
                .cpm_updates
                .insert(ad_id, stat.cpm + thresholds.cpm_step);
        } else if target_cost < current_cost
            && current_cost < stop_cost
            && stat.cpm <= thresholds.cpm_lower_ceiling
        {
            decisions
                .cpm_updates
                .insert(ad_id, stat.cpm - thresholds.cpm_step);
        } else if current_cost >= stop_cost {
            decisions.stop.insert(ad_id);
        }
    }

    decisions.start = stats
        .keys()
        .copied()
        .filter(|ad_id| !decisions.stop.contains(ad_id))
        .filter(|ad_id| match statuses {
            None => true,
            Some(statuses) => statuses.get(ad_id).is_some_and(|state| {
                state.approved == ApprovalStatus::Approved && state.status == RunStatus::Stopped
            }),
        })
        .collect();

    decisions
}
