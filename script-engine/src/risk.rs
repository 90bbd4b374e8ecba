//! Residual breakage risk for a conflict unit.
//!
//! The score is additive over a fixed set of factors and capped at 100. The
//! per-extra-contributor increment equals the unresolved-reference cap, so a
//! new contributor can resolve at most as much as it adds and the score never
//! drops when a contributor joins.

use serde::{Deserialize, Serialize};

use crate::policy::{MergePolicy, PolicyDecision};

pub const MAX_RISK: u32 = 100;
pub const EXTRA_CONTRIBUTOR_POINTS: u32 = 15;
pub const UNCONFIDENT_POLICY_POINTS: u32 = 15;
pub const BASE_OVERWRITTEN_POINTS: u32 = 20;
pub const UNRESOLVED_REFERENCE_POINTS: u32 = 5;
pub const UNRESOLVED_REFERENCE_CAP: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    CategoryBase,
    ExtraContributors,
    UnconfidentPolicy,
    BaseOverwritten,
    UnresolvedReferences,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskComponent {
    pub factor: RiskFactor,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScore {
    pub total: u32,
    pub breakdown: Vec<RiskComponent>,
}

/// Facts about one conflict unit that feed the score.
#[derive(Debug, Clone, Copy)]
pub struct RiskInput {
    pub decision: PolicyDecision,
    pub contributors: usize,
    /// A base-game contribution exists and something later won over it.
    pub base_overwritten: bool,
    pub unresolved_references: usize,
}

pub fn score(input: &RiskInput) -> RiskScore {
    let mut breakdown = vec![RiskComponent {
        factor: RiskFactor::CategoryBase,
        points: input.decision.base_risk,
    }];
    let mut add = |factor, points: u32| {
        if points > 0 {
            breakdown.push(RiskComponent { factor, points });
        }
    };

    let extra = input.contributors.saturating_sub(2) as u32;
    add(
        RiskFactor::ExtraContributors,
        extra.saturating_mul(EXTRA_CONTRIBUTOR_POINTS),
    );
    if !input.decision.confident {
        add(RiskFactor::UnconfidentPolicy, UNCONFIDENT_POLICY_POINTS);
    }
    if input.base_overwritten && input.decision.policy != MergePolicy::Fios {
        add(RiskFactor::BaseOverwritten, BASE_OVERWRITTEN_POINTS);
    }
    let unresolved = (input.unresolved_references as u32)
        .saturating_mul(UNRESOLVED_REFERENCE_POINTS)
        .min(UNRESOLVED_REFERENCE_CAP);
    add(RiskFactor::UnresolvedReferences, unresolved);

    let total = breakdown
        .iter()
        .fold(0u32, |acc, c| acc.saturating_add(c.points))
        .min(MAX_RISK);
    RiskScore { total, breakdown }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(policy: MergePolicy, confident: bool) -> PolicyDecision {
        PolicyDecision {
            policy,
            confident,
            base_risk: policy.default_base_risk(),
        }
    }

    #[test]
    fn test_two_way_override() {
        let s = score(&RiskInput {
            decision: decision(MergePolicy::Override, true),
            contributors: 2,
            base_overwritten: true,
            unresolved_references: 0,
        });
        assert_eq!(s.total, 40);
        assert_eq!(s.breakdown.len(), 2);
        assert_eq!(s.breakdown[1].factor, RiskFactor::BaseOverwritten);
    }

    #[test]
    fn test_all_factors_capped() {
        let s = score(&RiskInput {
            decision: decision(MergePolicy::Override, false),
            contributors: 6,
            base_overwritten: true,
            unresolved_references: 10,
        });
        // 20 + 60 + 15 + 20 + 15
        assert_eq!(s.total, 100);
        let unresolved = s
            .breakdown
            .iter()
            .find(|c| c.factor == RiskFactor::UnresolvedReferences)
            .unwrap();
        assert_eq!(unresolved.points, 15);
    }

    #[test]
    fn test_fios_ignores_base_overwrite() {
        let s = score(&RiskInput {
            decision: decision(MergePolicy::Fios, true),
            contributors: 2,
            base_overwritten: true,
            unresolved_references: 1,
        });
        assert_eq!(s.total, 30);
    }

    #[test]
    fn test_extra_contributor_outweighs_resolved_references() {
        let two = score(&RiskInput {
            decision: decision(MergePolicy::ContainerMerge, true),
            contributors: 2,
            base_overwritten: false,
            unresolved_references: 3,
        });
        let three = score(&RiskInput {
            decision: decision(MergePolicy::ContainerMerge, true),
            contributors: 3,
            base_overwritten: false,
            unresolved_references: 0,
        });
        assert!(three.total >= two.total);
    }
}
