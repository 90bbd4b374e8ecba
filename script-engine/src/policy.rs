//! Category → merge policy assignment.
//!
//! Which policy the game applies to a folder is empirical knowledge, so the
//! table is data: an ordered list of glob rules over the category path,
//! first match wins. A category no rule covers falls back to OVERRIDE and is
//! reported as unconfident.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergePolicy {
    /// Last full definition wins.
    Override,
    /// Named sub-lists are concatenated across contributors.
    ContainerMerge,
    /// Each inner key resolves independently.
    PerKeyOverride,
    /// First-in-order wins; later definitions are ignored.
    Fios,
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePolicy::Override => "OVERRIDE",
            MergePolicy::ContainerMerge => "CONTAINER_MERGE",
            MergePolicy::PerKeyOverride => "PER_KEY_OVERRIDE",
            MergePolicy::Fios => "FIOS",
        }
    }

    /// Risk points a category starts with when its rule names none.
    pub fn default_base_risk(&self) -> u32 {
        match self {
            MergePolicy::Override => 20,
            MergePolicy::ContainerMerge => 10,
            MergePolicy::PerKeyOverride => 15,
            MergePolicy::Fios => 25,
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    pub policy: MergePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_risk: Option<u32>,
}

/// The on-disk policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub rules: Vec<PolicyRule>,
}

fn default_version() -> u32 {
    1
}

pub const POLICY_CONFIG_VERSION: u32 = 1;

impl Default for PolicyConfig {
    fn default() -> Self {
        let rule = |pattern: &str, policy, base_risk| PolicyRule {
            pattern: pattern.to_string(),
            policy,
            base_risk,
        };
        use MergePolicy::*;
        Self {
            version: POLICY_CONFIG_VERSION,
            rules: vec![
                rule("common/on_action", ContainerMerge, None),
                rule("common/defines", PerKeyOverride, None),
                rule("common/game_rules", PerKeyOverride, None),
                rule("gui", Fios, None),
                rule("gui/**", Fios, None),
                rule("common/scripted_guis", Fios, None),
                rule("localization/**", Override, Some(5)),
                rule("events", Override, None),
                rule("events/**", Override, None),
                rule("history/**", Override, Some(15)),
                rule("common/culture/**", Override, None),
                rule("common/religion/**", Override, None),
                rule("common/traits", Override, None),
                rule("common/decisions", Override, None),
                rule("common/character_interactions", Override, None),
                rule("common/scripted_effects", Override, None),
                rule("common/scripted_triggers", Override, None),
                rule("common/script_values", Override, None),
                rule("common/scripted_variables", Override, None),
                rule("common/modifiers", Override, None),
                rule("common/buildings", Override, None),
                rule("common/landed_titles", Override, Some(30)),
            ],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unsupported policy table version {0} (expected {POLICY_CONFIG_VERSION})")]
    UnsupportedVersion(u32),
    #[error("invalid category pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("invalid policy table JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a category lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub policy: MergePolicy,
    /// Whether a rule matched; a fallback decision is not.
    pub confident: bool,
    pub base_risk: u32,
}

/// A validated, compiled [`PolicyConfig`].
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: Vec<(Pattern, PolicyRule)>,
}

impl PolicyTable {
    pub fn compile(config: PolicyConfig) -> Result<Self, PolicyError> {
        if config.version != POLICY_CONFIG_VERSION {
            return Err(PolicyError::UnsupportedVersion(config.version));
        }
        let rules = config
            .rules
            .into_iter()
            .map(|rule| {
                Pattern::new(&rule.pattern)
                    .map(|p| (p, rule.clone()))
                    .map_err(|source| PolicyError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        Self::compile(serde_json::from_str(json)?)
    }

    pub fn lookup(&self, category: &str) -> PolicyDecision {
        let opts = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        for (pattern, rule) in &self.rules {
            if pattern.matches_with(category, opts) {
                return PolicyDecision {
                    policy: rule.policy,
                    confident: true,
                    base_risk: rule
                        .base_risk
                        .unwrap_or_else(|| rule.policy.default_base_risk()),
                };
            }
        }
        PolicyDecision {
            policy: MergePolicy::Override,
            confident: false,
            base_risk: MergePolicy::Override.default_base_risk(),
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let rules = PolicyConfig::default()
            .rules
            .into_iter()
            .filter_map(|rule| Pattern::new(&rule.pattern).ok().map(|p| (p, rule)))
            .collect();
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let table = PolicyTable::default();
        let on_action = table.lookup("common/on_action");
        assert_eq!(on_action.policy, MergePolicy::ContainerMerge);
        assert!(on_action.confident);
        assert_eq!(on_action.base_risk, 10);

        let traditions = table.lookup("common/culture/traditions");
        assert_eq!(traditions.policy, MergePolicy::Override);
        assert!(traditions.confident);

        assert_eq!(table.lookup("gui/shared").policy, MergePolicy::Fios);
        assert_eq!(table.lookup("localization/english").base_risk, 5);
    }

    #[test]
    fn test_unknown_category_is_unconfident_override() {
        let decision = PolicyTable::default().lookup("common/some_new_folder");
        assert_eq!(decision.policy, MergePolicy::Override);
        assert!(!decision.confident);
        assert_eq!(decision.base_risk, 20);
    }

    #[test]
    fn test_first_match_wins() {
        let table = PolicyTable::from_json(
            r#"{"version":1,"rules":[
                {"pattern":"common/x","policy":"FIOS","base_risk":40},
                {"pattern":"common/*","policy":"CONTAINER_MERGE"}
            ]}"#,
        )
        .unwrap();
        let x = table.lookup("common/x");
        assert_eq!((x.policy, x.base_risk), (MergePolicy::Fios, 40));
        assert_eq!(table.lookup("common/y").policy, MergePolicy::ContainerMerge);
        // `*` does not cross a separator.
        assert!(!table.lookup("common/y/z").confident);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(matches!(
            PolicyTable::from_json(r#"{"version":2,"rules":[]}"#),
            Err(PolicyError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            PolicyTable::from_json(r#"{"rules":[{"pattern":"a/[","policy":"OVERRIDE"}]}"#),
            Err(PolicyError::InvalidPattern { .. })
        ));
        assert!(PolicyTable::from_json(r#"{"rules":[{"pattern":"a","policy":"MERGE"}]}"#).is_err());
    }
}
