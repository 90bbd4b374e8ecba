//! Path → envelope routing.
//!
//! The routing table is plain JSON data. It is checked once when loaded,
//! so routing a path afterwards cannot fail.

use glob::{MatchOptions, Pattern};
use script_engine::DocumentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const ROUTING_CONFIG_VERSION: u32 = 1;

/// One processing step. Declaration order is the only legal execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Store,
    Parse,
    ParseLocalization,
    ExtractSymbols,
    ExtractReferences,
}

impl Step {
    /// Position in the pipeline. The two parse steps share a slot.
    pub fn rank(&self) -> u8 {
        match self {
            Step::Store => 0,
            Step::Parse | Step::ParseLocalization => 1,
            Step::ExtractSymbols => 2,
            Step::ExtractReferences => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Store => "store",
            Step::Parse => "parse",
            Step::ParseLocalization => "parse_localization",
            Step::ExtractSymbols => "extract_symbols",
            Step::ExtractReferences => "extract_references",
        }
    }

    pub fn document_kind(&self) -> Option<DocumentKind> {
        match self {
            Step::Parse => Some(DocumentKind::Script),
            Step::ParseLocalization => Some(DocumentKind::Localization),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, validated step list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Envelope {
    pub fn has(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }

    /// Nothing to do: the file is not even stored.
    pub fn is_skip(&self) -> bool {
        self.steps.is_empty()
    }

    /// Grammar of the parse step, if the envelope parses at all.
    pub fn parse_kind(&self) -> Option<DocumentKind> {
        self.steps.iter().find_map(Step::document_kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub envelope: String,
}

/// The routing table as written on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub envelopes: BTreeMap<String, Vec<Step>>,
    /// Checked in order; first match wins.
    pub rules: Vec<RouteRule>,
    pub fallback: String,
}

fn default_version() -> u32 {
    ROUTING_CONFIG_VERSION
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unsupported routing table version {0} (expected {ROUTING_CONFIG_VERSION})")]
    UnsupportedVersion(u32),

    #[error("rule `{pattern}` names undefined envelope `{envelope}`")]
    UndefinedEnvelope { pattern: String, envelope: String },

    #[error("fallback envelope `{0}` is not defined")]
    UndefinedFallback(String),

    #[error("envelope `{envelope}`: step `{step}` is out of order")]
    StepOrder { envelope: String, step: Step },

    #[error("envelope `{envelope}`: step `{step}` requires `{requires}` before it")]
    MissingPrerequisite {
        envelope: String,
        step: Step,
        requires: &'static str,
    },

    #[error("invalid route pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to read routing table: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid routing table JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl RoutingConfig {
    pub fn load(path: &Path) -> Result<Self, RoutingError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        use Step::*;
        let envelopes = [
            ("skip", vec![]),
            ("ingest_only", vec![Store]),
            ("full_script", vec![Store, Parse, ExtractSymbols, ExtractReferences]),
            ("script_without_references", vec![Store, Parse, ExtractSymbols]),
            ("localization", vec![Store, ParseLocalization, ExtractSymbols]),
        ]
        .into_iter()
        .map(|(name, steps)| (name.to_string(), steps))
        .collect();

        let rule = |pattern: &str, envelope: &str| RouteRule {
            pattern: pattern.to_string(),
            envelope: envelope.to_string(),
        };
        let rules = vec![
            rule("**/*.dds", "skip"),
            rule("**/*.png", "skip"),
            rule("**/*.tga", "skip"),
            rule("**/*.mesh", "skip"),
            rule("**/*.anim", "skip"),
            rule("**/*.ogg", "skip"),
            rule("**/*.wav", "skip"),
            rule("**/*.bank", "skip"),
            rule("**/*.ttf", "skip"),
            rule("**/*.fxh", "skip"),
            rule("**/*.shader", "skip"),
            rule("map_data/**", "ingest_only"),
            rule("**/*.csv", "ingest_only"),
            rule("localization/**/*.yml", "localization"),
            rule("history/provinces/**", "script_without_references"),
            rule("history/titles/**", "script_without_references"),
            rule("common/landed_titles/**", "script_without_references"),
            rule("**/*.txt", "full_script"),
            rule("**/*.gui", "full_script"),
        ];

        Self {
            version: ROUTING_CONFIG_VERSION,
            envelopes,
            rules,
            fallback: "ingest_only".to_string(),
        }
    }
}

/// A validated routing table.
#[derive(Debug, Clone)]
pub struct Router {
    envelopes: BTreeMap<String, Envelope>,
    rules: Vec<(Pattern, RouteRule)>,
    fallback: String,
}

impl Router {
    pub fn new(config: RoutingConfig) -> Result<Self, RoutingError> {
        if config.version != ROUTING_CONFIG_VERSION {
            return Err(RoutingError::UnsupportedVersion(config.version));
        }

        let mut envelopes = BTreeMap::new();
        for (name, steps) in config.envelopes {
            validate_steps(&name, &steps)?;
            envelopes.insert(name.clone(), Envelope { name, steps });
        }

        if !envelopes.contains_key(&config.fallback) {
            return Err(RoutingError::UndefinedFallback(config.fallback));
        }

        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in config.rules {
            if !envelopes.contains_key(&rule.envelope) {
                return Err(RoutingError::UndefinedEnvelope {
                    pattern: rule.pattern,
                    envelope: rule.envelope,
                });
            }
            let pattern =
                Pattern::new(&rule.pattern).map_err(|source| RoutingError::InvalidPattern {
                    pattern: rule.pattern.clone(),
                    source,
                })?;
            rules.push((pattern, rule));
        }

        Ok(Self {
            envelopes,
            rules,
            fallback: config.fallback,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, RoutingError> {
        Self::new(RoutingConfig::load(path)?)
    }

    /// Envelope for a root-relative, forward-slash path.
    pub fn route(&self, relative_path: &str) -> &Envelope {
        let envelope = self
            .matching_rule(relative_path)
            .map(|rule| rule.envelope.as_str())
            .unwrap_or(&self.fallback);
        // Every rule envelope and the fallback were checked in `new`.
        &self.envelopes[envelope]
    }

    /// The rule `route` would apply, or `None` when the fallback is used.
    pub fn matching_rule(&self, relative_path: &str) -> Option<&RouteRule> {
        let opts = MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches_with(relative_path, opts))
            .map(|(_, rule)| rule)
    }

    pub fn envelope(&self, name: &str) -> Option<&Envelope> {
        self.envelopes.get(name)
    }

    pub fn envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.envelopes.values()
    }

    pub fn rules(&self) -> impl Iterator<Item = &RouteRule> {
        self.rules.iter().map(|(_, rule)| rule)
    }

    pub fn fallback(&self) -> &Envelope {
        &self.envelopes[&self.fallback]
    }
}

impl Default for Router {
    fn default() -> Self {
        let config = RoutingConfig::default();
        let envelopes = config
            .envelopes
            .into_iter()
            .map(|(name, steps)| (name.clone(), Envelope { name, steps }))
            .collect();
        let rules = config
            .rules
            .into_iter()
            .filter_map(|rule| Pattern::new(&rule.pattern).ok().map(|p| (p, rule)))
            .collect();
        Self {
            envelopes,
            rules,
            fallback: config.fallback,
        }
    }
}

fn validate_steps(envelope: &str, steps: &[Step]) -> Result<(), RoutingError> {
    let mut last_rank: Option<u8> = None;
    let mut stored = false;
    let mut parsed = false;
    for &step in steps {
        if last_rank.is_some_and(|r| step.rank() <= r) {
            return Err(RoutingError::StepOrder {
                envelope: envelope.to_string(),
                step,
            });
        }
        last_rank = Some(step.rank());
        match step {
            Step::Store => stored = true,
            Step::Parse | Step::ParseLocalization => {
                if !stored {
                    return Err(RoutingError::MissingPrerequisite {
                        envelope: envelope.to_string(),
                        step,
                        requires: "store",
                    });
                }
                parsed = true;
            }
            Step::ExtractSymbols | Step::ExtractReferences => {
                if !parsed {
                    return Err(RoutingError::MissingPrerequisite {
                        envelope: envelope.to_string(),
                        step,
                        requires: "parse",
                    });
                }
            }
        }
    }
    Ok(())
}
