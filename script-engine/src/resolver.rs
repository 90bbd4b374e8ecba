//! Load-order resolution and conflict detection.
//!
//! Given the active sources in load order, answers three independent
//! questions:
//!
//! 1. **Files**: which source's copy of each relative path is used. A later
//!    source replaces a file outright, and definitions in a replaced file are
//!    flagged `shadowed_by_file`.
//! 2. **Symbols**: which source's definition of each named entity wins, from
//!    the stored symbol records alone.
//! 3. **Units**: every semantic key with two or more contributing sources,
//!    with its merged value and a risk score.
//!
//! Everything here is a pure function of its inputs: the same sources in the
//! same order always produce the same winners and the same units.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::extract::{
    extract_references, extract_symbols, subtree_references, Reference, ReferenceKind, Symbol,
    SymbolKind,
};
use crate::localization::LocEntry;
use crate::merge::{merge, ContributionView, MergeOutcome};
use crate::parser::ParsedDocument;
use crate::policy::{MergePolicy, PolicyDecision, PolicyTable};
use crate::risk::{score, RiskInput, RiskScore};
use crate::types::{AstBuilder, NodeId, NodeKind, Operator, Scalar, ScalarKind, ScriptAst, ROOT};

/// Top-level keys that are file bookkeeping rather than entities.
const NON_ENTITY_KEYS: &[&str] = &["namespace"];

/// Typed reference prefixes that name ad-hoc values rather than definitions.
const FREE_FORM_PREFIXES: &[&str] = &["flag", "var", "local_var", "global_var"];

// ──────────────────────────────────────────────────────────────
// Inputs
// ──────────────────────────────────────────────────────────────

/// One file as seen by the resolver. `document` is `None` while the file is
/// still waiting for the worker.
#[derive(Debug, Clone)]
pub struct FileInput {
    pub relative_path: String,
    pub content_hash: String,
    pub document: Option<Arc<ParsedDocument>>,
    pub symbols: Vec<Symbol>,
    pub references: Vec<Reference>,
}

impl FileInput {
    /// A parsed file, with symbols and references extracted on the spot.
    pub fn from_document(
        relative_path: impl Into<String>,
        content_hash: impl Into<String>,
        document: ParsedDocument,
    ) -> Self {
        let symbols = extract_symbols(&document);
        let references = extract_references(&document);
        Self {
            relative_path: relative_path.into(),
            content_hash: content_hash.into(),
            document: Some(Arc::new(document)),
            symbols,
            references,
        }
    }

    pub fn pending(relative_path: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            content_hash: content_hash.into(),
            document: None,
            symbols: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Root-relative parent directory, or `localization/<language>` for a
    /// parsed localization file.
    pub fn category(&self) -> String {
        if let Some(ParsedDocument::Localization(loc)) = self.document.as_deref() {
            if !loc.language.is_empty() {
                return format!("localization/{}", loc.language);
            }
        }
        category_of(&self.relative_path).to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SourceInput {
    pub id: String,
    pub is_base: bool,
    pub files: Vec<FileInput>,
}

/// Parent directory of a root-relative, forward-slash path.
pub fn category_of(relative_path: &str) -> &str {
    relative_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("")
}

// ──────────────────────────────────────────────────────────────
// Outputs
// ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SemanticKey {
    pub category: String,
    pub name: String,
}

impl SemanticKey {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SemanticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRef {
    pub source: String,
    pub relative_path: String,
    pub content_hash: String,
    pub line: u32,
    pub column: u32,
    pub shadowed_by_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResolution {
    pub relative_path: String,
    pub winner: String,
    pub content_hash: String,
    /// Earlier sources whose copy of the path is replaced, in load order.
    pub replaced: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolResolution {
    pub key: SemanticKey,
    pub kind: SymbolKind,
    pub policy: MergePolicy,
    pub winner: ContributionRef,
    pub losers: Vec<ContributionRef>,
    /// The policy combines contributions instead of picking one.
    pub merged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityResolution {
    pub key: SemanticKey,
    pub policy: MergePolicy,
    pub winner: ContributionRef,
    pub losers: Vec<ContributionRef>,
    /// Fragment whose root holds the resulting statement.
    pub value: ScriptAst,
    pub combined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFile {
    pub source: String,
    pub relative_path: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub files: Vec<FileResolution>,
    pub entities: Vec<EntityResolution>,
    /// Keys whose every definition sits in a replaced file.
    pub removed: Vec<SemanticKey>,
    pub pending: Vec<PendingFile>,
}

impl Resolution {
    pub fn entity(&self, key: &SemanticKey) -> Option<&EntityResolution> {
        self.entities
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.entities[i])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictUnit {
    pub key: SemanticKey,
    pub policy: MergePolicy,
    pub confident: bool,
    /// One entry per contributing source, in load order.
    pub contributors: Vec<ContributionRef>,
    /// `None` when every contribution is shadowed.
    pub winner: Option<ContributionRef>,
    pub risk: RiskScore,
}

// ──────────────────────────────────────────────────────────────
// Contributions
// ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Payload<'a> {
    Statement { ast: &'a ScriptAst, node: NodeId },
    Entry(&'a LocEntry),
}

/// One source's definition of one key.
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    source: &'a SourceInput,
    file: &'a FileInput,
    payload: Payload<'a>,
    line: u32,
    column: u32,
    shadowed: bool,
}

impl<'a> Candidate<'a> {
    fn to_ref(&self) -> ContributionRef {
        ContributionRef {
            source: self.source.id.clone(),
            relative_path: self.file.relative_path.clone(),
            content_hash: self.file.content_hash.clone(),
            line: self.line,
            column: self.column,
            shadowed_by_file: self.shadowed,
        }
    }

    /// Localization entries are lifted into a one-statement script fragment
    /// so every policy works on the same representation.
    fn fragment(&self) -> Option<ScriptAst> {
        let Payload::Entry(entry) = self.payload else {
            return None;
        };
        let mut b = AstBuilder::new(crate::PARSER_VERSION);
        let stmt = b.push(
            NodeKind::Assignment {
                key: Scalar::new(ScalarKind::Ident, entry.key.clone()),
                op: Operator::Eq,
            },
            Default::default(),
        );
        b.attach(ROOT, stmt);
        let value = b.push(
            NodeKind::Scalar(Scalar::new(ScalarKind::String, entry.text.clone())),
            Default::default(),
        );
        b.attach(stmt, value);
        Some(b.finish())
    }

    fn view<'f>(&'f self, fragment: Option<&'f ScriptAst>) -> Option<ContributionView<'f>> {
        match (self.payload, fragment) {
            (Payload::Statement { ast, node }, _) => Some(ContributionView::new(ast, node)),
            (Payload::Entry(_), Some(f)) => f
                .statements()
                .first()
                .map(|stmt| ContributionView::new(f, *stmt)),
            (Payload::Entry(_), None) => None,
        }
    }
}

type Units<'a> = BTreeMap<SemanticKey, Vec<Candidate<'a>>>;

/// Highest source index holding each relative path.
fn last_owner_by_path(sources: &[SourceInput]) -> HashMap<&str, usize> {
    let mut owners = HashMap::new();
    for (idx, source) in sources.iter().enumerate() {
        for file in &source.files {
            owners.insert(file.relative_path.as_str(), idx);
        }
    }
    owners
}

/// Files of a source in relative-path order.
fn ordered_files(source: &SourceInput) -> Vec<&FileInput> {
    let mut files: Vec<&FileInput> = source.files.iter().collect();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

fn definitions(doc: &ParsedDocument) -> Vec<(String, Payload<'_>, u32, u32)> {
    match doc {
        ParsedDocument::Script(ast) => ast
            .statements()
            .iter()
            .filter_map(|&stmt| {
                let node = ast.node(stmt);
                let NodeKind::Assignment { key, .. } = &node.kind else {
                    return None;
                };
                if NON_ENTITY_KEYS.contains(&key.text.as_str()) {
                    return None;
                }
                Some((
                    key.text.clone(),
                    Payload::Statement { ast, node: stmt },
                    node.span.line,
                    node.span.column,
                ))
            })
            .collect(),
        ParsedDocument::Localization(loc) => loc
            .entries
            .iter()
            .map(|e| (e.key.clone(), Payload::Entry(e), e.line, 1))
            .collect(),
    }
}

/// Group every source's contribution by semantic key. Within a source the
/// last definition in path order wins, preferring definitions that are not
/// shadowed by a later source's copy of the file.
fn gather(sources: &[SourceInput]) -> Units<'_> {
    let owners = last_owner_by_path(sources);
    let mut units: Units<'_> = BTreeMap::new();
    for (idx, source) in sources.iter().enumerate() {
        let mut own: BTreeMap<SemanticKey, Candidate<'_>> = BTreeMap::new();
        for file in ordered_files(source) {
            let Some(doc) = file.document.as_deref() else {
                continue;
            };
            let shadowed = owners
                .get(file.relative_path.as_str())
                .is_some_and(|owner| *owner > idx);
            let category = file.category();
            for (name, payload, line, column) in definitions(doc) {
                let key = SemanticKey::new(category.clone(), name);
                let candidate = Candidate {
                    source,
                    file,
                    payload,
                    line,
                    column,
                    shadowed,
                };
                match own.get(&key) {
                    Some(existing) if !existing.shadowed && shadowed => {}
                    _ => {
                        own.insert(key, candidate);
                    }
                }
            }
        }
        for (key, candidate) in own {
            units.entry(key).or_default().push(candidate);
        }
    }
    units
}

/// Names defined anywhere in the active sources.
#[derive(Default)]
struct DefinedNames {
    variables: HashSet<String>,
    entities: HashSet<String>,
}

impl DefinedNames {
    fn collect(sources: &[SourceInput]) -> Self {
        let mut names = Self::default();
        for file in sources.iter().flat_map(|s| &s.files) {
            for symbol in &file.symbols {
                match symbol.kind {
                    SymbolKind::ScriptedVariable => {
                        names.variables.insert(symbol.name.clone());
                    }
                    SymbolKind::Definition | SymbolKind::Value => {
                        names.entities.insert(symbol.name.clone());
                    }
                    SymbolKind::Localization => {}
                }
            }
        }
        names
    }

    fn resolves(&self, reference: &Reference) -> bool {
        match &reference.kind {
            ReferenceKind::ScriptedVariable => self.variables.contains(&reference.name),
            ReferenceKind::Event => self.entities.contains(&reference.name),
            ReferenceKind::Typed(prefix) if !FREE_FORM_PREFIXES.contains(&prefix.as_str()) => {
                self.entities.contains(&reference.name)
            }
            _ => true,
        }
    }
}

/// Merge result for one unit.
struct Settled {
    decision: PolicyDecision,
    /// Index into the unit's candidates.
    winner: Option<usize>,
    outcome: Option<MergeOutcome>,
}

// ──────────────────────────────────────────────────────────────
// Resolver
// ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    policies: PolicyTable,
}

impl Resolver {
    pub fn new(policies: PolicyTable) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Same relative path in several sources: the last source's copy is used.
    pub fn resolve_files(&self, sources: &[SourceInput]) -> Vec<FileResolution> {
        let mut by_path: BTreeMap<&str, Vec<(&SourceInput, &FileInput)>> = BTreeMap::new();
        for source in sources {
            for file in &source.files {
                by_path
                    .entry(file.relative_path.as_str())
                    .or_default()
                    .push((source, file));
            }
        }
        by_path
            .into_iter()
            .filter_map(|(path, holders)| {
                let ((winner, file), earlier) = holders.split_last()?;
                Some(FileResolution {
                    relative_path: path.to_string(),
                    winner: winner.id.clone(),
                    content_hash: file.content_hash.clone(),
                    replaced: earlier.iter().map(|(s, _)| s.id.clone()).collect(),
                })
            })
            .collect()
    }

    /// Winners per named entity, computed from symbol records only. Keys
    /// whose every definition is shadowed are left out.
    pub fn resolve_symbols(&self, sources: &[SourceInput]) -> Vec<SymbolResolution> {
        let owners = last_owner_by_path(sources);
        let mut groups: BTreeMap<(SemanticKey, SymbolKind), Vec<ContributionRef>> =
            BTreeMap::new();
        for (idx, source) in sources.iter().enumerate() {
            let mut own: BTreeMap<(SemanticKey, SymbolKind), ContributionRef> = BTreeMap::new();
            for file in ordered_files(source) {
                let shadowed = owners
                    .get(file.relative_path.as_str())
                    .is_some_and(|owner| *owner > idx);
                let category = file.category();
                for symbol in &file.symbols {
                    let name = if symbol.kind == SymbolKind::ScriptedVariable {
                        format!("@{}", symbol.name)
                    } else {
                        symbol.name.clone()
                    };
                    let key = (SemanticKey::new(category.clone(), name), symbol.kind);
                    let contribution = ContributionRef {
                        source: source.id.clone(),
                        relative_path: file.relative_path.clone(),
                        content_hash: file.content_hash.clone(),
                        line: symbol.line,
                        column: symbol.column,
                        shadowed_by_file: shadowed,
                    };
                    match own.get(&key) {
                        Some(existing) if !existing.shadowed_by_file && shadowed => {}
                        _ => {
                            own.insert(key, contribution);
                        }
                    }
                }
            }
            for (key, contribution) in own {
                groups.entry(key).or_default().push(contribution);
            }
        }

        groups
            .into_iter()
            .filter_map(|((key, kind), contributions)| {
                let decision = self.policies.lookup(&key.category);
                let live: Vec<usize> = contributions
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.shadowed_by_file)
                    .map(|(i, _)| i)
                    .collect();
                let winner_idx = if decision.policy == MergePolicy::Fios {
                    *live.first()?
                } else {
                    *live.last()?
                };
                let merged = matches!(
                    decision.policy,
                    MergePolicy::ContainerMerge | MergePolicy::PerKeyOverride
                ) && live.len() > 1;
                let winner = contributions[winner_idx].clone();
                let losers = contributions
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| *i != winner_idx)
                    .map(|(_, c)| c)
                    .collect();
                Some(SymbolResolution {
                    key,
                    kind,
                    policy: decision.policy,
                    winner,
                    losers,
                    merged,
                })
            })
            .collect()
    }

    /// File-level results plus the resolved value of every key.
    pub fn resolve(&self, sources: &[SourceInput]) -> Resolution {
        let units = gather(sources);
        let mut entities = Vec::new();
        let mut removed = Vec::new();
        for (key, candidates) in &units {
            let settled = self.settle(key, candidates);
            match (settled.winner, settled.outcome) {
                (Some(winner), Some(outcome)) => entities.push(EntityResolution {
                    key: key.clone(),
                    policy: settled.decision.policy,
                    winner: candidates[winner].to_ref(),
                    losers: candidates
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != winner)
                        .map(|(_, c)| c.to_ref())
                        .collect(),
                    value: outcome.value,
                    combined: outcome.combined,
                }),
                _ => removed.push(key.clone()),
            }
        }

        tracing::debug!(
            sources = sources.len(),
            entities = entities.len(),
            removed = removed.len(),
            "resolved load order"
        );
        Resolution {
            files: self.resolve_files(sources),
            entities,
            removed,
            pending: pending_files(sources),
        }
    }

    /// Keys with two or more contributing sources, riskiest first.
    pub fn find_conflicts(&self, sources: &[SourceInput]) -> Vec<ConflictUnit> {
        let units = gather(sources);
        let defined = DefinedNames::collect(sources);
        let mut conflicts: Vec<ConflictUnit> = units
            .iter()
            .filter(|(_, candidates)| candidates.len() >= 2)
            .map(|(key, candidates)| {
                let settled = self.settle(key, candidates);
                let winner = settled.winner.map(|w| &candidates[w]);
                let base_overwritten = candidates.iter().any(|c| c.source.is_base)
                    && !winner.is_some_and(|w| w.source.is_base);
                let risk = score(&RiskInput {
                    decision: settled.decision,
                    contributors: candidates.len(),
                    base_overwritten,
                    unresolved_references: unresolved_references(candidates, &defined),
                });
                ConflictUnit {
                    key: key.clone(),
                    policy: settled.decision.policy,
                    confident: settled.decision.confident,
                    contributors: candidates.iter().map(Candidate::to_ref).collect(),
                    winner: winner.map(Candidate::to_ref),
                    risk,
                }
            })
            .collect();
        conflicts.sort_by(|a, b| b.risk.total.cmp(&a.risk.total).then_with(|| a.key.cmp(&b.key)));
        tracing::debug!(
            sources = sources.len(),
            units = units.len(),
            conflicts = conflicts.len(),
            "computed conflict units"
        );
        conflicts
    }

    fn settle(&self, key: &SemanticKey, candidates: &[Candidate<'_>]) -> Settled {
        let decision = self.policies.lookup(&key.category);
        let live: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.shadowed)
            .map(|(i, _)| i)
            .collect();
        let fragments: Vec<Option<ScriptAst>> =
            live.iter().map(|&i| candidates[i].fragment()).collect();
        let views: Vec<(usize, ContributionView<'_>)> = live
            .iter()
            .zip(&fragments)
            .filter_map(|(&i, frag)| candidates[i].view(frag.as_ref()).map(|v| (i, v)))
            .collect();
        let only_views: Vec<ContributionView<'_>> = views.iter().map(|(_, v)| *v).collect();
        let outcome = merge(decision.policy, &only_views);
        Settled {
            decision,
            winner: outcome.as_ref().map(|o| views[o.winner].0),
            outcome,
        }
    }
}

fn unresolved_references(candidates: &[Candidate<'_>], defined: &DefinedNames) -> usize {
    let mut missing = BTreeSet::new();
    for candidate in candidates {
        if let Payload::Statement { ast, node } = candidate.payload {
            for reference in subtree_references(ast, node) {
                if !defined.resolves(&reference) {
                    missing.insert((reference.kind, reference.name));
                }
            }
        }
    }
    missing.len()
}

fn pending_files(sources: &[SourceInput]) -> Vec<PendingFile> {
    let mut pending: Vec<PendingFile> = sources
        .iter()
        .flat_map(|source| {
            source
                .files
                .iter()
                .filter(|f| f.document.is_none())
                .map(move |f| PendingFile {
                    source: source.id.clone(),
                    relative_path: f.relative_path.clone(),
                    content_hash: f.content_hash.clone(),
                })
        })
        .collect();
    pending.sort_by(|a, b| (&a.source, &a.relative_path).cmp(&(&b.source, &b.relative_path)));
    pending
}
