//! Symbol and reference extraction.
//!
//! Records carry only a name, a kind and a first-occurrence position. They
//! are bound to the content they came from by the caller, never to a file
//! path or a load-order position, so one AST shared by many files extracts
//! to exactly one set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::localization::LocalizationDocument;
use crate::parser::ParsedDocument;
use crate::token::Span;
use crate::types::{NodeId, NodeKind, Scalar, ScalarKind, ScriptAst};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Top-level `name = { ... }`, including an empty block.
    Definition,
    /// Top-level `name = scalar`.
    Value,
    /// `@name = ...`
    ScriptedVariable,
    /// A key in a localization file.
    Localization,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Definition => "definition",
            SymbolKind::Value => "value",
            SymbolKind::ScriptedVariable => "scripted_variable",
            SymbolKind::Localization => "localization",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SymbolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "definition" => Ok(SymbolKind::Definition),
            "value" => Ok(SymbolKind::Value),
            "scripted_variable" => Ok(SymbolKind::ScriptedVariable),
            "localization" => Ok(SymbolKind::Localization),
            other => Err(format!("unknown symbol kind: {other}")),
        }
    }
}

/// Kind of a usage. Stored and serialized in its string form
/// (`scope`, `typed:culture`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ReferenceKind {
    ScriptedVariable,
    Scope,
    /// `prefix:name`, e.g. `culture:norse`.
    Typed(String),
    Parameter,
    Event,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::ScriptedVariable => f.write_str("scripted_variable"),
            ReferenceKind::Scope => f.write_str("scope"),
            ReferenceKind::Typed(prefix) => write!(f, "typed:{prefix}"),
            ReferenceKind::Parameter => f.write_str("parameter"),
            ReferenceKind::Event => f.write_str("event"),
        }
    }
}

impl FromStr for ReferenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scripted_variable" => Ok(ReferenceKind::ScriptedVariable),
            "scope" => Ok(ReferenceKind::Scope),
            "parameter" => Ok(ReferenceKind::Parameter),
            "event" => Ok(ReferenceKind::Event),
            other => match other.strip_prefix("typed:") {
                Some(prefix) if !prefix.is_empty() => Ok(ReferenceKind::Typed(prefix.to_string())),
                _ => Err(format!("unknown reference kind: {other}")),
            },
        }
    }
}

impl From<ReferenceKind> for String {
    fn from(kind: ReferenceKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ReferenceKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub kind: ReferenceKind,
    pub line: u32,
    pub column: u32,
    pub count: u32,
}

pub fn extract_symbols(doc: &ParsedDocument) -> Vec<Symbol> {
    match doc {
        ParsedDocument::Script(ast) => script_symbols(ast),
        ParsedDocument::Localization(loc) => localization_symbols(loc),
    }
}

pub fn extract_references(doc: &ParsedDocument) -> Vec<Reference> {
    match doc {
        ParsedDocument::Script(ast) => script_references(ast),
        ParsedDocument::Localization(_) => Vec::new(),
    }
}

fn script_symbols(ast: &ScriptAst) -> Vec<Symbol> {
    let mut seen: BTreeMap<(SymbolKind, String), Span> = BTreeMap::new();
    for &stmt in ast.statements() {
        let NodeKind::Assignment { key, .. } = &ast.node(stmt).kind else {
            continue;
        };
        let span = ast.node(stmt).span;
        let entry = if key.kind == ScalarKind::Variable {
            (SymbolKind::ScriptedVariable, variable_name(&key.text).to_string())
        } else {
            let is_block = ast.value(stmt).is_some_and(|v| ast.is_block(v));
            let kind = if is_block {
                SymbolKind::Definition
            } else {
                SymbolKind::Value
            };
            (kind, key.text.clone())
        };
        seen.entry(entry).or_insert(span);
    }
    seen.into_iter()
        .map(|((kind, name), span)| Symbol {
            name,
            kind,
            line: span.line,
            column: span.column,
        })
        .collect()
}

fn localization_symbols(doc: &LocalizationDocument) -> Vec<Symbol> {
    let mut seen: BTreeMap<String, u32> = BTreeMap::new();
    for entry in &doc.entries {
        seen.entry(entry.key.clone()).or_insert(entry.line);
    }
    seen.into_iter()
        .map(|(name, line)| Symbol {
            name,
            kind: SymbolKind::Localization,
            line,
            column: 1,
        })
        .collect()
}

#[derive(Default)]
struct ReferenceSet {
    found: BTreeMap<(ReferenceKind, String), (Span, u32)>,
}

impl ReferenceSet {
    fn add(&mut self, kind: ReferenceKind, name: &str, span: Span) {
        if name.is_empty() {
            return;
        }
        let slot = self
            .found
            .entry((kind, name.to_string()))
            .or_insert((span, 0));
        if span.start < slot.0.start {
            slot.0 = span;
        }
        slot.1 += 1;
    }

    fn scan_scalar(&mut self, scalar: &Scalar, span: Span) {
        match scalar.kind {
            ScalarKind::Variable => {
                self.add(ReferenceKind::ScriptedVariable, variable_name(&scalar.text), span)
            }
            ScalarKind::InlineMath => {
                for word in math_identifiers(&scalar.text) {
                    self.add(ReferenceKind::ScriptedVariable, word, span);
                }
            }
            ScalarKind::Parameter => {
                for name in parameter_names(&scalar.text) {
                    self.add(ReferenceKind::Parameter, name, span);
                }
            }
            ScalarKind::Ident => {
                if let Some((kind, name)) = typed_reference(&scalar.text) {
                    self.add(kind, name, span);
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Vec<Reference> {
        self.found
            .into_iter()
            .map(|((kind, name), (span, count))| Reference {
                name,
                kind,
                line: span.line,
                column: span.column,
                count,
            })
            .collect()
    }
}

fn script_references(ast: &ScriptAst) -> Vec<Reference> {
    // Arena order is source order, so a flat pass visits every node without
    // recursion.
    collect_references(ast, 0..ast.nodes.len())
}

/// References made inside one statement's subtree.
pub fn subtree_references(ast: &ScriptAst, node: NodeId) -> Vec<Reference> {
    let mut ids = Vec::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        ids.push(id);
        stack.extend(ast.children(id).iter().rev());
    }
    collect_references(ast, ids)
}

fn collect_references(ast: &ScriptAst, ids: impl IntoIterator<Item = NodeId>) -> Vec<Reference> {
    let mut refs = ReferenceSet::default();
    for id in ids {
        let node = ast.node(id);
        match &node.kind {
            NodeKind::Scalar(scalar) => refs.scan_scalar(scalar, node.span),
            NodeKind::Assignment { key, .. } | NodeKind::Comparison { key, .. } => {
                // A variable key is a definition, not a usage.
                if key.kind != ScalarKind::Variable {
                    refs.scan_scalar(key, node.span);
                }
                if key.text == "trigger_event" {
                    event_references(ast, id, &mut refs);
                }
            }
            NodeKind::Block { .. } | NodeKind::Root => {}
        }
    }
    refs.finish()
}

/// `trigger_event = my_events.0001` or `trigger_event = { id = my_events.0001 }`.
fn event_references(ast: &ScriptAst, pair: NodeId, refs: &mut ReferenceSet) {
    let Some(value) = ast.value(pair) else {
        return;
    };
    if let Some(scalar) = ast.scalar(value) {
        refs.add(ReferenceKind::Event, &scalar.text, ast.node(value).span);
        return;
    }
    for id_pair in ast.entries_with_key(value, "id") {
        if let Some(v) = ast.value(id_pair) {
            if let Some(scalar) = ast.scalar(v) {
                refs.add(ReferenceKind::Event, &scalar.text, ast.node(v).span);
            }
        }
    }
}

fn variable_name(text: &str) -> &str {
    text.strip_prefix('@').unwrap_or(text)
}

/// `scope:actor.primary_title` is a scope reference to `actor`;
/// `culture:norse` is a `typed:culture` reference to `norse`.
fn typed_reference(text: &str) -> Option<(ReferenceKind, &str)> {
    let (prefix, rest) = text.split_once(':')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
        return None;
    }
    let name = rest.split('.').next().unwrap_or(rest);
    if name.is_empty() {
        return None;
    }
    let kind = if prefix == "scope" {
        ReferenceKind::Scope
    } else {
        ReferenceKind::Typed(prefix.to_string())
    };
    Some((kind, name))
}

/// Names between `$` pairs: `has_$T$_and_$U$` yields `T`, `U`.
fn parameter_names(text: &str) -> impl Iterator<Item = &str> {
    text.split('$').skip(1).step_by(2)
}

/// Identifiers inside `@[ ... ]` that can name scripted values.
fn math_identifiers(expr: &str) -> impl Iterator<Item = &str> {
    expr.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| w.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localization::parse_localization;
    use crate::parser::{parse_script, ParseOptions};
    use pretty_assertions::assert_eq;

    fn script(src: &str) -> ParsedDocument {
        ParsedDocument::Script(parse_script(src.as_bytes(), &ParseOptions::default()))
    }

    #[test]
    fn test_symbol_kinds() {
        let doc = script("@cost = 5\nfoo = { }\nbar = 3\nfoo = { a = 1 }\nlimit > 2\n");
        let symbols = extract_symbols(&doc);
        let summary: Vec<_> = symbols
            .iter()
            .map(|s| (s.kind, s.name.as_str(), s.line))
            .collect();
        assert_eq!(
            summary,
            vec![
                (SymbolKind::Definition, "foo", 2),
                (SymbolKind::Value, "bar", 3),
                (SymbolKind::ScriptedVariable, "cost", 1),
            ]
        );
    }

    #[test]
    fn test_reference_kinds_and_counts() {
        let doc = script(
            "a = {\n  cost = @cost\n  scope:actor = { culture = culture:norse }\n  has_$T$ = yes\n  x = @[ cost * 2 ]\n  save_scope_as = scope:actor.primary_title\n}\n",
        );
        let refs = extract_references(&doc);
        let summary: Vec<_> = refs
            .iter()
            .map(|r| (r.kind.to_string(), r.name.as_str(), r.count))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("scripted_variable".to_string(), "cost", 2),
                ("scope".to_string(), "actor", 2),
                ("typed:culture".to_string(), "norse", 1),
                ("parameter".to_string(), "T", 1),
            ]
        );
        let scope = refs.iter().find(|r| r.kind == ReferenceKind::Scope).unwrap();
        assert_eq!(scope.line, 3);
    }

    #[test]
    fn test_event_references() {
        let doc = script(
            "e = {\n  trigger_event = my_events.0001\n  trigger_event = { id = my_events.0002 days = 3 }\n}",
        );
        let refs = extract_references(&doc);
        let events: Vec<_> = refs
            .iter()
            .filter(|r| r.kind == ReferenceKind::Event)
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(events, vec!["my_events.0001", "my_events.0002"]);
    }

    #[test]
    fn test_localization_symbols() {
        let loc = parse_localization(
            b"l_english:\n b_key:0 \"B\"\n a_key:0 \"A\"\n b_key:1 \"again\"\n",
            &ParseOptions::default(),
        );
        let symbols = extract_symbols(&ParsedDocument::Localization(loc));
        let names: Vec<_> = symbols.iter().map(|s| (s.name.as_str(), s.line)).collect();
        assert_eq!(names, vec![("a_key", 3), ("b_key", 2)]);
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let doc = script("x = { y = scope:z }\n@v = 1");
        assert_eq!(extract_symbols(&doc), extract_symbols(&doc));
        assert_eq!(extract_references(&doc), extract_references(&doc));
    }

    #[test]
    fn test_subtree_references() {
        let ParsedDocument::Script(ast) = script("a = { x = @one }\nb = { y = @two z = scope:s }") else {
            unreachable!()
        };
        let refs = subtree_references(&ast, ast.statements()[1]);
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["two", "s"]);
    }

    #[test]
    fn test_reference_kind_strings() {
        for kind in [
            ReferenceKind::Scope,
            ReferenceKind::Typed("culture".into()),
            ReferenceKind::Event,
        ] {
            let parsed: ReferenceKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("typed:".parse::<ReferenceKind>().is_err());
    }
}
