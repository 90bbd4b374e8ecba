//! Combining competing definitions of one key under a merge policy.
//!
//! Every contribution is a top-level statement (`key = value`) in some AST.
//! The merged result is a fresh [`ScriptAst`] fragment whose root holds the
//! single resulting statement.

use std::collections::{BTreeSet, HashSet};

use crate::policy::MergePolicy;
use crate::types::{
    AstBuilder, BlockShape, NodeId, NodeKind, Operator, Scalar, ScalarKind, ScriptAst, ROOT,
};

/// One contributor's statement.
#[derive(Debug, Clone, Copy)]
pub struct ContributionView<'a> {
    pub ast: &'a ScriptAst,
    pub node: NodeId,
}

impl<'a> ContributionView<'a> {
    pub fn new(ast: &'a ScriptAst, node: NodeId) -> Self {
        Self { ast, node }
    }

    /// The value block, when the statement has one.
    fn block(&self) -> Option<NodeId> {
        self.ast
            .value(self.node)
            .filter(|v| self.ast.is_block(*v))
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub value: ScriptAst,
    /// Index of the contribution that supplied the statement's key and base block.
    pub winner: usize,
    /// More than one contribution made it into `value`.
    pub combined: bool,
}

/// Merge `contributions` (in load order, non-empty) under `policy`.
pub fn merge(policy: MergePolicy, contributions: &[ContributionView<'_>]) -> Option<MergeOutcome> {
    let last = contributions.len().checked_sub(1)?;
    let pick = |winner: usize| {
        let c = contributions[winner];
        let mut b = AstBuilder::new(c.ast.parser_version);
        b.copy_subtree(ROOT, c.ast, c.node);
        MergeOutcome {
            value: b.finish(),
            winner,
            combined: false,
        }
    };

    if policy == MergePolicy::Fios {
        return Some(pick(0));
    }
    if contributions.len() == 1
        || policy == MergePolicy::Override
        || contributions.iter().any(|c| c.block().is_none())
    {
        return Some(pick(last));
    }

    let outcome = match policy {
        MergePolicy::ContainerMerge => container_merge(contributions),
        MergePolicy::PerKeyOverride => per_key_override(contributions),
        MergePolicy::Override | MergePolicy::Fios => pick(last),
    };
    Some(outcome)
}

/// Start a fragment holding `key = <block>` modelled on the last contributor.
fn start_fragment(last: &ContributionView<'_>) -> (AstBuilder, NodeId) {
    let ast = last.ast;
    let mut b = AstBuilder::new(ast.parser_version);
    let stmt_kind = ast.node(last.node).kind.clone();
    let stmt = b.push(stmt_kind, ast.node(last.node).span);
    b.attach(ROOT, stmt);
    let block_kind = last
        .block()
        .map(|blk| ast.node(blk).kind.clone())
        .unwrap_or(NodeKind::Block { tag: None });
    let block = b.push(block_kind, ast.node(last.node).span);
    b.attach(stmt, block);
    (b, block)
}

fn container_merge(contributions: &[ContributionView<'_>]) -> MergeOutcome {
    let last_idx = contributions.len() - 1;
    let last = &contributions[last_idx];
    let list_keys = list_valued_keys(contributions);
    let (mut b, block) = start_fragment(last);

    let mut emitted: HashSet<String> = HashSet::new();
    let mut combined = false;
    let last_block = last.block().unwrap_or(ROOT);
    for &child in last.ast.children(last_block) {
        match last.ast.key(child) {
            Some(key) if list_keys.contains(&key.text) => {
                if emitted.insert(key.text.clone()) {
                    combined |= append_merged_list(&mut b, block, &key.text, contributions);
                }
            }
            _ => {
                b.copy_subtree(block, last.ast, child);
            }
        }
    }

    // Lists the last contributor never mentions still carry over.
    for key in first_appearance_keys(contributions) {
        if list_keys.contains(&key) && !emitted.contains(&key) {
            append_merged_list(&mut b, block, &key, contributions);
            emitted.insert(key);
            combined = true;
        }
    }

    MergeOutcome {
        value: b.finish(),
        winner: last_idx,
        combined,
    }
}

/// Keys whose value is a list in at least one contributor and list-like
/// (list or empty) in every contributor that has the key.
fn list_valued_keys(contributions: &[ContributionView<'_>]) -> BTreeSet<String> {
    let mut candidates = BTreeSet::new();
    let mut rejected = BTreeSet::new();
    for c in contributions {
        let Some(block) = c.block() else { continue };
        for &child in c.ast.children(block) {
            let Some(key) = c.ast.key(child) else { continue };
            let shape = c
                .ast
                .value(child)
                .filter(|v| c.ast.is_block(*v))
                .map(|v| c.ast.shape(v));
            match shape {
                Some(BlockShape::List) => {
                    candidates.insert(key.text.clone());
                }
                Some(BlockShape::Empty) => {}
                _ => {
                    rejected.insert(key.text.clone());
                }
            }
        }
    }
    candidates.difference(&rejected).cloned().collect()
}

/// Attach `key = { ... }` holding every contributor's items for `key`, in
/// load order, skipping structurally identical repeats. Returns whether items
/// came from more than one contributor.
fn append_merged_list(
    b: &mut AstBuilder,
    parent: NodeId,
    key: &str,
    contributions: &[ContributionView<'_>],
) -> bool {
    let mut header: Option<(Scalar, Operator, NodeKind)> = None;
    let mut items: Vec<(&ScriptAst, NodeId)> = Vec::new();
    let mut sources = 0;
    for c in contributions {
        let Some(block) = c.block() else { continue };
        let mut contributed = false;
        for entry in c.ast.entries_with_key(block, key) {
            let Some(value) = c.ast.value(entry).filter(|v| c.ast.is_block(*v)) else {
                continue;
            };
            if let NodeKind::Assignment { key, op } = &c.ast.node(entry).kind {
                header = Some((key.clone(), *op, c.ast.node(value).kind.clone()));
            }
            for &item in c.ast.children(value) {
                items.push((c.ast, item));
                contributed = true;
            }
        }
        if contributed {
            sources += 1;
        }
    }

    let (key_scalar, op, block_kind) = header.unwrap_or_else(|| {
        (
            Scalar::new(ScalarKind::Ident, key),
            Operator::Eq,
            NodeKind::Block { tag: None },
        )
    });
    let stmt = b.push(
        NodeKind::Assignment {
            key: key_scalar,
            op,
        },
        Default::default(),
    );
    b.attach(parent, stmt);
    let list = b.push(block_kind, Default::default());
    b.attach(stmt, list);

    let mut seen = HashSet::new();
    for (ast, item) in items {
        if seen.insert(ast.render(item)) {
            b.copy_subtree(list, ast, item);
        }
    }
    sources > 1
}

/// Statement keys across contributors in order of first appearance. Bare
/// items are not keys and are skipped.
fn first_appearance_keys(contributions: &[ContributionView<'_>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for c in contributions {
        let Some(block) = c.block() else { continue };
        for &child in c.ast.children(block) {
            if let Some(key) = c.ast.key(child) {
                if seen.insert(key.text.clone()) {
                    order.push(key.text.clone());
                }
            }
        }
    }
    order
}

fn per_key_override(contributions: &[ContributionView<'_>]) -> MergeOutcome {
    let last_idx = contributions.len() - 1;
    let (mut b, block) = start_fragment(&contributions[last_idx]);
    let mut owners = HashSet::new();

    for key in first_appearance_keys(contributions) {
        let Some((idx, owner)) = contributions
            .iter()
            .enumerate()
            .rev()
            .find(|(_, c)| c.block().is_some_and(|blk| c.ast.entries_with_key(blk, &key).next().is_some()))
        else {
            continue;
        };
        owners.insert(idx);
        if let Some(blk) = owner.block() {
            for entry in owner.ast.entries_with_key(blk, &key) {
                b.copy_subtree(block, owner.ast, entry);
            }
        }
    }

    // Bare items follow the last contributor that has any.
    if let Some((idx, owner)) = contributions.iter().enumerate().rev().find(|(_, c)| {
        c.block()
            .is_some_and(|blk| c.ast.children(blk).iter().any(|n| c.ast.key(*n).is_none()))
    }) {
        owners.insert(idx);
        if let Some(blk) = owner.block() {
            for &child in owner.ast.children(blk) {
                if owner.ast.key(child).is_none() {
                    b.copy_subtree(block, owner.ast, child);
                }
            }
        }
    }

    MergeOutcome {
        value: b.finish(),
        winner: last_idx,
        combined: owners.len() > 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_script, ParseOptions};
    use pretty_assertions::assert_eq;

    fn asts(sources: &[&str]) -> Vec<ScriptAst> {
        sources
            .iter()
            .map(|s| parse_script(s.as_bytes(), &ParseOptions::default()))
            .collect()
    }

    fn views(asts: &[ScriptAst]) -> Vec<ContributionView<'_>> {
        asts.iter()
            .map(|a| ContributionView::new(a, a.statements()[0]))
            .collect()
    }

    fn rendered(policy: MergePolicy, sources: &[&str]) -> (String, MergeOutcome) {
        let asts = asts(sources);
        let outcome = merge(policy, &views(&asts)).unwrap();
        (outcome.value.render(ROOT), outcome)
    }

    #[test]
    fn test_override_keeps_last_block() {
        let (text, outcome) = rendered(
            MergePolicy::Override,
            &["on_x = { events = { a } }", "on_x = { events = { b } }"],
        );
        assert_eq!(text, "on_x = {\n\tevents = { b }\n}\n");
        assert_eq!(outcome.winner, 1);
        assert!(!outcome.combined);
    }

    #[test]
    fn test_fios_keeps_first() {
        let (text, outcome) = rendered(MergePolicy::Fios, &["w = { a = 1 }", "w = { a = 2 }"]);
        assert_eq!(text, "w = {\n\ta = 1\n}\n");
        assert_eq!(outcome.winner, 0);
    }

    #[test]
    fn test_container_merge_concatenates_lists() {
        let (text, outcome) = rendered(
            MergePolicy::ContainerMerge,
            &[
                "on_x = { events = { a } trigger = { t1 = yes } }",
                "on_x = { events = { b a } }",
                "on_x = { events = { c } effect = { e = 1 } }",
            ],
        );
        assert_eq!(
            text,
            "on_x = {\n\tevents = { a b c }\n\teffect = {\n\t\te = 1\n\t}\n}\n"
        );
        assert!(outcome.combined);
        assert_eq!(outcome.winner, 2);
    }

    #[test]
    fn test_container_merge_empty_block_counts_as_list() {
        let (text, _) = rendered(
            MergePolicy::ContainerMerge,
            &["on_x = { events = { a } }", "on_x = { events = { } on_actions = { y } }"],
        );
        assert_eq!(text, "on_x = {\n\tevents = { a }\n\ton_actions = { y }\n}\n");
    }

    #[test]
    fn test_container_merge_appends_lists_missing_from_last() {
        let (text, _) = rendered(
            MergePolicy::ContainerMerge,
            &["on_x = { on_actions = { a_1 } }", "on_x = { events = { b } }"],
        );
        assert_eq!(text, "on_x = {\n\tevents = { b }\n\ton_actions = { a_1 }\n}\n");
    }

    #[test]
    fn test_per_key_override() {
        let (text, outcome) = rendered(
            MergePolicy::PerKeyOverride,
            &["NGame = { a = 1 b = 2 }", "NGame = { b = 3 c = 4 }"],
        );
        assert_eq!(text, "NGame = {\n\ta = 1\n\tb = 3\n\tc = 4\n}\n");
        assert!(outcome.combined);
    }

    #[test]
    fn test_scalar_contribution_degrades_to_override() {
        let (text, outcome) = rendered(
            MergePolicy::ContainerMerge,
            &["x = { a = { 1 } }", "x = 5"],
        );
        assert_eq!(text, "x = 5\n");
        assert_eq!(outcome.winner, 1);
    }

    #[test]
    fn test_empty_input() {
        assert!(merge(MergePolicy::Override, &[]).is_none());
    }
}
