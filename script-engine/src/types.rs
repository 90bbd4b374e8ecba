//! Core types for parsed script.
//!
//! A script file is stored as a flat arena: every node lives in
//! [`ScriptAst::nodes`] and refers to its children by index. Node 0 is always
//! the root. The flat layout keeps serialization, cloning and dropping free of
//! recursion no matter how deeply the source nests.
//!
//! Node kinds:
//! - **Root**: the file itself, children are statements
//! - **Block**: a `{ ... }` container, optionally tagged (`rgb { 1 2 3 }`)
//! - **Assignment**: `key = value` or `key ?= value`, one child (the value)
//! - **Comparison**: `key >= value` and friends, one child (the value)
//! - **Scalar**: a bare value, either a list item or an assignment value

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::token::Span;

/// Index of a node inside its [`ScriptAst`].
pub type NodeId = usize;

pub const ROOT: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    QuestionEq,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::QuestionEq => "?=",
            Operator::EqEq => "==",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
        }
    }

    /// `=` and `?=` bind a value; everything else compares.
    pub fn is_assignment(&self) -> bool {
        matches!(self, Operator::Eq | Operator::QuestionEq)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Ident,
    String,
    Number,
    Percent,
    Bool,
    Variable,
    InlineMath,
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub text: String,
}

impl Scalar {
    pub fn new(kind: ScalarKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Source form of the scalar, re-quoting and re-escaping strings.
    pub fn to_source(&self) -> String {
        match self.kind {
            ScalarKind::String => {
                let escaped = self
                    .text
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('\n', "\\n")
                    .replace('\t', "\\t");
                format!("\"{escaped}\"")
            }
            ScalarKind::Percent => format!("{}%", self.text),
            ScalarKind::InlineMath => format!("@[ {} ]", self.text),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Block { tag: Option<String> },
    Assignment { key: Scalar, op: Operator },
    Comparison { key: Scalar, op: Operator },
    Scalar(Scalar),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
}

/// How a block's children look once inspected.
///
/// The parser never commits to list-vs-object for `{ }`; consumers ask for
/// the shape and decide what `Empty` means in their context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockShape {
    Empty,
    /// Only bare items (scalars or anonymous blocks).
    List,
    /// Only assignments and comparisons.
    Object,
    Mixed,
}

impl BlockShape {
    pub fn is_list_like(&self) -> bool {
        matches!(self, BlockShape::Empty | BlockShape::List)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            span,
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{} at {}: {}", level, self.span, self.message)
    }
}

/// A parsed script file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptAst {
    pub parser_version: u32,
    pub nodes: Vec<Node>,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub diagnostics_truncated: bool,
}

impl ScriptAst {
    /// An AST holding only an empty root.
    pub fn empty(parser_version: u32) -> Self {
        Self {
            parser_version,
            nodes: vec![Node {
                kind: NodeKind::Root,
                span: Span::default(),
                children: Vec::new(),
            }],
            diagnostics: Vec::new(),
            diagnostics_truncated: false,
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn root(&self) -> &Node {
        &self.nodes[ROOT]
    }

    /// Top-level statements of the file.
    pub fn statements(&self) -> &[NodeId] {
        &self.nodes[ROOT].children
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics_truncated
            || self
                .diagnostics
                .iter()
                .any(|d| d.severity == Severity::Error)
    }

    /// Key of an assignment or comparison node.
    pub fn key(&self, id: NodeId) -> Option<&Scalar> {
        match &self.nodes[id].kind {
            NodeKind::Assignment { key, .. } | NodeKind::Comparison { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Value node of an assignment or comparison.
    pub fn value(&self, id: NodeId) -> Option<NodeId> {
        match self.nodes[id].kind {
            NodeKind::Assignment { .. } | NodeKind::Comparison { .. } => {
                self.nodes[id].children.first().copied()
            }
            _ => None,
        }
    }

    pub fn is_block(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Block { .. } | NodeKind::Root)
    }

    pub fn scalar(&self, id: NodeId) -> Option<&Scalar> {
        match &self.nodes[id].kind {
            NodeKind::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Shape of a block or root node. Non-block nodes report `Mixed`.
    pub fn shape(&self, id: NodeId) -> BlockShape {
        if !self.is_block(id) {
            return BlockShape::Mixed;
        }
        let children = &self.nodes[id].children;
        if children.is_empty() {
            return BlockShape::Empty;
        }
        let keyed = children
            .iter()
            .filter(|c| self.key(**c).is_some())
            .count();
        if keyed == 0 {
            BlockShape::List
        } else if keyed == children.len() {
            BlockShape::Object
        } else {
            BlockShape::Mixed
        }
    }

    /// Child statements of `block` whose key text equals `key`.
    pub fn entries_with_key<'a>(
        &'a self,
        block: NodeId,
        key: &'a str,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes[block]
            .children
            .iter()
            .copied()
            .filter(move |c| self.key(*c).is_some_and(|k| k.text == key))
    }

    /// Structural equality of two subtrees, ignoring spans.
    #[cfg(test)]
    pub(crate) fn structurally_equal(&self, id: NodeId, other: &ScriptAst, other_id: NodeId) -> bool {
        let mut stack = vec![(id, other_id)];
        while let Some((x, y)) = stack.pop() {
            let (a, b) = (&self.nodes[x], &other.nodes[y]);
            if a.kind != b.kind || a.children.len() != b.children.len() {
                return false;
            }
            stack.extend(a.children.iter().copied().zip(b.children.iter().copied()));
        }
        true
    }

    /// Render a subtree back to script source in a canonical layout.
    pub fn render(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut stack = vec![Render::Node(id, 0)];
        while let Some(step) = stack.pop() {
            match step {
                Render::Text(text) => out.push_str(text),
                Render::Indent(depth) => out.extend(std::iter::repeat('\t').take(depth)),
                Render::Node(id, indent) => self.render_node(id, indent, &mut out, &mut stack),
            }
        }
        out
    }

    /// Write the head of `id` and push what follows it, last first.
    fn render_node(&self, id: NodeId, indent: usize, out: &mut String, stack: &mut Vec<Render>) {
        let node = &self.nodes[id];
        match &node.kind {
            NodeKind::Root => {
                for child in node.children.iter().rev() {
                    stack.push(Render::Text("\n"));
                    stack.push(Render::Node(*child, indent));
                }
            }
            NodeKind::Block { tag } => {
                if let Some(tag) = tag {
                    out.push_str(tag);
                    out.push(' ');
                }
                if node.children.is_empty() {
                    out.push_str("{ }");
                    return;
                }
                let scalars: Option<Vec<&Scalar>> =
                    node.children.iter().map(|c| self.scalar(*c)).collect();
                if let Some(scalars) = scalars {
                    out.push_str("{ ");
                    for scalar in scalars {
                        out.push_str(&scalar.to_source());
                        out.push(' ');
                    }
                    out.push('}');
                    return;
                }
                out.push_str("{\n");
                stack.push(Render::Text("}"));
                stack.push(Render::Indent(indent));
                for child in node.children.iter().rev() {
                    stack.push(Render::Text("\n"));
                    stack.push(Render::Node(*child, indent + 1));
                    stack.push(Render::Indent(indent + 1));
                }
            }
            NodeKind::Assignment { key, op } | NodeKind::Comparison { key, op } => {
                out.push_str(&key.to_source());
                out.push(' ');
                out.push_str(op.as_str());
                out.push(' ');
                if let Some(value) = node.children.first() {
                    stack.push(Render::Node(*value, indent));
                }
            }
            NodeKind::Scalar(s) => out.push_str(&s.to_source()),
        }
    }
}

/// Pending output of [`ScriptAst::render`].
enum Render {
    Node(NodeId, usize),
    Indent(usize),
    Text(&'static str),
}

/// Builds a [`ScriptAst`] node by node. Used by the parser and by the merge
/// code when it assembles resolved fragments.
#[derive(Debug)]
pub struct AstBuilder {
    ast: ScriptAst,
}

impl AstBuilder {
    pub fn new(parser_version: u32) -> Self {
        Self {
            ast: ScriptAst::empty(parser_version),
        }
    }

    pub fn set_root_span(&mut self, span: Span) {
        self.ast.nodes[ROOT].span = span;
    }

    /// Append a detached node and return its id.
    pub fn push(&mut self, kind: NodeKind, span: Span) -> NodeId {
        self.ast.nodes.push(Node {
            kind,
            span,
            children: Vec::new(),
        });
        self.ast.nodes.len() - 1
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.ast.nodes[parent].children.push(child);
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.ast.nodes[id].span
    }

    pub fn set_span(&mut self, id: NodeId, span: Span) {
        self.ast.nodes[id].span = span;
    }

    /// Deep-copy `src_id` out of `src` and attach the copy under `parent`.
    pub fn copy_subtree(&mut self, parent: NodeId, src: &ScriptAst, src_id: NodeId) -> NodeId {
        let mut stack = vec![(parent, src_id)];
        let mut first = None;
        while let Some((dst_parent, id)) = stack.pop() {
            let node = &src.nodes[id];
            let copy = self.push(node.kind.clone(), node.span);
            self.attach(dst_parent, copy);
            first.get_or_insert(copy);
            // Reverse so children are attached in source order.
            for child in node.children.iter().rev() {
                stack.push((copy, *child));
            }
        }
        first.unwrap_or(parent)
    }

    pub fn diagnostics_mut(&mut self) -> &mut Vec<Diagnostic> {
        &mut self.ast.diagnostics
    }

    pub fn mark_truncated(&mut self) {
        self.ast.diagnostics_truncated = true;
    }

    pub fn finish(self) -> ScriptAst {
        self.ast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ScriptAst {
        let mut b = AstBuilder::new(1);
        let assign = b.push(
            NodeKind::Assignment {
                key: Scalar::new(ScalarKind::Ident, "foo"),
                op: Operator::Eq,
            },
            Span::default(),
        );
        b.attach(ROOT, assign);
        let block = b.push(NodeKind::Block { tag: None }, Span::default());
        b.attach(assign, block);
        for item in ["a", "b"] {
            let s = b.push(
                NodeKind::Scalar(Scalar::new(ScalarKind::Ident, item)),
                Span::default(),
            );
            b.attach(block, s);
        }
        b.finish()
    }

    #[test]
    fn test_shape_classification() {
        let ast = sample();
        let assign = ast.statements()[0];
        let block = ast.value(assign).unwrap();
        assert_eq!(ast.shape(block), BlockShape::List);
        assert_eq!(ast.shape(ROOT), BlockShape::Object);
        assert!(BlockShape::Empty.is_list_like());
    }

    #[test]
    fn test_copy_subtree_preserves_order() {
        let src = sample();
        let mut b = AstBuilder::new(1);
        b.copy_subtree(ROOT, &src, src.statements()[0]);
        let copy = b.finish();
        assert!(copy.structurally_equal(copy.statements()[0], &src, src.statements()[0]));
        assert_eq!(copy.render(ROOT), "foo = { a b }\n");
    }

    #[test]
    fn test_render_nested_object() {
        let mut b = AstBuilder::new(1);
        let outer = b.push(
            NodeKind::Assignment {
                key: Scalar::new(ScalarKind::Ident, "t"),
                op: Operator::Eq,
            },
            Span::default(),
        );
        b.attach(ROOT, outer);
        let block = b.push(NodeKind::Block { tag: None }, Span::default());
        b.attach(outer, block);
        let inner = b.push(
            NodeKind::Comparison {
                key: Scalar::new(ScalarKind::Ident, "age"),
                op: Operator::GtEq,
            },
            Span::default(),
        );
        b.attach(block, inner);
        let v = b.push(
            NodeKind::Scalar(Scalar::new(ScalarKind::Number, "16")),
            Span::default(),
        );
        b.attach(inner, v);
        let ast = b.finish();
        assert_eq!(ast.render(ROOT), "t = {\n\tage >= 16\n}\n");
    }

    fn deep_chain(depth: usize) -> ScriptAst {
        let mut b = AstBuilder::new(1);
        let mut parent = ROOT;
        for level in 0..=depth {
            let pair = b.push(
                NodeKind::Assignment {
                    key: Scalar::new(ScalarKind::Ident, "x"),
                    op: Operator::Eq,
                },
                Span::default(),
            );
            b.attach(parent, pair);
            let value = if level == depth {
                NodeKind::Scalar(Scalar::new(ScalarKind::Number, "1"))
            } else {
                NodeKind::Block { tag: None }
            };
            parent = b.push(value, Span::default());
            b.attach(pair, parent);
        }
        b.finish()
    }

    #[test]
    fn test_deep_nesting_renders_on_a_small_stack() {
        const DEPTH: usize = 4_000;
        let ast = deep_chain(DEPTH);
        let rendered = std::thread::Builder::new()
            .stack_size(128 * 1024)
            .spawn(move || {
                let mut copy = AstBuilder::new(1);
                copy.copy_subtree(ROOT, &ast, ast.statements()[0]);
                let copy = copy.finish();
                assert!(copy.structurally_equal(ROOT, &ast, ROOT));
                ast.render(ROOT)
            })
            .unwrap()
            .join()
            .unwrap();

        assert!(rendered.starts_with("x = {\n\tx = {\n\t\tx = {\n"));
        assert!(rendered.ends_with("\n\t}\n}\n"));
        assert!(rendered.contains(&format!("\n{}x = 1\n", "\t".repeat(DEPTH))));
        assert_eq!(rendered.matches('{').count(), DEPTH);
        assert_eq!(rendered.matches('}').count(), DEPTH);
    }

    #[test]
    fn test_structural_equality_sees_deep_differences() {
        let a = deep_chain(50);
        let b = deep_chain(51);
        assert!(a.structurally_equal(ROOT, &deep_chain(50), ROOT));
        assert!(!a.structurally_equal(ROOT, &b, ROOT));
    }

    #[test]
    fn test_scalar_source_forms() {
        assert_eq!(Scalar::new(ScalarKind::String, "a \"b\"").to_source(), "\"a \\\"b\\\"\"");
        assert_eq!(Scalar::new(ScalarKind::Percent, "10").to_source(), "10%");
        assert_eq!(Scalar::new(ScalarKind::InlineMath, "x * 2").to_source(), "@[ x * 2 ]");
    }

    #[test]
    fn test_serde_is_flat() {
        let ast = sample();
        let json = serde_json::to_string(&ast).unwrap();
        let back: ScriptAst = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ast);
    }
}
