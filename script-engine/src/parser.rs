//! Recovering parser from tokens to the arena AST.
//!
//! The parser is iterative: open blocks live on an explicit frame stack, so
//! adversarial nesting cannot overflow the call stack. Every block node is
//! attached to its parent the moment its `{` is read, which means a block
//! left open at end of input is already part of the tree and only needs a
//! diagnostic.
//!
//! Recovery rules:
//! - an operator where a statement should start is reported, then tokens are
//!   skipped (counting braces) up to the next `key <op>` or the `}` closing
//!   the current block
//! - `key {` is read as `key = {` with a warning
//! - a stray `}` at the root is reported and dropped
//! - nesting beyond `max_depth` is reported and the block is skipped whole

use serde::{Deserialize, Serialize};

use crate::localization::{parse_localization, LocalizationDocument};
use crate::lexer::tokenize;
use crate::token::{Span, Token, TokenKind};
use crate::types::{
    AstBuilder, Diagnostic, NodeId, NodeKind, Operator, Scalar, ScalarKind, ScriptAst, ROOT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOptions {
    pub parser_version: u32,
    pub max_diagnostics: usize,
    pub max_depth: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            parser_version: crate::PARSER_VERSION,
            max_diagnostics: 100,
            max_depth: 256,
        }
    }
}

/// Which grammar a file is read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Script,
    Localization,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Script => "script",
            DocumentKind::Localization => "localization",
        }
    }
}

impl std::str::FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(DocumentKind::Script),
            "localization" => Ok(DocumentKind::Localization),
            other => Err(format!("unknown document kind: {other}")),
        }
    }
}

/// A parsed file of either grammar. This is the persisted AST form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ParsedDocument {
    Script(ScriptAst),
    Localization(LocalizationDocument),
}

impl ParsedDocument {
    pub fn kind(&self) -> DocumentKind {
        match self {
            ParsedDocument::Script(_) => DocumentKind::Script,
            ParsedDocument::Localization(_) => DocumentKind::Localization,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            ParsedDocument::Script(ast) => &ast.diagnostics,
            ParsedDocument::Localization(doc) => &doc.diagnostics,
        }
    }

    pub fn as_script(&self) -> Option<&ScriptAst> {
        match self {
            ParsedDocument::Script(ast) => Some(ast),
            ParsedDocument::Localization(_) => None,
        }
    }
}

/// Parse `src` with the grammar for `kind`.
pub fn parse_document(kind: DocumentKind, src: &[u8], opts: &ParseOptions) -> ParsedDocument {
    match kind {
        DocumentKind::Script => ParsedDocument::Script(parse_script(src, opts)),
        DocumentKind::Localization => ParsedDocument::Localization(parse_localization(src, opts)),
    }
}

/// Parse a script file. Always returns a tree, possibly partial, together
/// with whatever diagnostics were collected.
pub fn parse_script(src: &[u8], opts: &ParseOptions) -> ScriptAst {
    let tokens: Vec<Token> = tokenize(src)
        .into_iter()
        .filter(|t| t.kind != TokenKind::Comment)
        .collect();
    let mut parser = Parser::new(tokens, opts);
    parser.builder.set_root_span(Span::new(0, src.len(), 1, 1));
    parser.run();
    parser.builder.finish()
}

/// An open `{`.
struct Frame {
    block: NodeId,
    /// Assignment owning the block, if any; its span grows when the block closes.
    owner: Option<NodeId>,
    open: Span,
}

struct Parser<'o> {
    tokens: Vec<Token>,
    pos: usize,
    opts: &'o ParseOptions,
    builder: AstBuilder,
    frames: Vec<Frame>,
    diagnostic_count: usize,
}

impl<'o> Parser<'o> {
    fn new(tokens: Vec<Token>, opts: &'o ParseOptions) -> Self {
        Self {
            tokens,
            pos: 0,
            opts,
            builder: AstBuilder::new(opts.parser_version),
            frames: Vec::new(),
            diagnostic_count: 0,
        }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn current_block(&self) -> NodeId {
        self.frames.last().map(|f| f.block).unwrap_or(ROOT)
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        if self.diagnostic_count < self.opts.max_diagnostics {
            self.builder.diagnostics_mut().push(diagnostic);
            self.diagnostic_count += 1;
        } else {
            self.builder.mark_truncated();
        }
    }

    fn run(&mut self) {
        loop {
            let tok = self.peek().clone();
            match tok.kind {
                TokenKind::Eof => break,
                TokenKind::RBrace => {
                    self.advance();
                    self.close_block(tok.span);
                }
                TokenKind::LBrace => {
                    self.advance();
                    if !self.too_deep(tok.span) {
                        let parent = self.current_block();
                        self.open_block(parent, None, None, tok.span);
                    }
                }
                TokenKind::Error(err) => {
                    self.advance();
                    self.report(Diagnostic::error(
                        format!("{err}: `{}`", tok.text),
                        tok.span,
                    ));
                }
                kind if kind.is_operator() => {
                    self.report(Diagnostic::error(
                        format!("expected a key before {}", kind.description()),
                        tok.span,
                    ));
                    self.synchronize();
                }
                _ => self.statement(),
            }
        }

        while let Some(frame) = self.frames.pop() {
            self.report(Diagnostic::error(
                format!("unclosed '{{' opened at {}", frame.open),
                frame.open,
            ));
        }
    }

    /// A statement starting with a scalar token.
    fn statement(&mut self) {
        let key_tok = self.advance();
        let key = to_scalar(&key_tok);
        let next = self.peek().clone();

        if let Some(op) = to_operator(next.kind) {
            self.advance();
            self.value(key, op, key_tok.span);
            return;
        }

        if next.kind == TokenKind::LBrace {
            self.report(Diagnostic::warning(
                format!("missing `=` between `{}` and `{{`", key_tok.text),
                next.span,
            ));
            self.advance();
            if !self.too_deep(next.span) {
                let parent = self.current_block();
                let pair = self.push_pair(parent, key, Operator::Eq, key_tok.span);
                self.open_block(pair, Some(pair), None, next.span);
            }
            return;
        }

        let parent = self.current_block();
        let item = self.builder.push(NodeKind::Scalar(key), key_tok.span);
        self.builder.attach(parent, item);
    }

    /// The value side of `key <op> value`.
    fn value(&mut self, key: Scalar, op: Operator, key_span: Span) {
        let tok = self.peek().clone();
        let parent = self.current_block();

        if tok.kind == TokenKind::LBrace {
            self.advance();
            if self.too_deep(tok.span) {
                return;
            }
            let pair = self.push_pair(parent, key, op, key_span);
            self.open_block(pair, Some(pair), None, tok.span);
            return;
        }

        if tok.kind.is_scalar() {
            self.advance();
            if tok.kind == TokenKind::Ident && self.peek().kind == TokenKind::LBrace {
                let brace = self.advance();
                if self.too_deep(brace.span) {
                    return;
                }
                let pair = self.push_pair(parent, key, op, key_span);
                self.open_block(pair, Some(pair), Some(tok.text), brace.span);
                return;
            }
            let pair = self.push_pair(parent, key, op, key_span.to(tok.span));
            let value = self.builder.push(NodeKind::Scalar(to_scalar(&tok)), tok.span);
            self.builder.attach(pair, value);
            return;
        }

        // Leave the offending token for the main loop so a `}` still closes
        // its block.
        self.report(Diagnostic::error(
            format!(
                "expected a value after `{}`, found {}",
                op,
                tok.kind.description()
            ),
            tok.span,
        ));
    }

    fn push_pair(&mut self, parent: NodeId, key: Scalar, op: Operator, span: Span) -> NodeId {
        let kind = if op.is_assignment() {
            NodeKind::Assignment { key, op }
        } else {
            NodeKind::Comparison { key, op }
        };
        let pair = self.builder.push(kind, span);
        self.builder.attach(parent, pair);
        pair
    }

    /// Checked right after a `{` is consumed. An over-deep block is reported
    /// and skipped, and nothing is attached for it.
    fn too_deep(&mut self, open: Span) -> bool {
        if self.frames.len() < self.opts.max_depth {
            return false;
        }
        self.report(Diagnostic::error(
            format!("nesting exceeds maximum depth of {}", self.opts.max_depth),
            open,
        ));
        self.skip_block();
        true
    }

    fn open_block(
        &mut self,
        parent: NodeId,
        owner: Option<NodeId>,
        tag: Option<String>,
        open: Span,
    ) {
        let block = self.builder.push(NodeKind::Block { tag }, open);
        self.builder.attach(parent, block);
        self.frames.push(Frame { block, owner, open });
    }

    fn close_block(&mut self, close: Span) {
        match self.frames.pop() {
            Some(frame) => {
                self.builder.set_span(frame.block, frame.open.to(close));
                if let Some(owner) = frame.owner {
                    let start = self.builder.span(owner);
                    self.builder.set_span(owner, start.to(close));
                }
            }
            None => self.report(Diagnostic::error("unmatched '}'", close)),
        }
    }

    /// Skip the body of a block whose `{` was already consumed.
    fn skip_block(&mut self) {
        let mut depth = 1usize;
        loop {
            match self.advance().kind {
                TokenKind::Eof => return,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    /// Skip past the offending token and resume at the next statement start
    /// at the current depth, or at the `}` closing the current block.
    fn synchronize(&mut self) {
        self.advance();
        let mut depth = 0usize;
        loop {
            let tok = self.peek();
            match tok.kind {
                TokenKind::Eof => return,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace if depth == 0 => return,
                TokenKind::RBrace => depth -= 1,
                kind if depth == 0
                    && kind.is_scalar()
                    && self.peek_at(1).kind.is_operator() =>
                {
                    return
                }
                _ => {}
            }
            self.advance();
        }
    }
}

fn to_scalar(tok: &Token) -> Scalar {
    let kind = match tok.kind {
        TokenKind::String => ScalarKind::String,
        TokenKind::Number => ScalarKind::Number,
        TokenKind::Percent => ScalarKind::Percent,
        TokenKind::Bool => ScalarKind::Bool,
        TokenKind::Variable => ScalarKind::Variable,
        TokenKind::InlineMath => ScalarKind::InlineMath,
        TokenKind::Parameter => ScalarKind::Parameter,
        _ => ScalarKind::Ident,
    };
    Scalar::new(kind, tok.text.clone())
}

fn to_operator(kind: TokenKind) -> Option<Operator> {
    Some(match kind {
        TokenKind::Eq => Operator::Eq,
        TokenKind::QuestionEq => Operator::QuestionEq,
        TokenKind::EqEq => Operator::EqEq,
        TokenKind::NotEq => Operator::NotEq,
        TokenKind::Lt => Operator::Lt,
        TokenKind::LtEq => Operator::LtEq,
        TokenKind::Gt => Operator::Gt,
        TokenKind::GtEq => Operator::GtEq,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockShape, Severity};
    use pretty_assertions::assert_eq;

    fn parse(src: &str) -> ScriptAst {
        parse_script(src.as_bytes(), &ParseOptions::default())
    }

    #[test]
    fn test_parse_simple_definition() {
        let ast = parse("tradition_mountain_homes = {\n\theavy_infantry_damage = 0.10\n}\n");
        assert!(ast.diagnostics.is_empty());
        assert_eq!(ast.statements().len(), 1);
        let def = ast.statements()[0];
        assert_eq!(ast.key(def).unwrap().text, "tradition_mountain_homes");
        let block = ast.value(def).unwrap();
        assert_eq!(ast.shape(block), BlockShape::Object);
        let inner = ast.children(block)[0];
        assert_eq!(ast.key(inner).unwrap().text, "heavy_infantry_damage");
        let v = ast.value(inner).unwrap();
        assert_eq!(ast.scalar(v).unwrap().kind, ScalarKind::Number);
        assert_eq!(ast.scalar(v).unwrap().text, "0.10");
    }

    #[test]
    fn test_comparisons_and_lists() {
        let ast = parse("t = { age >= 16 gold != 0 }\nl = { a b c }\nm = { { c } a }");
        assert!(ast.diagnostics.is_empty(), "{:?}", ast.diagnostics);
        let t = ast.value(ast.statements()[0]).unwrap();
        assert!(matches!(
            ast.node(ast.children(t)[0]).kind,
            NodeKind::Comparison { op: Operator::GtEq, .. }
        ));
        let l = ast.value(ast.statements()[1]).unwrap();
        assert_eq!(ast.shape(l), BlockShape::List);
        assert_eq!(ast.children(l).len(), 3);

        let m = ast.value(ast.statements()[2]).unwrap();
        assert_eq!(ast.shape(m), BlockShape::List);
        assert_eq!(ast.children(m).len(), 2);
        assert!(ast.is_block(ast.children(m)[0]));
    }

    #[test]
    fn test_key_before_brace_reads_as_assignment() {
        let ast = parse("l = { a b { c } }");
        assert_eq!(ast.diagnostics.len(), 1);
        assert_eq!(ast.diagnostics[0].severity, Severity::Warning);
        assert_eq!(ast.diagnostics[0].message, "missing `=` between `b` and `{`");
        let l = ast.value(ast.statements()[0]).unwrap();
        assert_eq!(ast.shape(l), BlockShape::Mixed);
        assert_eq!(ast.children(l).len(), 2);
        let b = ast.children(l)[1];
        assert_eq!(ast.key(b).unwrap().text, "b");
        assert_eq!(ast.shape(ast.value(b).unwrap()), BlockShape::List);
    }

    #[test]
    fn test_tagged_block() {
        let ast = parse("color = rgb { 255 0 0 }");
        assert!(ast.diagnostics.is_empty());
        let block = ast.value(ast.statements()[0]).unwrap();
        assert_eq!(
            ast.node(block).kind,
            NodeKind::Block {
                tag: Some("rgb".to_string())
            }
        );
        assert_eq!(ast.children(block).len(), 3);
    }

    #[test]
    fn test_empty_block_is_plain_block() {
        let ast = parse("foo = { }");
        assert!(ast.diagnostics.is_empty());
        let block = ast.value(ast.statements()[0]).unwrap();
        assert_eq!(ast.shape(block), BlockShape::Empty);
    }

    #[test]
    fn test_missing_close_brace_keeps_partial_tree() {
        let ast = parse("foo = { bar = 1");
        assert!(!ast.diagnostics.is_empty());
        assert!(ast.diagnostics[0].message.contains("unclosed '{' opened at 1:7"));
        let foo = ast.statements()[0];
        assert_eq!(ast.key(foo).unwrap().text, "foo");
        let block = ast.value(foo).unwrap();
        let bar = ast.children(block)[0];
        assert_eq!(ast.key(bar).unwrap().text, "bar");
    }

    #[test]
    fn test_unmatched_close_brace_at_root() {
        let ast = parse("a = 1 } b = 2");
        assert_eq!(ast.diagnostics.len(), 1);
        assert_eq!(ast.diagnostics[0].message, "unmatched '}'");
        assert_eq!(ast.statements().len(), 2);
    }

    #[test]
    fn test_missing_equals_is_warning() {
        let ast = parse("foo { a = 1 }");
        assert_eq!(ast.diagnostics.len(), 1);
        assert_eq!(ast.diagnostics[0].severity, Severity::Warning);
        assert!(!ast.has_errors());
        assert_eq!(ast.key(ast.statements()[0]).unwrap().text, "foo");
    }

    #[test]
    fn test_resync_after_stray_operator() {
        let ast = parse("a = { = junk { x } b = 2 }\nc = 3");
        assert_eq!(ast.diagnostics.len(), 1);
        let a = ast.value(ast.statements()[0]).unwrap();
        let keys: Vec<_> = ast
            .children(a)
            .iter()
            .map(|c| ast.key(*c).unwrap().text.clone())
            .collect();
        assert_eq!(keys, vec!["b".to_string()]);
        assert_eq!(ast.key(ast.statements()[1]).unwrap().text, "c");
    }

    #[test]
    fn test_missing_value() {
        let ast = parse("a = { b = }\nc = 1");
        assert_eq!(ast.diagnostics.len(), 1);
        assert!(ast.diagnostics[0].message.starts_with("expected a value"));
        let a = ast.value(ast.statements()[0]).unwrap();
        assert!(ast.children(a).is_empty());
        assert_eq!(ast.statements().len(), 2);
    }

    #[test]
    fn test_lex_errors_become_diagnostics() {
        let ast = parse("a = 1 ; b = 2");
        assert_eq!(ast.diagnostics.len(), 1);
        assert_eq!(ast.statements().len(), 2);
    }

    #[test]
    fn test_depth_limit() {
        let opts = ParseOptions {
            max_depth: 3,
            ..ParseOptions::default()
        };
        let ast = parse_script(b"a = { b = { c = { d = { e = 1 } } } }\nz = 1", &opts);
        assert_eq!(ast.diagnostics.len(), 1);
        assert!(ast.diagnostics[0].message.contains("maximum depth"));
        assert_eq!(ast.statements().len(), 2);
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let depth = 100_000;
        let src = format!("{}{}", "a = { ".repeat(depth), "} ".repeat(depth));
        let ast = parse(&src);
        assert_eq!(ast.diagnostics.len(), 1);
        let json = serde_json::to_string(&ast).unwrap();
        let back: ScriptAst = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes.len(), ast.nodes.len());
    }

    #[test]
    fn test_diagnostics_are_capped() {
        let opts = ParseOptions {
            max_diagnostics: 5,
            ..ParseOptions::default()
        };
        let ast = parse_script("} ".repeat(20).as_bytes(), &opts);
        assert_eq!(ast.diagnostics.len(), 5);
        assert!(ast.diagnostics_truncated);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let src = "x = { a = 1 b = { c d } }\n# comment\n@v = 3\ny ?= @v";
        let first = parse(src);
        let second = parse(src);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_spans_cover_blocks() {
        let ast = parse("foo = {\n  a = 1\n}");
        let foo = ast.statements()[0];
        let span = ast.node(foo).span;
        assert_eq!((span.line, span.column, span.start, span.end), (1, 1, 0, 17));
    }
}
