//! Token and span types produced by the lexer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A contiguous region of the source bytes.
///
/// `line` and `column` are 1-based and describe the first byte of the region;
/// columns are counted in bytes, not characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    /// Span covering `self` through the end of `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end.max(self.end),
            line: self.line,
            column: self.column,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Reasons the lexer could not produce a well-formed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LexError {
    UnexpectedChar,
    UnterminatedString,
    UnterminatedParameter,
    UnterminatedMath,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::UnexpectedChar => write!(f, "unrecognized character"),
            LexError::UnterminatedString => write!(f, "unterminated string literal"),
            LexError::UnterminatedParameter => write!(f, "unterminated `$` parameter"),
            LexError::UnterminatedMath => write!(f, "unterminated `@[` inline math"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Bare word: keys, enum-like values, dates, scopes (`scope:actor`).
    Ident,
    /// Quoted string; `Token::text` holds the unescaped contents.
    String,
    /// Integer or decimal, optionally negative.
    Number,
    /// Number with a `%` suffix; `Token::text` excludes the suffix.
    Percent,
    /// `yes` / `no`.
    Bool,
    /// Scripted variable reference `@name`.
    Variable,
    /// Inline math `@[ ... ]`; `Token::text` holds the inner expression.
    InlineMath,
    /// Word containing a `$PARAM$` substitution.
    Parameter,
    Eq,
    QuestionEq,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LBrace,
    RBrace,
    /// `#` comment; `Token::text` excludes the `#`.
    Comment,
    Error(LexError),
    Eof,
}

impl TokenKind {
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            TokenKind::Eq
                | TokenKind::QuestionEq
                | TokenKind::EqEq
                | TokenKind::NotEq
                | TokenKind::Lt
                | TokenKind::LtEq
                | TokenKind::Gt
                | TokenKind::GtEq
        )
    }

    /// Tokens that can stand as a key or a scalar value.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            TokenKind::Ident
                | TokenKind::String
                | TokenKind::Number
                | TokenKind::Percent
                | TokenKind::Bool
                | TokenKind::Variable
                | TokenKind::InlineMath
                | TokenKind::Parameter
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            TokenKind::Ident => "identifier",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Percent => "percentage",
            TokenKind::Bool => "boolean",
            TokenKind::Variable => "scripted variable",
            TokenKind::InlineMath => "inline math",
            TokenKind::Parameter => "parameter",
            TokenKind::Eq => "`=`",
            TokenKind::QuestionEq => "`?=`",
            TokenKind::EqEq => "`==`",
            TokenKind::NotEq => "`!=`",
            TokenKind::Lt => "`<`",
            TokenKind::LtEq => "`<=`",
            TokenKind::Gt => "`>`",
            TokenKind::GtEq => "`>=`",
            TokenKind::LBrace => "`{`",
            TokenKind::RBrace => "`}`",
            TokenKind::Comment => "comment",
            TokenKind::Error(_) => "invalid token",
            TokenKind::Eof => "end of file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            text: text.into(),
            span,
        }
    }
}
