//! Single-pass tokenizer over raw script bytes.
//!
//! The lexer walks the input once, left to right, and never rewrites it.
//! Anything it cannot classify becomes a positioned [`TokenKind::Error`]
//! token and scanning carries on, so a single stray byte never hides the
//! rest of a file from the parser.
//!
//! ```rust
//! use script_engine::lexer::tokenize;
//! use script_engine::token::TokenKind;
//!
//! let tokens = tokenize(b"age >= 16");
//! assert_eq!(tokens[0].kind, TokenKind::Ident);
//! assert_eq!(tokens[1].kind, TokenKind::GtEq);
//! assert_eq!(tokens[2].kind, TokenKind::Number);
//! assert_eq!(tokens[3].kind, TokenKind::Eof);
//! ```

use crate::token::{LexError, Span, Token, TokenKind};

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    column: u32,
    done: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src [u8]) -> Self {
        let pos = if src.starts_with(BOM) { BOM.len() } else { 0 };
        Self {
            src,
            pos,
            line: 1,
            column: 1,
            done: false,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(byte)
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0C) {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn text(&self, start: usize) -> String {
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        let start = self.pos;
        let (line, column) = (self.line, self.column);
        let Some(byte) = self.bump() else {
            return Token::new(TokenKind::Eof, "", Span::new(start, start, line, column));
        };

        let kind = match byte {
            b'#' => {
                while let Some(b) = self.peek() {
                    if b == b'\n' {
                        break;
                    }
                    self.bump();
                }
                let text = String::from_utf8_lossy(&self.src[start + 1..self.pos])
                    .trim_end_matches('\r')
                    .to_string();
                let span = Span::new(start, self.pos, line, column);
                return Token::new(TokenKind::Comment, text, span);
            }
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'=' => self.with_eq(TokenKind::EqEq, TokenKind::Eq),
            b'<' => self.with_eq(TokenKind::LtEq, TokenKind::Lt),
            b'>' => self.with_eq(TokenKind::GtEq, TokenKind::Gt),
            b'?' => self.with_eq(TokenKind::QuestionEq, TokenKind::Error(LexError::UnexpectedChar)),
            b'!' => self.with_eq(TokenKind::NotEq, TokenKind::Error(LexError::UnexpectedChar)),
            b'"' => return self.string(start, line, column),
            b'@' => return self.variable(start, line, column),
            b'+' if self.peek().is_some_and(|b| b.is_ascii_digit()) => {
                return self.word(start, line, column)
            }
            b if is_word_byte(b) || b == b'$' => return self.word(start, line, column),
            _ => TokenKind::Error(LexError::UnexpectedChar),
        };

        let span = Span::new(start, self.pos, line, column);
        Token::new(kind, self.text(start), span)
    }

    fn with_eq(&mut self, with: TokenKind, without: TokenKind) -> TokenKind {
        if self.peek() == Some(b'=') {
            self.bump();
            with
        } else {
            without
        }
    }

    fn string(&mut self, start: usize, line: u32, column: u32) -> Token {
        let mut buf = Vec::new();
        loop {
            match self.bump() {
                None => {
                    let span = Span::new(start, self.pos, line, column);
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    return Token::new(TokenKind::Error(LexError::UnterminatedString), text, span);
                }
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'"') => buf.push(b'"'),
                    Some(b'\\') => buf.push(b'\\'),
                    Some(b'n') => buf.push(b'\n'),
                    Some(b't') => buf.push(b'\t'),
                    Some(other) => {
                        buf.push(b'\\');
                        buf.push(other);
                    }
                    None => buf.push(b'\\'),
                },
                Some(b) => buf.push(b),
            }
        }
        let span = Span::new(start, self.pos, line, column);
        Token::new(TokenKind::String, String::from_utf8_lossy(&buf).into_owned(), span)
    }

    fn variable(&mut self, start: usize, line: u32, column: u32) -> Token {
        if self.peek() == Some(b'[') {
            self.bump();
            let inner_start = self.pos;
            let mut depth = 1usize;
            while let Some(b) = self.bump() {
                match b {
                    b'[' => depth += 1,
                    b']' => {
                        depth -= 1;
                        if depth == 0 {
                            let inner = String::from_utf8_lossy(&self.src[inner_start..self.pos - 1])
                                .trim()
                                .to_string();
                            let span = Span::new(start, self.pos, line, column);
                            return Token::new(TokenKind::InlineMath, inner, span);
                        }
                    }
                    _ => {}
                }
            }
            let span = Span::new(start, self.pos, line, column);
            return Token::new(TokenKind::Error(LexError::UnterminatedMath), self.text(start), span);
        }

        while self.peek().is_some_and(is_word_byte) {
            self.bump();
        }
        let span = Span::new(start, self.pos, line, column);
        if self.pos - start == 1 {
            return Token::new(TokenKind::Error(LexError::UnexpectedChar), "@", span);
        }
        Token::new(TokenKind::Variable, self.text(start), span)
    }

    fn word(&mut self, start: usize, line: u32, column: u32) -> Token {
        while self.peek().is_some_and(|b| is_word_byte(b) || b == b'$') {
            self.bump();
        }
        let text = self.text(start);
        let span = Span::new(start, self.pos, line, column);

        let dollars = text.bytes().filter(|b| *b == b'$').count();
        if dollars > 0 {
            let kind = if dollars % 2 == 0 {
                TokenKind::Parameter
            } else {
                TokenKind::Error(LexError::UnterminatedParameter)
            };
            return Token::new(kind, text, span);
        }

        if text == "yes" || text == "no" {
            return Token::new(TokenKind::Bool, text, span);
        }
        if is_number(&text) {
            return Token::new(TokenKind::Number, text, span);
        }
        if let Some(number) = text.strip_suffix('%') {
            if is_number(number) {
                return Token::new(TokenKind::Percent, number, span);
            }
        }
        Token::new(TokenKind::Ident, text, span)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.done {
            return None;
        }
        let token = self.next_token();
        if token.kind == TokenKind::Eof {
            self.done = true;
        }
        Some(token)
    }
}

/// Tokenize a whole buffer. The last token is always [`TokenKind::Eof`].
pub fn tokenize(src: &[u8]) -> Vec<Token> {
    Lexer::new(src).collect()
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(b, b'_' | b'.' | b':' | b'-' | b'\'' | b'/' | b'%')
        || b >= 0x80
}

/// `-?digits(.digits)?`, with an optional leading `+`.
fn is_number(text: &str) -> bool {
    let body = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    let mut parts = body.splitn(2, '.');
    let int = parts.next().unwrap_or("");
    let frac = parts.next();
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match frac {
        None => digits(int),
        Some(frac) => digits(int) && digits(frac),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src.as_bytes()).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_assignment_and_block() {
        assert_eq!(
            kinds("foo = { bar = 1 }"),
            vec![
                TokenKind::Ident,
                TokenKind::Eq,
                TokenKind::LBrace,
                TokenKind::Ident,
                TokenKind::Eq,
                TokenKind::Number,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("= < > <= >= != == ?="),
            vec![
                TokenKind::Eq,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::NotEq,
                TokenKind::EqEq,
                TokenKind::QuestionEq,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize(b"-5 0.10 -0.25 10% +3 1066.9.15");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text, "-5");
        assert_eq!(tokens[1].kind, TokenKind::Number);
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[3].kind, TokenKind::Percent);
        assert_eq!(tokens[3].text, "10");
        assert_eq!(tokens[4].kind, TokenKind::Number);
        // Dates are words, not numbers.
        assert_eq!(tokens[5].kind, TokenKind::Ident);
        assert_eq!(tokens[5].text, "1066.9.15");
    }

    #[test]
    fn test_booleans_and_idents() {
        let tokens = tokenize(b"yes no yesterday scope:actor my_events.0001");
        assert_eq!(tokens[0].kind, TokenKind::Bool);
        assert_eq!(tokens[1].kind, TokenKind::Bool);
        assert_eq!(tokens[2].kind, TokenKind::Ident);
        assert_eq!(tokens[3].text, "scope:actor");
        assert_eq!(tokens[4].text, "my_events.0001");
    }

    #[test]
    fn test_strings_with_escapes() {
        let tokens = tokenize(br#"desc = "say \"hi\"\n" path = "a\b""#);
        assert_eq!(tokens[2].kind, TokenKind::String);
        assert_eq!(tokens[2].text, "say \"hi\"\n");
        assert_eq!(tokens[5].text, "a\\b");
    }

    #[test]
    fn test_unterminated_string_is_positioned_error() {
        let tokens = tokenize(b"a = \"oops");
        assert_eq!(tokens[2].kind, TokenKind::Error(LexError::UnterminatedString));
        assert_eq!(tokens[2].span.column, 5);
        assert_eq!(tokens[3].kind, TokenKind::Eof);
    }

    #[test]
    fn test_comments() {
        let tokens = tokenize(b"a = 1 # trailing\r\nb = 2");
        assert_eq!(tokens[3].kind, TokenKind::Comment);
        assert_eq!(tokens[3].text, " trailing");
        assert_eq!(tokens[4].text, "b");
        assert_eq!(tokens[4].span.line, 2);
    }

    #[test]
    fn test_variables_and_parameters() {
        let tokens = tokenize(b"@cost = 5 value = @cost x = @[ cost * 2 ] $SKILL$_diff = 1 has_$T$ = yes");
        assert_eq!(tokens[0].kind, TokenKind::Variable);
        assert_eq!(tokens[0].text, "@cost");
        assert_eq!(tokens[5].kind, TokenKind::Variable);
        assert_eq!(tokens[8].kind, TokenKind::InlineMath);
        assert_eq!(tokens[8].text, "cost * 2");
        assert_eq!(tokens[9].kind, TokenKind::Parameter);
        assert_eq!(tokens[9].text, "$SKILL$_diff");
        assert_eq!(tokens[12].kind, TokenKind::Parameter);
    }

    #[test]
    fn test_unterminated_parameter() {
        let tokens = tokenize(b"$BROKEN = 1");
        assert_eq!(tokens[0].kind, TokenKind::Error(LexError::UnterminatedParameter));
        assert_eq!(tokens[1].kind, TokenKind::Eq);
    }

    #[test]
    fn test_bom_is_skipped() {
        let mut src = BOM.to_vec();
        src.extend_from_slice(b"a = b");
        let tokens = tokenize(&src);
        assert_eq!(tokens[0].kind, TokenKind::Ident);
        assert_eq!(tokens[0].span.column, 1);
        assert_eq!(tokens[0].span.start, 3);
    }

    #[test]
    fn test_unrecognized_characters_do_not_stop_scan() {
        let tokens = tokenize(b"a = 1; b = ( 2 )");
        let errors: Vec<_> = tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Error(_)))
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(errors, vec![";", "(", ")"]);
        assert!(tokens.iter().any(|t| t.text == "b"));
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_line_and_column_tracking() {
        let tokens = tokenize(b"a = {\n    b = 2\n}");
        let b = tokens.iter().find(|t| t.text == "b").unwrap();
        assert_eq!((b.span.line, b.span.column), (2, 5));
        let close = tokens.iter().find(|t| t.kind == TokenKind::RBrace).unwrap();
        assert_eq!((close.span.line, close.span.column), (3, 1));
    }

    #[test]
    fn test_non_ascii_words() {
        let tokens = tokenize("name = Þórr".as_bytes());
        assert_eq!(tokens[2].kind, TokenKind::Ident);
        assert_eq!(tokens[2].text, "Þórr");
    }

    #[test]
    fn test_iterator_stops_after_eof() {
        let mut lexer = Lexer::new(b"");
        assert_eq!(lexer.next().map(|t| t.kind), Some(TokenKind::Eof));
        assert!(lexer.next().is_none());
    }
}
