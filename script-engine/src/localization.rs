//! Line-oriented localization files.
//!
//! ```text
//! l_english:
//!  key:0 "Text with \"quotes\""
//!  other_key: "text" # comment
//! ```
//!
//! Entry text is kept exactly as written between the first and the last
//! quote on the line.

use serde::{Deserialize, Serialize};

use crate::parser::ParseOptions;
use crate::token::Span;
use crate::types::Diagnostic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocEntry {
    pub key: String,
    pub version: Option<u32>,
    pub text: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizationDocument {
    /// Language from the `l_<language>:` header; empty when the header is missing.
    pub language: String,
    pub entries: Vec<LocEntry>,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub diagnostics_truncated: bool,
}

impl LocalizationDocument {
    pub fn get(&self, key: &str) -> Option<&LocEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

pub fn parse_localization(src: &[u8], opts: &ParseOptions) -> LocalizationDocument {
    let body = src.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(src);
    let offset = src.len() - body.len();
    let text = String::from_utf8_lossy(body);

    let mut doc = LocalizationDocument {
        language: String::new(),
        entries: Vec::new(),
        diagnostics: Vec::new(),
        diagnostics_truncated: false,
    };
    let report = |doc: &mut LocalizationDocument, d: Diagnostic| {
        if doc.diagnostics.len() < opts.max_diagnostics {
            doc.diagnostics.push(d);
        } else {
            doc.diagnostics_truncated = true;
        }
    };

    let mut line_start = offset;
    let mut header_seen = false;
    for (idx, raw) in text.split('\n').enumerate() {
        let line_no = idx as u32 + 1;
        let line = raw.trim_end_matches('\r');
        let indent = line.len() - line.trim_start().len();
        let span = Span::new(
            line_start + indent,
            line_start + line.len(),
            line_no,
            indent as u32 + 1,
        );
        line_start += raw.len() + 1;

        let content = line.trim();
        if content.is_empty() || content.starts_with('#') {
            continue;
        }

        if let Some(language) = header_language(content) {
            if header_seen {
                report(
                    &mut doc,
                    Diagnostic::warning(format!("repeated language header `{content}`"), span),
                );
            } else {
                doc.language = language.to_string();
                header_seen = true;
            }
            continue;
        }

        if !header_seen {
            report(
                &mut doc,
                Diagnostic::error("entry before the `l_<language>:` header", span),
            );
        }

        match parse_entry(content, line_no) {
            Ok(entry) => doc.entries.push(entry),
            Err(message) => report(&mut doc, Diagnostic::error(message, span)),
        }
    }

    doc
}

/// `l_english:` (optionally followed by a comment) yields `english`.
fn header_language(line: &str) -> Option<&str> {
    let head = line.split('#').next().unwrap_or(line).trim_end();
    let lang = head.strip_prefix("l_")?.strip_suffix(':')?;
    if !lang.is_empty() && lang.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Some(lang)
    } else {
        None
    }
}

fn parse_entry(line: &str, line_no: u32) -> Result<LocEntry, String> {
    let colon = line
        .find(':')
        .ok_or_else(|| format!("expected `key:` in `{line}`"))?;
    let key = &line[..colon];
    if key.is_empty() || key.contains(char::is_whitespace) || key.contains('"') {
        return Err(format!("invalid localization key `{key}`"));
    }

    let rest = &line[colon + 1..];
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let version = if digits_end == 0 {
        None
    } else {
        rest[..digits_end].parse().ok()
    };

    let after = rest[digits_end..].trim_start();
    if !after.starts_with('"') {
        return Err(format!("expected quoted text after `{key}:`"));
    }
    let close = after.rfind('"').unwrap_or(0);
    if close == 0 {
        return Err(format!("unterminated text for `{key}`"));
    }

    Ok(LocEntry {
        key: key.to_string(),
        version,
        text: after[1..close].to_string(),
        line: line_no,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn parse(src: &str) -> LocalizationDocument {
        parse_localization(src.as_bytes(), &ParseOptions::default())
    }

    #[test]
    fn test_parse_entries() {
        let doc = parse(
            "\u{feff}l_english:\n # heading\n key:0 \"Text with \\\"quotes\\\"\"\n other_key: \"plain\" # trailing\n",
        );
        assert!(doc.diagnostics.is_empty(), "{:?}", doc.diagnostics);
        assert_eq!(doc.language, "english");
        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.entries[0].key, "key");
        assert_eq!(doc.entries[0].version, Some(0));
        assert_eq!(doc.entries[0].text, "Text with \\\"quotes\\\"");
        assert_eq!(doc.entries[0].line, 3);
        assert_eq!(doc.get("other_key").unwrap().version, None);
        assert_eq!(doc.get("other_key").unwrap().text, "plain");
    }

    #[test]
    fn test_malformed_lines_recover() {
        let doc = parse("l_german:\n good:0 \"ja\"\n broken line\n bad:0 \"open\n after:1 \"still read\"\r\n");
        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.entries[1].key, "after");
        assert_eq!(doc.diagnostics.len(), 2);
        assert_eq!(doc.diagnostics[0].span.line, 3);
        assert_eq!(doc.diagnostics[0].span.column, 2);
        assert_eq!(doc.diagnostics[1].span.line, 4);
    }

    #[test]
    fn test_missing_header() {
        let doc = parse("key:0 \"text\"\n");
        assert_eq!(doc.language, "");
        assert_eq!(doc.entries.len(), 1);
        assert_eq!(doc.diagnostics[0].severity, Severity::Error);
    }
}
