//! Isolated, killable parse execution.
//!
//! Every parse runs under a hard wall-clock timeout. The production
//! executor runs it in a child process of the same binary; the in-process
//! one runs it on a blocking thread and abandons it on timeout.

use script_engine::{parse_document, DocumentKind, ParseOptions, ParsedDocument};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("parse timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("failed to start parse unit {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse unit exited with {status}: {stderr}")]
    Crashed { status: String, stderr: String },

    #[error("parse unit produced unreadable output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("parse unit I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse thread panicked")]
    Panicked,
}

/// Runs one parse to completion or to its timeout.
#[async_trait::async_trait]
pub trait ParseExecutor: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn parse(
        &self,
        kind: DocumentKind,
        bytes: Vec<u8>,
        options: ParseOptions,
    ) -> Result<ParsedDocument, ExecutorError>;
}

// ──────────────────────────────────────────────────────────────
// Child process
// ──────────────────────────────────────────────────────────────

/// Runs `<program> parse-unit ...` per file: bytes on stdin, JSON on stdout.
pub struct ProcessExecutor {
    program: PathBuf,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Use the running binary as the parse unit.
    pub fn current_exe(timeout: Duration) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, timeout))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait::async_trait]
impl ParseExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    async fn parse(
        &self,
        kind: DocumentKind,
        bytes: Vec<u8>,
        options: ParseOptions,
    ) -> Result<ParsedDocument, ExecutorError> {
        let mut child = Command::new(&self.program)
            .arg("parse-unit")
            .args(["--kind", kind.as_str()])
            .args(["--parser-version", &options.parser_version.to_string()])
            .args(["--max-diagnostics", &options.max_diagnostics.to_string()])
            .args(["--max-depth", &options.max_depth.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("parse unit stdin was not captured"))?;
        let feed = async move {
            stdin.write_all(&bytes).await?;
            stdin.shutdown().await
        };

        // Dropping `run` on timeout drops the child, which kills it.
        let run = async { tokio::join!(feed, child.wait_with_output()) };
        let (fed, output) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ExecutorError::Timeout(self.timeout))?;

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Crashed {
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }
        fed?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Body of the `parse-unit` child: read all of `input`, write the parsed
/// document as JSON to `output`.
pub fn run_parse_unit(
    kind: DocumentKind,
    options: &ParseOptions,
    mut input: impl Read,
    mut output: impl Write,
) -> anyhow::Result<()> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    let document = parse_document(kind, &bytes, options);
    serde_json::to_writer(&mut output, &document)?;
    output.flush()?;
    Ok(())
}

// ──────────────────────────────────────────────────────────────
// In-process
// ──────────────────────────────────────────────────────────────

type ParseFn = dyn Fn(DocumentKind, &[u8], &ParseOptions) -> ParsedDocument + Send + Sync;

/// Parses on a blocking thread. A timed-out parse is abandoned, not killed:
/// its thread runs on until the parser returns.
pub struct InProcessExecutor {
    timeout: Duration,
    parse: Arc<ParseFn>,
}

impl InProcessExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            parse: Arc::new(parse_document),
        }
    }

    /// Run `parse` instead of the real parser.
    pub fn with_parser<F>(timeout: Duration, parse: F) -> Self
    where
        F: Fn(DocumentKind, &[u8], &ParseOptions) -> ParsedDocument + Send + Sync + 'static,
    {
        Self {
            timeout,
            parse: Arc::new(parse),
        }
    }
}

#[async_trait::async_trait]
impl ParseExecutor for InProcessExecutor {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn parse(
        &self,
        kind: DocumentKind,
        bytes: Vec<u8>,
        options: ParseOptions,
    ) -> Result<ParsedDocument, ExecutorError> {
        let parse = Arc::clone(&self.parse);
        let task = tokio::task::spawn_blocking(move || parse(kind, &bytes, &options));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(document)) => Ok(document),
            Ok(Err(_)) => Err(ExecutorError::Panicked),
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "abandoning parse thread");
                Err(ExecutorError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_parse() {
        let executor = InProcessExecutor::new(Duration::from_secs(5));
        let doc = executor
            .parse(
                DocumentKind::Script,
                b"a = { b = 1 }".to_vec(),
                ParseOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(doc.as_script().unwrap().statements().len(), 1);
    }

    #[tokio::test]
    async fn test_in_process_timeout() {
        let executor = InProcessExecutor::with_parser(Duration::from_millis(20), |kind, src, opts| {
            std::thread::sleep(Duration::from_millis(400));
            parse_document(kind, src, opts)
        });
        let err = executor
            .parse(DocumentKind::Script, b"a = 1".to_vec(), ParseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)), "{err}");
        assert_eq!(err.to_string(), "parse timed out after 20ms");
    }

    #[tokio::test]
    async fn test_in_process_panic_is_an_error() {
        let executor =
            InProcessExecutor::with_parser(Duration::from_secs(5), |_, _, _| panic!("parser bug"));
        let err = executor
            .parse(DocumentKind::Script, Vec::new(), ParseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Panicked));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let executor = ProcessExecutor::new("/nonexistent/modweave", Duration::from_secs(1));
        let err = executor
            .parse(DocumentKind::Script, Vec::new(), ParseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }), "{err}");
    }

    #[test]
    fn test_run_parse_unit_writes_document_json() {
        let mut out = Vec::new();
        run_parse_unit(
            DocumentKind::Localization,
            &ParseOptions::default(),
            &b"l_english:\n key:0 \"Hello\"\n"[..],
            &mut out,
        )
        .unwrap();
        let doc: ParsedDocument = serde_json::from_slice(&out).unwrap();
        match doc {
            ParsedDocument::Localization(loc) => {
                assert_eq!(loc.language, "english");
                assert_eq!(loc.get("key").unwrap().text, "Hello");
            }
            other => panic!("expected localization, got {other:?}"),
        }
    }
}
