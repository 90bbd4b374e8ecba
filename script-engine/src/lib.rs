//! # script-engine
//!
//! Reading and reconciling the block-structured script used by strategy-game
//! mods.
//!
//! ## Pipeline
//!
//! 1. **Tokenizer** ([`lexer`]): one forward pass over raw bytes. Malformed
//!    input becomes positioned `Error` tokens; scanning never stops early.
//!
//! 2. **Recovering parser** ([`parser`]): an iterative frame-stack parser
//!    producing a flat arena tree ([`ScriptAst`]) plus diagnostics. A broken
//!    file still yields everything that could be read.
//!
//! 3. **Localization parser** ([`localization`]): the line-oriented
//!    `key:0 "text"` format.
//!
//! 4. **Extraction** ([`extract`]): symbols defined and names referenced by
//!    one parsed document, independent of which file or mod it came from.
//!
//! 5. **Resolution** ([`resolver`]): given sources in load order, decides
//!    which file copy, which definition and which merged value wins, and
//!    scores every contested key for breakage risk ([`risk`]) under the
//!    category's merge policy ([`policy`], [`merge`]).
//!
//! ## Example
//!
//! ```rust
//! use script_engine::{parse_document, DocumentKind, FileInput, ParseOptions, Resolver, SourceInput};
//!
//! let opts = ParseOptions::default();
//! let source = |id: &str, damage: &str| SourceInput {
//!     id: id.to_string(),
//!     is_base: id == "base",
//!     files: vec![FileInput::from_document(
//!         format!("common/culture/traditions/{id}.txt"),
//!         format!("{id}-hash"),
//!         parse_document(
//!             DocumentKind::Script,
//!             format!("tradition_mountain_homes = {{ heavy_infantry_damage = {damage} }}").as_bytes(),
//!             &opts,
//!         ),
//!     )],
//! };
//!
//! let sources = vec![source("base", "0.10"), source("later", "0.20")];
//! let conflicts = Resolver::default().find_conflicts(&sources);
//!
//! assert_eq!(conflicts.len(), 1);
//! assert_eq!(conflicts[0].winner.as_ref().unwrap().source, "later");
//! ```

pub mod extract;
pub mod lexer;
pub mod localization;
pub mod merge;
pub mod parser;
pub mod policy;
pub mod resolver;
pub mod risk;
pub mod token;
pub mod types;

/// Bumped whenever parser output changes shape; cached trees from another
/// version are never reused.
pub const PARSER_VERSION: u32 = 1;

// Re-export primary public API
pub use extract::{extract_references, extract_symbols, Reference, ReferenceKind, Symbol, SymbolKind};
pub use localization::{parse_localization, LocEntry, LocalizationDocument};
pub use parser::{parse_document, parse_script, DocumentKind, ParseOptions, ParsedDocument};
pub use policy::{MergePolicy, PolicyConfig, PolicyDecision, PolicyError, PolicyTable};
pub use resolver::{
    category_of, ConflictUnit, ContributionRef, EntityResolution, FileInput, FileResolution,
    PendingFile, Resolution, Resolver, SemanticKey, SourceInput, SymbolResolution,
};
pub use risk::{RiskFactor, RiskScore};
pub use types::{BlockShape, Diagnostic, Node, NodeId, NodeKind, ScriptAst, Severity};
