//! Read-only load-order queries against a store.
//!
//! Builds resolver inputs from whatever the worker has produced so far.
//! Files whose tree is not cached yet are reported as pending; nothing here
//! parses or writes.

use dashmap::DashMap;
use script_engine::{
    ConflictUnit, FileInput, FileResolution, ParsedDocument, PolicyError, PolicyTable, Resolution,
    Resolver, SourceInput, SymbolResolution,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::{ContentRoot, Settings};
use crate::hash::ContentHash;
use crate::model::FileRecord;
use crate::router::{Router, RoutingError};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the merge-policy table at `path`, or the built-in one.
pub fn load_policies(path: Option<&Path>) -> Result<PolicyTable, QueryError> {
    match path {
        None => Ok(PolicyTable::default()),
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|source| QueryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(PolicyTable::from_json(&json)?)
        }
    }
}

/// Load the routing table at `path`, or the built-in one.
pub fn load_router(path: Option<&Path>) -> Result<Router, RoutingError> {
    match path {
        None => Ok(Router::default()),
        Some(path) => Router::from_path(path),
    }
}

pub struct LoadOrderQuery {
    store: Arc<Store>,
    router: Router,
    resolver: Resolver,
    parser_version: u32,
    documents: DashMap<ContentHash, Arc<ParsedDocument>>,
}

impl LoadOrderQuery {
    pub fn new(store: Arc<Store>, router: Router, resolver: Resolver, parser_version: u32) -> Self {
        Self {
            store,
            router,
            resolver,
            parser_version,
            documents: DashMap::new(),
        }
    }

    /// Open the configured store read-only with the configured tables.
    pub fn from_settings(settings: &Settings, data_dir: &Path) -> Result<Self, QueryError> {
        let store = Store::open(&settings.store_path(data_dir))?;
        let router = load_router(settings.routing.as_deref())?;
        let policies = load_policies(settings.policies.as_deref())?;
        Ok(Self::new(
            Arc::new(store),
            router,
            Resolver::new(policies),
            script_engine::PARSER_VERSION,
        ))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolver input for `roots`, in the given load order. Only files the
    /// router sends through a parse step take part.
    pub fn sources(&self, roots: &[ContentRoot]) -> Result<Vec<SourceInput>, QueryError> {
        roots
            .iter()
            .map(|root| {
                let mut files = Vec::new();
                for record in self.store.active_files(Some(&root.id))? {
                    if self.router.route(&record.relative_path).parse_kind().is_none() {
                        continue;
                    }
                    files.push(self.file_input(record)?);
                }
                Ok(SourceInput {
                    id: root.id.clone(),
                    is_base: root.base,
                    files,
                })
            })
            .collect()
    }

    pub fn resolve(&self, roots: &[ContentRoot]) -> Result<Resolution, QueryError> {
        Ok(self.resolver.resolve(&self.sources(roots)?))
    }

    pub fn resolve_files(&self, roots: &[ContentRoot]) -> Result<Vec<FileResolution>, QueryError> {
        Ok(self.resolver.resolve_files(&self.sources(roots)?))
    }

    pub fn resolve_symbols(
        &self,
        roots: &[ContentRoot],
    ) -> Result<Vec<SymbolResolution>, QueryError> {
        Ok(self.resolver.resolve_symbols(&self.sources(roots)?))
    }

    pub fn find_conflicts(&self, roots: &[ContentRoot]) -> Result<Vec<ConflictUnit>, QueryError> {
        Ok(self.resolver.find_conflicts(&self.sources(roots)?))
    }

    fn file_input(&self, record: FileRecord) -> Result<FileInput, QueryError> {
        let hash = record.fingerprint.content_hash;
        let Some(document) = self.document(&hash)? else {
            return Ok(FileInput::pending(record.relative_path, hash.as_str()));
        };
        Ok(FileInput {
            symbols: self.store.symbols_for(&hash, self.parser_version)?,
            references: self.store.references_for(&hash, self.parser_version)?,
            relative_path: record.relative_path,
            content_hash: hash.as_str().to_string(),
            document: Some(document),
        })
    }

    fn document(&self, hash: &ContentHash) -> Result<Option<Arc<ParsedDocument>>, QueryError> {
        if let Some(doc) = self.documents.get(hash) {
            return Ok(Some(Arc::clone(doc.value())));
        }
        let Some(doc) = self.store.get_ast(hash, self.parser_version)? else {
            return Ok(None);
        };
        debug!(content_hash = %hash.short(), "loaded cached tree");
        let doc = Arc::new(doc);
        self.documents.insert(hash.clone(), Arc::clone(&doc));
        Ok(Some(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::WriterLock;
    use crate::model::Fingerprint;
    use crate::store::StoreWriter;
    use script_engine::{extract_references, extract_symbols, parse_document, ParseOptions};

    fn ingest(store: &StoreWriter, root: &str, rel: &str, src: &str, parse: bool) {
        let bytes = src.as_bytes();
        let hash = store.put_content(bytes).unwrap();
        let fp = Fingerprint {
            path: PathBuf::from(format!("/{root}/{rel}")),
            mtime_ns: 1,
            size: bytes.len() as u64,
            content_hash: hash.clone(),
        };
        store.record_file(root, rel, &fp).unwrap();
        if parse {
            let kind = Router::default().route(rel).parse_kind().unwrap();
            let doc = parse_document(kind, bytes, &ParseOptions::default());
            store.put_ast(&hash, 1, &doc).unwrap();
            store.replace_symbols(&hash, 1, &extract_symbols(&doc)).unwrap();
            store
                .replace_references(&hash, 1, &extract_references(&doc))
                .unwrap();
        }
    }

    fn root(id: &str, base: bool) -> ContentRoot {
        ContentRoot {
            id: id.to_string(),
            path: PathBuf::from(format!("/{id}")),
            base,
        }
    }

    fn query(dir: &Path) -> (StoreWriter, LoadOrderQuery) {
        let path = dir.join("store.db");
        let writer = StoreWriter::open(WriterLock::acquire(&path).unwrap()).unwrap();
        let reader = Store::open(&path).unwrap();
        let query = LoadOrderQuery::new(
            Arc::new(reader),
            Router::default(),
            Resolver::default(),
            1,
        );
        (writer, query)
    }

    #[test]
    fn test_override_scenario_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, query) = query(dir.path());
        let rel = "common/culture/traditions/00_traditions.txt";
        ingest(
            &writer,
            "base",
            rel,
            "tradition_mountain_homes = { heavy_infantry_damage = 0.10 }",
            true,
        );
        ingest(
            &writer,
            "later",
            "common/culture/traditions/zz_later.txt",
            "tradition_mountain_homes = { heavy_infantry_damage = 0.20 }",
            true,
        );

        let roots = vec![root("base", true), root("later", false)];
        let conflicts = query.find_conflicts(&roots).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].contributors.len(), 2);
        assert_eq!(conflicts[0].winner.as_ref().unwrap().source, "later");

        let resolution = query.resolve(&roots).unwrap();
        assert!(resolution.pending.is_empty());
        let entity = &resolution.entities[0];
        assert_eq!(
            entity.value.render(script_engine::types::ROOT),
            "tradition_mountain_homes = {\n\theavy_infantry_damage = 0.20\n}\n"
        );

        // Same query again: identical answer.
        assert_eq!(query.find_conflicts(&roots).unwrap(), conflicts);
    }

    #[test]
    fn test_unparsed_files_are_pending_and_raw_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, query) = query(dir.path());
        ingest(&writer, "m", "events/a.txt", "namespace = a", false);
        ingest(&writer, "m", "descriptor.mod", "name = x", false);

        let resolution = query.resolve(&[root("m", false)]).unwrap();
        assert_eq!(resolution.pending.len(), 1);
        assert_eq!(resolution.pending[0].relative_path, "events/a.txt");
        assert!(resolution.files.iter().all(|f| f.relative_path != "descriptor.mod"));
    }

    #[test]
    fn test_shared_content_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, query) = query(dir.path());
        ingest(&writer, "a", "common/traits/t.txt", "brave = { }", true);
        ingest(&writer, "b", "common/traits/t.txt", "brave = { }", true);

        let files = query
            .resolve_files(&[root("a", true), root("b", false)])
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].winner, "b");
        assert_eq!(files[0].replaced, vec!["a".to_string()]);
        assert_eq!(query.documents.len(), 1);
    }

    #[test]
    fn test_symbol_resolution_from_records() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, query) = query(dir.path());
        ingest(&writer, "a", "common/traits/a.txt", "brave = { }", true);
        ingest(&writer, "b", "common/traits/b.txt", "brave = { x = 1 }", true);

        let symbols = query
            .resolve_symbols(&[root("a", true), root("b", false)])
            .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].winner.source, "b");
        assert_eq!(symbols[0].losers.len(), 1);
    }

    #[test]
    fn test_policy_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(
            &path,
            r#"{"version": 1, "rules": [{"pattern": "common/on_action", "policy": "CONTAINER_MERGE"}]}"#,
        )
        .unwrap();
        let table = load_policies(Some(&path)).unwrap();
        assert!(table.lookup("common/on_action").confident);
        assert!(!table.lookup("common/traits").confident);
        assert!(matches!(
            load_policies(Some(&dir.path().join("missing.json"))),
            Err(QueryError::Io { .. })
        ));
    }
}
