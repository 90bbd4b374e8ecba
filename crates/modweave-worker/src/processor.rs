use modweave_core::config::{ContentRoot, Settings, WorkerSettings};
use modweave_core::discovery::{discover, fingerprint_file, locate, Change, DiscoveryError, DiscoveryReport};
use modweave_core::inbox::{Inbox, InboxError, Request};
use modweave_core::lock::{LockError, WriterLock};
use modweave_core::model::{FileRecord, ItemStatus, Priority, QueueItem};
use modweave_core::query::load_router;
use modweave_core::router::{Envelope, Router, RoutingError, Step};
use modweave_core::store::{EnqueueOutcome, StoreError, StoreWriter};
use modweave_core::ContentHash;
use script_engine::{extract_references, extract_symbols, ParseOptions, ParsedDocument};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::executor::ParseExecutor;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Another worker owns the store.
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(
        "identity violation for {path}: recorded content {recorded} but read {observed} \
         with unchanged modification time and size"
    )]
    IdentityViolation {
        path: PathBuf,
        recorded: ContentHash,
        observed: ContentHash,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Inbox(#[from] InboxError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// A request that cannot be carried out; the worker keeps running.
    #[error("{0}")]
    Rejected(String),
}

impl From<StoreError> for WorkerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IdentityViolation {
                path,
                recorded,
                observed,
            } => WorkerError::IdentityViolation {
                path,
                recorded,
                observed,
            },
            other => WorkerError::Store(other),
        }
    }
}

impl From<DiscoveryError> for WorkerError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Store(e) => e.into(),
            other => WorkerError::Rejected(other.to_string()),
        }
    }
}

impl WorkerError {
    /// Whether the worker must stop rather than skip the request or item.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WorkerError::Rejected(_))
    }
}

/// What happened to one claimed queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    /// The file version was replaced or removed after enqueue.
    Superseded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub item: QueueItem,
    pub relative_path: Option<String>,
    pub outcome: ItemOutcome,
}

/// Per-item failure that does not stop the worker.
struct ItemFailure(String);

impl<E: std::fmt::Display> From<E> for ItemFailure {
    fn from(err: E) -> Self {
        ItemFailure(err.to_string())
    }
}

/// The only process that writes to a store.
pub struct Worker {
    id: String,
    store: StoreWriter,
    inbox: Inbox,
    router: Router,
    roots: Vec<ContentRoot>,
    /// Ids of the enabled roots, in load order. Unrooted scans cover these.
    active: Vec<String>,
    executor: Arc<dyn ParseExecutor>,
    options: ParseOptions,
    settings: WorkerSettings,
}

impl Worker {
    /// Take the writer lock and open the store. Fails with
    /// [`LockError::Held`] if another worker is running on it.
    pub async fn start(
        settings: &Settings,
        data_dir: &Path,
        executor: Arc<dyn ParseExecutor>,
    ) -> Result<Self, WorkerError> {
        let lock = WriterLock::acquire(&settings.store_path(data_dir))?;
        let store = StoreWriter::open(lock)?;
        let inbox = Inbox::new(modweave_core::client::inbox_dir(data_dir)).await?;
        inbox.recover().await?;
        let router = load_router(settings.routing.as_deref())?;

        let worker = Self {
            id: format!("worker-{}", std::process::id()),
            store,
            inbox,
            router,
            roots: settings.roots.clone(),
            active: settings.active_roots().iter().map(|r| r.id.clone()).collect(),
            executor,
            options: settings.parse_options(),
            settings: settings.worker.clone(),
        };
        info!(
            worker = %worker.id,
            executor = worker.executor.name(),
            parser_version = worker.options.parser_version,
            roots = worker.roots.len(),
            "worker ready"
        );
        Ok(worker)
    }

    /// Override the parse options, parser version included.
    pub fn with_parse_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &StoreWriter {
        &self.store
    }

    /// Poll loop: drain the inbox, then work through queue items, until a
    /// shutdown signal arrives. Returns early only on a fatal error.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), WorkerError> {
        let mut poll_interval =
            tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms.max(1)));

        self.store.collect_garbage(self.options.parser_version)?;
        info!(worker = %self.id, "worker loop started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    self.drain_inbox().await?;
                    for _ in 0..self.settings.items_per_tick.max(1) {
                        if self.process_next().await?.is_none() {
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(worker = %self.id, "worker shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Apply every pending inbox request. Returns how many were applied.
    pub async fn drain_inbox(&self) -> Result<usize, WorkerError> {
        let mut applied = 0;
        while let Some((processing_path, submitted)) = self.inbox.claim_next().await? {
            debug!(request_id = %submitted.id, request = ?submitted.request, "applying inbox request");
            match self.apply(&submitted.request) {
                Ok(()) => {
                    self.inbox.ack(&processing_path).await?;
                    applied += 1;
                }
                Err(e) if !e.is_fatal() => {
                    self.inbox.reject(&processing_path, &e.to_string()).await?;
                }
                Err(e) => {
                    error!(request_id = %submitted.id, error = %e, "fatal error applying inbox request");
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    fn apply(&self, request: &Request) -> Result<(), WorkerError> {
        match request {
            Request::Enqueue { path, priority } => {
                let (root, rel) = locate(&self.roots, path).ok_or_else(|| {
                    WorkerError::Rejected(format!("{} is not under any content root", path.display()))
                })?;
                let (fingerprint, _) = fingerprint_file(path)?;
                let recorded = self.store.record_file(&root.id, &rel, &fingerprint)?;
                self.schedule(recorded.record(), *priority, true)?;
            }
            Request::Scan { root, mode } => {
                let roots: Vec<&ContentRoot> = match root {
                    Some(id) => vec![self
                        .roots
                        .iter()
                        .find(|r| &r.id == id)
                        .ok_or_else(|| WorkerError::Rejected(format!("unknown content root `{id}`")))?],
                    None => self
                        .active
                        .iter()
                        .filter_map(|id| self.roots.iter().find(|r| &r.id == id))
                        .collect(),
                };
                for root in roots {
                    let report = discover(&self.store, root, *mode)?;
                    self.apply_report(&report)?;
                }
                self.store.collect_garbage(self.options.parser_version)?;
            }
            Request::NotifyRemoved { path } => {
                if self.store.tombstone(path)?.is_none() {
                    debug!(path = %path.display(), "removal notice for unknown file");
                }
            }
            Request::Retry { item_id } => {
                if !self.store.retry(*item_id)? {
                    return Err(WorkerError::Rejected(format!(
                        "queue item {item_id} is not in error"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record and queue what a discovery pass found.
    pub fn apply_report(&self, report: &DiscoveryReport) -> Result<(), WorkerError> {
        for file in &report.files {
            let record = match file.change {
                Change::Added | Change::Changed => self
                    .store
                    .record_file(&report.root_id, &file.relative_path, &file.fingerprint)?
                    .record()
                    .clone(),
                Change::Unchanged => match self.store.active_file(&file.fingerprint.path)? {
                    Some(record) => record,
                    None => continue,
                },
            };
            // Unchanged files are only requeued when their tree is missing.
            self.schedule(&record, Priority::Normal, file.change != Change::Unchanged)?;
        }
        for removed in &report.removed {
            self.store.tombstone(&removed.path)?;
        }
        Ok(())
    }

    /// Queue `record` under its envelope. Forced scheduling comes from an
    /// explicit request or a new version and may reset a failed item; the
    /// unforced kind only fills in a missing tree.
    fn schedule(&self, record: &FileRecord, priority: Priority, force: bool) -> Result<(), WorkerError> {
        let envelope = self.router.route(&record.relative_path);
        if envelope.is_skip() {
            return Ok(());
        }
        let fingerprint = record.fingerprint.token();
        let needs_tree = envelope.parse_kind().is_some()
            && !self
                .store
                .has_ast(&record.fingerprint.content_hash, self.options.parser_version)?;

        if force {
            let outcome = self
                .store
                .enqueue(record.id, &envelope.name, priority, &fingerprint)?;
            // A completed item for this version predates the current parser.
            if let EnqueueOutcome::Duplicate(id) = outcome {
                if needs_tree {
                    self.store.reopen(id)?;
                }
            }
            return Ok(());
        }

        if !needs_tree {
            return Ok(());
        }
        match self
            .store
            .queue_item_for(record.id, &envelope.name, &fingerprint)?
        {
            None => {
                self.store
                    .enqueue(record.id, &envelope.name, priority, &fingerprint)?;
            }
            Some(item) if item.status == ItemStatus::Complete => {
                self.store.reopen(item.id)?;
            }
            // Failed items wait for an explicit retry.
            Some(_) => {}
        }
        Ok(())
    }

    /// Claim and run one queue item. `None` when the queue is empty.
    pub async fn process_next(&self) -> Result<Option<Processed>, WorkerError> {
        let stale_after = Duration::from_secs(self.settings.stale_claim_secs);
        let Some(item) = self.store.claim_next(&self.id, stale_after)? else {
            return Ok(None);
        };

        let record = self
            .store
            .file(item.file_id)?
            .filter(|r| r.active && r.fingerprint.token() == item.fingerprint);
        let Some(record) = record else {
            debug!(item_id = item.id, "file version superseded; nothing to do");
            self.store.complete(item.id)?;
            return Ok(Some(Processed {
                item,
                relative_path: None,
                outcome: ItemOutcome::Superseded,
            }));
        };

        let outcome = match self.router.envelope(&item.envelope) {
            None => ItemOutcome::Failed(format!("unknown envelope `{}`", item.envelope)),
            Some(envelope) => match self.execute(&item, &record, envelope).await? {
                Ok(()) => ItemOutcome::Completed,
                Err(ItemFailure(message)) => ItemOutcome::Failed(message),
            },
        };

        match &outcome {
            ItemOutcome::Failed(message) => {
                self.store.fail(item.id, message)?;
            }
            _ => {
                self.store.complete(item.id)?;
                debug!(
                    item_id = item.id,
                    path = %record.relative_path,
                    envelope = %item.envelope,
                    "item complete"
                );
            }
        }
        Ok(Some(Processed {
            item,
            relative_path: Some(record.relative_path),
            outcome,
        }))
    }

    /// Run the envelope's steps. The outer error is fatal; the inner one
    /// fails only this item.
    async fn execute(
        &self,
        item: &QueueItem,
        record: &FileRecord,
        envelope: &Envelope,
    ) -> Result<Result<(), ItemFailure>, WorkerError> {
        let hash = &record.fingerprint.content_hash;
        let version = self.options.parser_version;
        let mut bytes: Option<Vec<u8>> = None;
        let mut document: Option<ParsedDocument> = None;

        for &step in &envelope.steps {
            match step {
                Step::Store => match self.store_step(item, record)? {
                    Ok(read) => bytes = Some(read),
                    Err(failure) => return Ok(Err(failure)),
                },
                Step::Parse | Step::ParseLocalization => {
                    if let Some(cached) = self.store.get_ast(hash, version)? {
                        document = Some(cached);
                        continue;
                    }
                    let input = match bytes.take() {
                        Some(b) => b,
                        None => match self.store.get_content(hash)? {
                            Some(b) => b,
                            None => return Ok(Err(ItemFailure(format!("content {hash} missing")))),
                        },
                    };
                    let Some(kind) = step.document_kind() else {
                        continue;
                    };
                    match self.executor.parse(kind, input, self.options).await {
                        Ok(doc) => {
                            self.store.put_ast(hash, version, &doc)?;
                            debug!(
                                item_id = item.id,
                                content_hash = %hash.short(),
                                diagnostics = doc.diagnostics().len(),
                                "parsed"
                            );
                            document = Some(doc);
                        }
                        Err(e) => return Ok(Err(e.into())),
                    }
                }
                Step::ExtractSymbols | Step::ExtractReferences => {
                    if document.is_none() {
                        document = self.store.get_ast(hash, version)?;
                    }
                    let Some(doc) = document.as_ref() else {
                        return Ok(Err(ItemFailure(format!("no tree for {hash} to extract from"))));
                    };
                    if step == Step::ExtractSymbols {
                        self.store.replace_symbols(hash, version, &extract_symbols(doc))?;
                    } else {
                        self.store
                            .replace_references(hash, version, &extract_references(doc))?;
                    }
                }
            }
        }
        Ok(Ok(()))
    }

    /// Read the file and check it is still the version the item names.
    fn store_step(
        &self,
        item: &QueueItem,
        record: &FileRecord,
    ) -> Result<Result<Vec<u8>, ItemFailure>, WorkerError> {
        let path = &record.fingerprint.path;
        let (observed, bytes) = match fingerprint_file(path) {
            Ok(read) => read,
            Err(e) => return Ok(Err(e.into())),
        };

        if observed.content_hash != record.fingerprint.content_hash {
            if observed.stat() == record.fingerprint.stat() {
                return Err(WorkerError::IdentityViolation {
                    path: path.clone(),
                    recorded: record.fingerprint.content_hash.clone(),
                    observed: observed.content_hash,
                });
            }
        } else if observed.stat() == record.fingerprint.stat() {
            self.store.put_content(&bytes)?;
            return Ok(Ok(bytes));
        }

        // Modified since enqueue: this item is stale, the new version gets
        // its own item.
        warn!(item_id = item.id, path = %record.relative_path, "file changed since enqueue");
        let recorded = self
            .store
            .record_file(&record.root_id, &record.relative_path, &observed)?;
        self.schedule(recorded.record(), item.priority, true)?;
        Ok(Err(ItemFailure(format!(
            "stale: {} changed after it was queued (now {})",
            record.relative_path,
            observed.token()
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InProcessExecutor;
    use modweave_core::client::Client;
    use modweave_core::config::ActiveSource;
    use modweave_core::discovery::ScanMode;
    use modweave_core::LoadOrderQuery;
    use pretty_assertions::assert_eq;
    use script_engine::parse_document;
    use std::fs;

    struct Env {
        dir: tempfile::TempDir,
        settings: Settings,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut settings = Settings::default();
            for (id, base) in [("game", true), ("mod", false)] {
                let path = dir.path().join(id);
                fs::create_dir_all(&path).unwrap();
                settings.roots.push(ContentRoot {
                    id: id.to_string(),
                    path,
                    base,
                });
                settings.load_order.push(ActiveSource {
                    id: id.to_string(),
                    enabled: true,
                });
            }
            Self { dir, settings }
        }

        fn data(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, root: &str, rel: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(root).join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        async fn worker(&self, executor: Arc<dyn ParseExecutor>) -> Worker {
            Worker::start(&self.settings, self.data(), executor).await.unwrap()
        }

        async fn client(&self) -> Client {
            Client::open(self.data()).await.unwrap()
        }
    }

    fn in_process() -> Arc<dyn ParseExecutor> {
        Arc::new(InProcessExecutor::new(Duration::from_secs(10)))
    }

    async fn process_all(worker: &Worker) -> Vec<Processed> {
        let mut done = Vec::new();
        while let Some(p) = worker.process_next().await.unwrap() {
            done.push(p);
        }
        done
    }

    #[tokio::test]
    async fn test_scan_then_process_populates_store() {
        let env = Env::new();
        let traditions = "common/culture/traditions/00_traditions.txt";
        env.write("game", traditions, "tradition_mountain_homes = { heavy_infantry_damage = 0.10 }");
        env.write(
            "mod",
            "common/culture/traditions/zz_mod.txt",
            "tradition_mountain_homes = { heavy_infantry_damage = 0.20 }",
        );
        env.write("mod", "localization/english/mod_l_english.yml", "l_english:\n key:0 \"Hi\"\n");
        env.write("mod", "gfx/icon.dds", "binary");

        let worker = env.worker(in_process()).await;
        env.client().await.enqueue_scan(None, ScanMode::Quick).await.unwrap();
        assert_eq!(worker.drain_inbox().await.unwrap(), 1);

        let done = process_all(&worker).await;
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|p| p.outcome == ItemOutcome::Completed));
        assert_eq!(worker.store().stats().unwrap().asts, 3);
        assert_eq!(worker.store().symbol_locations("key", 1).unwrap().len(), 1);

        let roots: Vec<ContentRoot> = env.settings.active_roots().into_iter().cloned().collect();
        let query = LoadOrderQuery::from_settings(&env.settings, env.data()).unwrap();
        let conflicts = query.find_conflicts(&roots).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].winner.as_ref().unwrap().source, "mod");
    }

    #[tokio::test]
    async fn test_second_worker_is_refused() {
        let env = Env::new();
        let _first = env.worker(in_process()).await;
        let second = Worker::start(&env.settings, env.data(), in_process()).await;
        assert!(matches!(second, Err(WorkerError::Lock(LockError::Held { .. }))));
    }

    #[tokio::test]
    async fn test_timeout_fails_only_that_item() {
        let env = Env::new();
        env.write("mod", "events/slow.txt", "slow = yes");
        env.write("mod", "events/fast.txt", "fast = yes");
        let executor = InProcessExecutor::with_parser(Duration::from_millis(50), |kind, src, opts| {
            if src.starts_with(b"slow") {
                std::thread::sleep(Duration::from_millis(500));
            }
            parse_document(kind, src, opts)
        });
        let worker = env.worker(Arc::new(executor)).await;
        env.client().await.enqueue_scan(Some("mod"), ScanMode::Full).await.unwrap();
        worker.drain_inbox().await.unwrap();

        let done = process_all(&worker).await;
        let outcome = |name: &str| {
            done.iter()
                .find(|p| p.relative_path.as_deref() == Some(name))
                .map(|p| p.outcome.clone())
                .unwrap()
        };
        assert_eq!(outcome("events/fast.txt"), ItemOutcome::Completed);
        assert!(matches!(outcome("events/slow.txt"), ItemOutcome::Failed(m) if m.contains("timed out")));

        let errors = worker.store().queue_items(Some(ItemStatus::Error), 10).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].error.as_deref().unwrap().contains("timed out"));

        // A rescan leaves the failure visible instead of retrying it.
        env.client().await.enqueue_scan(Some("mod"), ScanMode::Quick).await.unwrap();
        worker.drain_inbox().await.unwrap();
        let counts = worker.store().queue_counts().unwrap();
        assert_eq!((counts.pending, counts.error), (0, 1));
    }

    #[tokio::test]
    async fn test_flash_enqueue_jumps_scan_backlog() {
        let env = Env::new();
        for name in ["a", "b", "c"] {
            env.write("game", &format!("events/{name}.txt"), &format!("{name} = yes"));
        }
        let touched = env.write("mod", "events/touched.txt", "touched = yes");
        let worker = env.worker(in_process()).await;
        let client = env.client().await;
        client.enqueue_scan(Some("game"), ScanMode::Quick).await.unwrap();
        client.enqueue(&touched, Priority::Flash).await.unwrap();
        worker.drain_inbox().await.unwrap();

        let first = worker.process_next().await.unwrap().unwrap();
        assert_eq!(first.relative_path.as_deref(), Some("events/touched.txt"));
        assert_eq!(first.item.priority, Priority::Flash);
    }

    #[tokio::test]
    async fn test_reenqueue_of_unchanged_file_is_noop() {
        let env = Env::new();
        let path = env.write("mod", "events/a.txt", "a = yes");
        let worker = env.worker(in_process()).await;
        let client = env.client().await;
        client.enqueue(&path, Priority::Normal).await.unwrap();
        client.enqueue(&path, Priority::Normal).await.unwrap();
        assert_eq!(worker.drain_inbox().await.unwrap(), 2);
        assert_eq!(worker.store().queue_counts().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_parser_version_bump_reparses() {
        let env = Env::new();
        env.write("mod", "events/a.txt", "a = yes");
        {
            let worker = env.worker(in_process()).await;
            env.client().await.enqueue_scan(None, ScanMode::Quick).await.unwrap();
            worker.drain_inbox().await.unwrap();
            process_all(&worker).await;
            let hash = ContentHash::of(b"a = yes");
            assert!(worker.store().has_ast(&hash, 1).unwrap());
        }

        let bumped = ParseOptions {
            parser_version: 2,
            ..ParseOptions::default()
        };
        let worker = env.worker(in_process()).await.with_parse_options(bumped);
        env.client().await.enqueue_scan(None, ScanMode::Quick).await.unwrap();
        worker.drain_inbox().await.unwrap();
        let done = process_all(&worker).await;
        assert_eq!(done.len(), 1);
        let hash = ContentHash::of(b"a = yes");
        assert!(worker.store().has_ast(&hash, 2).unwrap());
        assert_eq!(worker.store().symbols_for(&hash, 2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_files_parse_once() {
        let env = Env::new();
        env.write("game", "events/a.txt", "shared = { x = 1 }");
        env.write("mod", "events/a.txt", "shared = { x = 1 }");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let executor = InProcessExecutor::with_parser(Duration::from_secs(10), move |kind, src, opts| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            parse_document(kind, src, opts)
        });
        let worker = env.worker(Arc::new(executor)).await;
        env.client().await.enqueue_scan(None, ScanMode::Quick).await.unwrap();
        worker.drain_inbox().await.unwrap();
        process_all(&worker).await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let stats = worker.store().stats().unwrap();
        assert_eq!((stats.asts, stats.symbols), (1, 1));
    }

    #[tokio::test]
    async fn test_superseded_item_completes_without_work() {
        let env = Env::new();
        let path = env.write("mod", "events/a.txt", "a = yes");
        let worker = env.worker(in_process()).await;
        let client = env.client().await;
        client.enqueue(&path, Priority::Normal).await.unwrap();
        worker.drain_inbox().await.unwrap();

        fs::write(&path, "a = no, changed").unwrap();
        client.enqueue(&path, Priority::Normal).await.unwrap();
        worker.drain_inbox().await.unwrap();

        let done = process_all(&worker).await;
        assert_eq!(done[0].outcome, ItemOutcome::Superseded);
        assert_eq!(done[1].outcome, ItemOutcome::Completed);
    }

    #[tokio::test]
    async fn test_same_stat_different_content_is_fatal() {
        let env = Env::new();
        let path = env.write("mod", "events/a.txt", "aaa");
        let worker = env.worker(in_process()).await;
        env.client().await.enqueue(&path, Priority::Normal).await.unwrap();
        worker.drain_inbox().await.unwrap();

        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        fs::write(&path, "bbb").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let err = worker.process_next().await.unwrap_err();
        assert!(matches!(err, WorkerError::IdentityViolation { .. }), "{err}");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_retry_and_bad_requests() {
        let env = Env::new();
        let worker = env.worker(in_process()).await;
        let client = env.client().await;
        client.retry(12345).await.unwrap();
        client.enqueue(Path::new("/outside/any/root.txt"), Priority::Normal).await.unwrap();
        client.enqueue_scan(Some("nope"), ScanMode::Quick).await.unwrap();

        assert_eq!(worker.drain_inbox().await.unwrap(), 0);
        let failed = fs::read_dir(env.data().join("inbox/failed")).unwrap().count();
        assert_eq!(failed, 3);
    }

    #[tokio::test]
    async fn test_removed_file_is_tombstoned() {
        let env = Env::new();
        let path = env.write("mod", "events/a.txt", "a = yes");
        let worker = env.worker(in_process()).await;
        let client = env.client().await;
        client.enqueue(&path, Priority::Normal).await.unwrap();
        worker.drain_inbox().await.unwrap();
        process_all(&worker).await;

        fs::remove_file(&path).unwrap();
        client.notify_removed(&path).await.unwrap();
        worker.drain_inbox().await.unwrap();
        assert!(worker.store().active_file(&path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unrooted_scan_skips_disabled_roots() {
        let mut env = Env::new();
        env.settings.load_order[1].enabled = false;
        env.write("game", "events/base.txt", "base = yes");
        env.write("mod", "events/off.txt", "off = yes");
        let worker = env.worker(in_process()).await;
        let client = env.client().await;

        client.enqueue_scan(None, ScanMode::Quick).await.unwrap();
        worker.drain_inbox().await.unwrap();
        let done = process_all(&worker).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].relative_path.as_deref(), Some("events/base.txt"));

        // Naming the root still scans it.
        client.enqueue_scan(Some("mod"), ScanMode::Quick).await.unwrap();
        worker.drain_inbox().await.unwrap();
        let done = process_all(&worker).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].relative_path.as_deref(), Some("events/off.txt"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let env = Env::new();
        env.write("mod", "events/a.txt", "a = yes");
        let mut settings = env.settings.clone();
        settings.worker.poll_interval_ms = 10;
        let worker = Worker::start(&settings, env.data(), in_process()).await.unwrap();
        env.client().await.enqueue_scan(None, ScanMode::Quick).await.unwrap();

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = tx.send(());
        });
        worker.run(rx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(worker.store().queue_counts().unwrap().complete, 1);
    }
}
