use clap::{Parser, Subcommand};
use modweave_core::config::{ActiveSource, ContentRoot, Settings};
use modweave_core::discovery::discover;
use modweave_core::lock::read_holder;
use modweave_core::logging::{init_child_logging, init_logging};
use modweave_core::model::{ItemStatus, Priority};
use modweave_core::query::load_router;
use modweave_core::{Client, LoadOrderQuery, ScanMode, Store, StoreError};
use modweave_worker::{ProcessExecutor, Worker};
use script_engine::{DocumentKind, ParseOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "modweave",
    about = "Incremental parse cache and load-order conflict analysis for game mods"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the modweave data directory
    #[arg(long, default_value = ".modweave")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter settings.json
    Init {
        /// Base game directory
        #[arg(long)]
        game: Option<PathBuf>,
        /// Mod directories, in load order
        #[arg(long = "mod")]
        mods: Vec<PathBuf>,
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },
    /// Run the worker until Ctrl+C
    Worker,
    /// Show store, queue and inbox state
    Status,
    /// Ask the worker to rescan content roots
    Scan {
        /// Root id (default: every root)
        #[arg(long)]
        root: Option<String>,
        /// quick, full or trust
        #[arg(long, default_value = "quick")]
        mode: ScanMode,
        /// Diff the roots in this process and send only what changed
        #[arg(long)]
        local: bool,
    },
    /// Queue files for processing
    Enqueue {
        paths: Vec<PathBuf>,
        /// Jump ahead of scan backlog
        #[arg(long)]
        flash: bool,
    },
    /// Tell the worker files were deleted
    Remove { paths: Vec<PathBuf> },
    /// Put failed queue items back to pending
    Retry { ids: Vec<i64> },
    /// List failed queue items
    Errors {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Resolve the active load order
    Resolve {
        #[arg(long)]
        json: bool,
    },
    /// List conflicts, riskiest first
    Conflicts {
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 25)]
        limit: usize,
    },
    /// Show where a symbol is defined and used
    Symbol { name: String },
    /// Show the routing table, or how paths are routed
    Routes { paths: Vec<String> },
    /// Parse stdin and write the document as JSON (used by the worker)
    #[command(hide = true)]
    ParseUnit {
        #[arg(long)]
        kind: DocumentKind,
        #[arg(long)]
        parser_version: u32,
        #[arg(long)]
        max_diagnostics: usize,
        #[arg(long)]
        max_depth: usize,
    },
}

fn settings_path(cli: &Cli) -> PathBuf {
    cli.data_dir.join("settings.json")
}

fn load_settings(cli: &Cli) -> Settings {
    let path = settings_path(cli);
    if !path.exists() {
        eprintln!("No configuration found. Run 'modweave init' first.");
        std::process::exit(1);
    }
    match Settings::load(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn active_roots(settings: &Settings) -> Vec<ContentRoot> {
    settings.active_roots().into_iter().cloned().collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { game, mods, force } => cmd_init(&cli, game.as_deref(), mods, *force),
        Commands::Worker => cmd_worker(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Scan { root, mode, local } => cmd_scan(&cli, root.as_deref(), *mode, *local).await,
        Commands::Enqueue { paths, flash } => cmd_enqueue(&cli, paths, *flash).await,
        Commands::Remove { paths } => cmd_remove(&cli, paths).await,
        Commands::Retry { ids } => cmd_retry(&cli, ids).await,
        Commands::Errors { limit } => cmd_errors(&cli, *limit),
        Commands::Resolve { json } => cmd_resolve(&cli, *json),
        Commands::Conflicts { json, limit } => cmd_conflicts(&cli, *json, *limit),
        Commands::Symbol { name } => cmd_symbol(&cli, name),
        Commands::Routes { paths } => cmd_routes(&cli, paths),
        Commands::ParseUnit {
            kind,
            parser_version,
            max_diagnostics,
            max_depth,
        } => {
            init_child_logging();
            let options = ParseOptions {
                parser_version: *parser_version,
                max_diagnostics: *max_diagnostics,
                max_depth: *max_depth,
            };
            modweave_worker::executor::run_parse_unit(
                *kind,
                &options,
                std::io::stdin().lock(),
                std::io::stdout().lock(),
            )
        }
    }
}

fn cmd_init(cli: &Cli, game: Option<&Path>, mods: &[PathBuf], force: bool) -> anyhow::Result<()> {
    let path = settings_path(cli);
    if path.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        std::process::exit(1);
    }

    let mut settings = Settings::default();
    let mut add = |id: String, dir: &Path, base: bool| -> anyhow::Result<()> {
        settings.roots.push(ContentRoot {
            id: id.clone(),
            path: std::path::absolute(dir)?,
            base,
        });
        settings.load_order.push(ActiveSource { id, enabled: true });
        Ok(())
    };
    if let Some(game) = game {
        add("game".to_string(), game, true)?;
    }
    for (i, dir) in mods.iter().enumerate() {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("mod{}", i + 1));
        add(id, dir, false)?;
    }

    settings.save(&path)?;
    println!("Configuration saved to {}", path.display());
    println!();
    println!("Start the worker with: modweave worker");
    println!("Then request a scan:   modweave scan");
    Ok(())
}

async fn cmd_worker(cli: &Cli) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let _guard = init_logging(&settings.logging, &settings.log_dir(&cli.data_dir))?;

    let timeout = Duration::from_secs(settings.worker.parse_timeout_secs);
    let executor = Arc::new(ProcessExecutor::current_exe(timeout)?);
    let worker = Worker::start(&settings, &cli.data_dir, executor).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received");
            let _ = shutdown_tx.send(());
        }
    });

    println!(
        "Worker started on {}. Press Ctrl+C to stop.",
        settings.store_path(&cli.data_dir).display()
    );
    worker.run(shutdown_rx).await?;
    tracing::info!("worker stopped");
    Ok(())
}

async fn cmd_status(cli: &Cli) -> anyhow::Result<()> {
    println!("modweave status");
    println!("===============");
    println!();

    let path = settings_path(cli);
    if !path.exists() {
        println!("Configuration: Not found");
        println!("  Run 'modweave init' to configure");
        return Ok(());
    }
    let settings = match Settings::load(&path) {
        Ok(settings) => settings,
        Err(e) => {
            println!("Configuration: Invalid ({e:#})");
            return Ok(());
        }
    };
    println!("Configuration: Found");
    for root in active_roots(&settings) {
        let base = if root.base { " (base)" } else { "" };
        println!("  {}{}: {}", root.id, base, root.path.display());
    }

    let store_path = settings.store_path(&cli.data_dir);
    println!();
    match read_holder(&store_path) {
        Some(holder) => println!("Worker: pid {} since {}", holder.pid, holder.started_at),
        None => println!("Worker: not running"),
    }

    match Store::open(&store_path) {
        Ok(store) => {
            let stats = store.stats()?;
            let counts = store.queue_counts()?;
            println!("Store: {}", store_path.display());
            println!(
                "  Files: {}  Contents: {} ({} bytes)",
                stats.active_files, stats.contents, stats.content_bytes
            );
            println!(
                "  Trees: {}  Symbols: {}  References: {}",
                stats.asts, stats.symbols, stats.references
            );
            println!(
                "Queue: {} pending, {} claimed, {} complete, {} error",
                counts.pending, counts.claimed, counts.complete, counts.error
            );
        }
        Err(StoreError::Missing(_)) | Err(StoreError::NotInitialized) => {
            println!("Store: not created yet (start the worker)");
        }
        Err(e) => return Err(e.into()),
    }

    let client = Client::open(&cli.data_dir).await?;
    println!("Inbox: {} pending", client.pending().await?);
    Ok(())
}

async fn cmd_scan(cli: &Cli, root: Option<&str>, mode: ScanMode, local: bool) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let client = Client::open(&cli.data_dir).await?;

    if !local {
        client.enqueue_scan(root, mode).await?;
        println!("Scan requested ({mode}).");
        return Ok(());
    }

    let store = Store::open(&settings.store_path(&cli.data_dir))?;
    let roots: Vec<&ContentRoot> = match root {
        Some(id) => match settings.root(id) {
            Some(r) => vec![r],
            None => anyhow::bail!("unknown content root `{id}`"),
        },
        None => settings.active_roots(),
    };
    for root in roots {
        let report = discover(&store, root, mode)?;
        let counts = report.counts();
        let sent = client.submit_report(&report).await?;
        println!(
            "{}: {} added, {} changed, {} removed, {} unchanged ({} requests sent)",
            root.id,
            counts.added,
            counts.changed,
            counts.removed,
            counts.unchanged,
            sent.len()
        );
    }
    Ok(())
}

async fn cmd_enqueue(cli: &Cli, paths: &[PathBuf], flash: bool) -> anyhow::Result<()> {
    let client = Client::open(&cli.data_dir).await?;
    let priority = if flash { Priority::Flash } else { Priority::Normal };
    for path in paths {
        client.enqueue(path, priority).await?;
    }
    println!("Queued {} file(s).", paths.len());
    Ok(())
}

async fn cmd_remove(cli: &Cli, paths: &[PathBuf]) -> anyhow::Result<()> {
    let client = Client::open(&cli.data_dir).await?;
    for path in paths {
        client.notify_removed(path).await?;
    }
    println!("Sent {} removal notice(s).", paths.len());
    Ok(())
}

async fn cmd_retry(cli: &Cli, ids: &[i64]) -> anyhow::Result<()> {
    let client = Client::open(&cli.data_dir).await?;
    for &id in ids {
        client.retry(id).await?;
    }
    println!("Retry requested for {} item(s).", ids.len());
    Ok(())
}

fn cmd_errors(cli: &Cli, limit: usize) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let store = Store::open(&settings.store_path(&cli.data_dir))?;
    let items = store.queue_items(Some(ItemStatus::Error), limit)?;
    if items.is_empty() {
        println!("No failed items.");
        return Ok(());
    }
    for item in items {
        let path = store
            .file(item.file_id)?
            .map(|f| f.fingerprint.path.display().to_string())
            .unwrap_or_else(|| format!("file #{}", item.file_id));
        println!("#{} {} [{}]", item.id, path, item.envelope);
        println!("    {}", item.error.as_deref().unwrap_or("unknown error"));
        println!("    fingerprint {}", item.fingerprint);
    }
    Ok(())
}

fn cmd_resolve(cli: &Cli, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let query = LoadOrderQuery::from_settings(&settings, &cli.data_dir)?;
    let resolution = query.resolve(&active_roots(&settings))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&resolution)?);
        return Ok(());
    }

    for file in resolution.files.iter().filter(|f| !f.replaced.is_empty()) {
        println!(
            "{}  <- {} (replaces {})",
            file.relative_path,
            file.winner,
            file.replaced.join(", ")
        );
    }
    for entity in resolution.entities.iter().filter(|e| !e.losers.is_empty()) {
        let how = if entity.combined { "merged" } else { "won" };
        println!("{}  {} by {} [{}]", entity.key, how, entity.winner.source, entity.policy);
    }
    println!();
    println!(
        "{} files, {} entities, {} removed, {} pending",
        resolution.files.len(),
        resolution.entities.len(),
        resolution.removed.len(),
        resolution.pending.len()
    );
    if !resolution.pending.is_empty() {
        println!("Pending files have no cached tree yet; results may change once the worker catches up.");
    }
    Ok(())
}

fn cmd_conflicts(cli: &Cli, json: bool, limit: usize) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let query = LoadOrderQuery::from_settings(&settings, &cli.data_dir)?;
    let mut conflicts = query.find_conflicts(&active_roots(&settings))?;
    let total = conflicts.len();
    conflicts.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    for unit in &conflicts {
        let winner = unit
            .winner
            .as_ref()
            .map(|w| w.source.as_str())
            .unwrap_or("-");
        let guess = if unit.confident { "" } else { "?" };
        println!(
            "{:>3}  {}  [{}{}]  winner: {}",
            unit.risk.total, unit.key, unit.policy, guess, winner
        );
        for c in &unit.contributors {
            println!("       {} {}:{}", c.source, c.relative_path, c.line);
        }
    }
    println!();
    println!("{} of {} conflicts shown", conflicts.len(), total);
    Ok(())
}

fn cmd_symbol(cli: &Cli, name: &str) -> anyhow::Result<()> {
    let settings = load_settings(cli);
    let store = Store::open(&settings.store_path(&cli.data_dir))?;
    let version = settings.parse_options().parser_version;
    let name = name.strip_prefix('@').unwrap_or(name);

    let defined = store.symbol_locations(name, version)?;
    let used = store.reference_locations(name, version)?;
    if defined.is_empty() && used.is_empty() {
        println!("`{name}` not found.");
        return Ok(());
    }
    println!("Defined:");
    for s in &defined {
        println!("  {} {}:{}:{} ({})", s.root_id, s.relative_path, s.line, s.column, s.kind);
    }
    println!("Used:");
    for r in &used {
        println!(
            "  {} {}:{}:{} ({}, {}x)",
            r.root_id, r.relative_path, r.line, r.column, r.kind, r.count
        );
    }
    Ok(())
}

fn cmd_routes(cli: &Cli, paths: &[String]) -> anyhow::Result<()> {
    let routing = Settings::load(&settings_path(cli))
        .ok()
        .and_then(|s| s.routing);
    let router = load_router(routing.as_deref())?;

    if paths.is_empty() {
        println!("Envelopes:");
        for envelope in router.envelopes() {
            let steps: Vec<&str> = envelope.steps.iter().map(|s| s.as_str()).collect();
            println!("  {:<28} {}", envelope.name, steps.join(" -> "));
        }
        println!("Rules:");
        for rule in router.rules() {
            println!("  {:<28} {}", rule.pattern, rule.envelope);
        }
        println!("  {:<28} {}", "(fallback)", router.fallback().name);
        return Ok(());
    }

    for path in paths {
        let pattern = router
            .matching_rule(path)
            .map(|r| r.pattern.as_str())
            .unwrap_or("(fallback)");
        println!("{}  -> {} via {}", path, router.route(path).name, pattern);
    }
    Ok(())
}
