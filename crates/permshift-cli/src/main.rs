use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use permshift_core::ops::current_user;
use permshift_core::{
	audit, parse_mode, parse_owner, BatchReport, BatchState, ChangeEngine, ChangeRequest,
	EngineConfig, MetadataStore, RevertEngine, SqliteStore, SystemOps, Target,
};
use tracing_subscriber::EnvFilter;

mod progress;

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "permshift", version, about = "Bulk ownership and permission changes with full revert history")]
struct Cli {
	/// History database (defaults to ~/.permshift/history.db)
	#[arg(long, global = true)]
	db: Option<PathBuf>,
	/// More log output (-v info, -vv debug)
	#[arg(short, long, global = true, action = ArgAction::Count)]
	verbose: u8,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Change owner or permissions of every entry under a root
	Change {
		root: PathBuf,
		/// New owner as user or user:group (defaults to the current user)
		#[arg(long, conflicts_with = "mode")]
		owner: Option<String>,
		/// New mode, octal (755) or symbolic (u=rwx,g=rx,o=)
		#[arg(long)]
		mode: Option<String>,
		#[command(flatten)]
		walk: WalkArgs,
		/// Worker threads (defaults to available parallelism, at most 16)
		#[arg(long)]
		workers: Option<usize>,
		/// Capacity of the pending-entry queue
		#[arg(long, default_value = "1024")]
		queue: usize,
		/// Print the full report as JSON
		#[arg(long)]
		json: bool,
	},
	/// List entries whose owner differs from the expected one, without changing anything
	Check {
		root: PathBuf,
		/// Expected owner as user or user:group (defaults to the current user)
		#[arg(long)]
		owner: Option<String>,
		#[command(flatten)]
		walk: WalkArgs,
		#[arg(long)]
		json: bool,
	},
	/// Undo a batch (full id or unique prefix)
	Revert {
		batch: String,
		/// Only revert these paths (repeatable)
		#[arg(long = "path")]
		paths: Vec<PathBuf>,
	},
	/// List recorded batches, or every snapshot taken of one path
	History {
		#[arg(long)]
		path: Option<PathBuf>,
	},
	/// Show one batch and its snapshots
	Show {
		batch: String,
		#[arg(long)]
		json: bool,
	},
}

#[derive(clap::Args, Debug)]
struct WalkArgs {
	/// Maximum recursion depth below the root (unbounded by default)
	#[arg(long)]
	max_depth: Option<usize>,
	/// Descend into directories reached through symbolic links
	#[arg(long)]
	follow_links: bool,
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	init_logging(cli.verbose);

	match cli.command {
		Commands::Change { root, owner, mode, walk, workers, queue, json } => {
			let target = match (owner, mode) {
				(_, Some(mode)) => Target::Permissions(parse_mode(&mode)?),
				(Some(owner), None) => parse_owner(&owner)?,
				(None, None) => default_owner()?,
			};
			let config = EngineConfig::default()
				.with_queue_capacity(queue)
				.with_follow_links(walk.follow_links);

			let root = absolute(&root)?;
			let engine = open_engine(cli.db, config)?;
			let mut request = ChangeRequest::new(&root, target.clone()).max_depth(walk.max_depth);
			if let Some(workers) = workers {
				request = request.concurrency(workers);
			}
			let id = engine.create(request)?;

			println!("🔧 Batch {}: {} under {}", id, target, root.display());
			let report = run_batch(&engine, id)?;
			finish(&report, json)
		}
		Commands::Check { root, owner, walk, json } => {
			let target = match owner {
				Some(owner) => parse_owner(&owner)?,
				None => default_owner()?,
			};
			let config = EngineConfig::default()
				.with_max_depth(walk.max_depth)
				.with_follow_links(walk.follow_links);
			let root = absolute(&root)?;

			println!("🔍 Checking {} against {}", root.display(), target);
			let report = audit(&SystemOps::new(), &root, &target, &config)?;

			if json {
				println!("{}", serde_json::to_string_pretty(&report)?);
				return Ok(());
			}
			for entry in report.needing_change() {
				if let Some(state) = &entry.state {
					println!("  ✏️  {} ({}, {})", entry.path.display(), state.owner, state.mode);
				}
			}
			for entry in report.errors() {
				println!("  ❌ {}: {}", entry.path.display(), entry.error.as_deref().unwrap_or(""));
			}
			println!();
			println!("📊 Entries: {}", report.total());
			println!("✏️  Need change: {}", report.needing_change().count());
			println!("❌ Errors: {}", report.errors().count());
			Ok(())
		}
		Commands::Revert { batch, paths } => {
			let engine = open_engine(cli.db, EngineConfig::default())?;
			let record = engine.find_batch(&batch)?;
			let reverter = RevertEngine::new(engine.clone());

			println!("⏪ Reverting batch {} ({})", record.id, record.kind);
			let id = if paths.is_empty() {
				reverter.revert(record.id)?
			} else {
				let paths = paths.iter().map(|p| absolute(p)).collect::<Result<Vec<_>>>()?;
				reverter.revert_paths(record.id, &paths)?
			};
			let report = run_batch(&engine, id)?;
			finish(&report, false)
		}
		Commands::History { path } => {
			let store = open_store(cli.db)?;
			match path {
				Some(path) => {
					let path = absolute(&path)?;
					let history = store.history_for_path(&path)?;
					if history.is_empty() {
						println!("📭 No recorded changes for {}", path.display());
					}
					for snapshot in history {
						println!(
							"{}  {}  before: {} {}",
							snapshot.captured_at.format("%Y-%m-%d %H:%M:%S"),
							short_id(&snapshot.batch_id.to_string()),
							snapshot.before.owner,
							snapshot.before.mode,
						);
					}
				}
				None => {
					let batches = store.list_batches()?;
					if batches.is_empty() {
						println!("📭 No batches recorded in {}", store.path().display());
					}
					for batch in batches {
						let what = match (&batch.target, &batch.root) {
							(Some(target), Some(root)) => format!("{} under {}", target, root.display()),
							_ => batch.kind.to_string(),
						};
						println!(
							"{}  {}  {:<10} changed {:>6}  unchanged {:>6}  errors {:>6}  {}",
							short_id(&batch.id.to_string()),
							batch.started_at.format("%Y-%m-%d %H:%M:%S"),
							batch.state.as_str(),
							batch.counts.changed,
							batch.counts.unchanged,
							batch.counts.errored,
							what,
						);
					}
				}
			}
			Ok(())
		}
		Commands::Show { batch, json } => {
			let store = open_store(cli.db)?;
			let record = store
				.find_batch(&batch)?
				.with_context(|| format!("Batch not found: {}", batch))?;
			let snapshots = store.snapshots_for_batch(record.id)?;

			if json {
				let value = serde_json::json!({ "batch": record, "snapshots": snapshots });
				println!("{}", serde_json::to_string_pretty(&value)?);
				return Ok(());
			}

			println!("📋 Batch {}", record.id);
			println!("   Kind: {}", record.kind);
			if let Some(root) = &record.root {
				println!("   Root: {}", root.display());
			}
			if let Some(target) = &record.target {
				println!("   Target: {}", target);
			}
			println!("   State: {}", record.state);
			println!("   Started: {}", record.started_at.to_rfc3339());
			if let Some(ended) = record.ended_at {
				println!("   Ended: {}", ended.to_rfc3339());
			}
			if let Some(fault) = &record.fault {
				println!("   Fault: {}", fault);
			}
			print_counts(&record.counts);
			println!();
			println!("🗂️  Snapshots: {}", snapshots.len());
			for snapshot in snapshots {
				println!(
					"   {} ({}) was {} {}",
					snapshot.path.display(),
					snapshot.kind,
					snapshot.before.owner,
					snapshot.before.mode,
				);
			}
			Ok(())
		}
	}
}

fn init_logging(verbose: u8) {
	let default = match verbose {
		0 => "warn",
		1 => "permshift_core=info,permshift=info,warn",
		_ => "permshift_core=debug,permshift=debug,warn",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
	let path = match db {
		Some(path) => path,
		None => SqliteStore::default_path()?,
	};
	tracing::info!("Using history database {}", path.display());
	SqliteStore::open(&path).with_context(|| format!("Failed to open history database at {}", path.display()))
}

fn open_engine(db: Option<PathBuf>, config: EngineConfig) -> Result<ChangeEngine> {
	let store: Arc<dyn MetadataStore> = Arc::new(open_store(db)?);
	let engine = ChangeEngine::new(Arc::new(SystemOps::new()), store, config)?;
	Ok(engine)
}

fn default_owner() -> Result<Target> {
	let user = current_user().context("Could not determine the current user; pass --owner")?;
	Ok(Target::owner(user))
}

fn absolute(path: &Path) -> Result<PathBuf> {
	if path.exists() {
		return path
			.canonicalize()
			.with_context(|| format!("Failed to resolve {}", path.display()));
	}
	let cwd = std::env::current_dir().context("Failed to read the current directory")?;
	Ok(cwd.join(path))
}

/// Launch a registered batch with a spinner and Ctrl-C cancellation
fn run_batch(engine: &ChangeEngine, id: permshift_core::BatchId) -> Result<BatchReport> {
	let reporter = ProgressReporter::new();
	{
		let reporter = reporter.clone();
		engine.set_progress_callback(move |progress| reporter.update(progress));
	}

	let cancel_engine = engine.clone();
	ctrlc::set_handler(move || {
		eprintln!("\nInterrupt received, cancelling batch...");
		let _ = cancel_engine.cancel(id);
	})
	.context("Failed to set signal handler")?;

	reporter.set_status("Starting...");
	engine.launch(id)?;
	let report = engine.wait(id)?;
	reporter.finish_and_clear();
	Ok(report)
}

fn finish(report: &BatchReport, json: bool) -> Result<()> {
	if json {
		println!("{}", serde_json::to_string_pretty(report)?);
	} else {
		for entry in report.with_outcome("error") {
			if let permshift_core::Outcome::Error(reason) = &entry.outcome {
				println!("  ❌ {}: {}", entry.path.display(), reason);
			}
		}

		match report.batch.state {
			BatchState::Completed => println!("✅ Batch completed"),
			BatchState::Cancelled => println!("⚠️  Batch cancelled"),
			state => println!("❌ Batch {}", state),
		}
		println!("📊 Batch ID: {}", report.batch.id);
		print_counts(&report.batch.counts);
	}

	if report.batch.state == BatchState::Failed {
		bail!(
			"Batch {} failed: {}",
			report.batch.id,
			report.batch.fault.as_deref().unwrap_or("unknown fault")
		);
	}
	Ok(())
}

fn print_counts(counts: &permshift_core::Counts) {
	println!("✏️  Changed: {}", counts.changed);
	println!("➖ Unchanged: {}", counts.unchanged);
	println!("❌ Errors: {}", counts.errored);
	if counts.not_attempted > 0 {
		println!("⏸️  Not attempted: {}", counts.not_attempted);
	}
}

fn short_id(id: &str) -> &str {
	&id[..8.min(id.len())]
}
