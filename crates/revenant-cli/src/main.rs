use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revenant_core::fs::common::open_source;
use revenant_core::{
	detect_filesystem, open_filesystem, recover_files, DirectoryEntry, ExtractionState, FileSystemType,
	HashAlgorithm, RecoveryConfig, RecoverySession, ScanContext, ScanMode, ScanSession, SessionManager,
	SignatureCategory,
};
use tracing_subscriber::EnvFilter;

mod progress;

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "revenant", version, about = "Revenant - deleted file recovery for NTFS, FAT and raw media")]
struct Cli {
	/// Log at debug level instead of RUST_LOG or info
	#[arg(short, long, global = true)]
	verbose: bool,
	/// Session database (default: ~/.revenant/sessions.db)
	#[arg(long, global = true)]
	db: Option<PathBuf>,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Detect the filesystem on an image
	Detect {
		image: PathBuf,
	},
	/// Scan an image for deleted and carvable files
	Scan {
		image: PathBuf,
		/// indexed, deep or combined
		#[arg(long)]
		mode: Option<ScanMode>,
		/// Restrict carving to these categories (repeatable)
		#[arg(long = "category")]
		categories: Vec<SignatureCategory>,
		/// Drop entries below this recovery probability (0.0-1.0)
		#[arg(long)]
		min_probability: Option<f32>,
		/// Sweep for bad sectors first and score against the findings
		#[arg(long)]
		bad_sectors: bool,
		/// Worker threads (default: all cores)
		#[arg(long)]
		workers: Option<usize>,
		/// JSON configuration file; flags override its values
		#[arg(long)]
		config: Option<PathBuf>,
		/// Store the session in the database
		#[arg(long)]
		save: bool,
		/// Write the session as JSON
		#[arg(long)]
		json: Option<PathBuf>,
	},
	/// List a directory of the live filesystem
	Ls {
		image: PathBuf,
		#[arg(default_value = "/")]
		path: String,
	},
	/// Read a live file
	Cat {
		image: PathBuf,
		path: String,
		/// Destination file (default: stdout)
		#[arg(long)]
		out: Option<PathBuf>,
	},
	/// Extract entries of a saved session
	Recover {
		image: PathBuf,
		/// Session id or prefix, or a session JSON file
		#[arg(long)]
		session: String,
		#[arg(long)]
		out: PathBuf,
		/// Entry ids to extract (default: every recoverable entry)
		#[arg(long, value_delimiter = ',')]
		ids: Vec<u64>,
		/// Extra digests next to SHA-256 (md5, sha1)
		#[arg(long = "hash", value_delimiter = ',')]
		hashes: Vec<HashAlgorithm>,
	},
	/// Sweep an image for unreadable or slow sectors
	Badsectors {
		image: PathBuf,
		/// Attempts per unit
		#[arg(long)]
		retries: Option<u8>,
		/// Sweep unit in bytes (default: cluster size)
		#[arg(long)]
		unit_size: Option<u32>,
	},
	/// Manage saved sessions
	Sessions {
		#[command(subcommand)]
		action: SessionAction,
	},
}

#[derive(Subcommand, Debug)]
enum SessionAction {
	/// List saved sessions, newest first
	List {
		#[arg(long)]
		fs: Option<FileSystemType>,
	},
	/// Show the entries of a session
	Show {
		id: String,
	},
	Delete {
		id: String,
	},
	/// Delete sessions older than the given number of days
	Cleanup {
		#[arg(long, default_value = "30")]
		days: u32,
	},
	Export {
		id: String,
		path: PathBuf,
	},
	Import {
		path: PathBuf,
	},
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	match cli.command {
		Commands::Detect { image } => detect(&image),
		Commands::Scan {
			image,
			mode,
			categories,
			min_probability,
			bad_sectors,
			workers,
			config,
			save,
			json,
		} => {
			let mut config = match config {
				Some(path) => RecoveryConfig::from_json_file(path)?,
				None => RecoveryConfig::default(),
			};
			if let Some(mode) = mode {
				config.scan_mode = mode;
			}
			if !categories.is_empty() {
				config.categories = categories;
			}
			if let Some(p) = min_probability {
				anyhow::ensure!((0.0..=1.0).contains(&p), "--min-probability must be within 0.0-1.0");
				config.min_probability = p;
			}
			config.sweep_bad_sectors |= bad_sectors;
			config.workers = workers.or(config.workers);
			tracing::debug!("Scan configuration: {:?}", config);

			let session = scan(&image, config)?;
			print_session(&session);
			if save {
				manager(cli.db.as_deref())?.save(&session)?;
				println!("💾 Saved session {}", session.id);
			}
			if let Some(path) = json {
				let text = serde_json::to_string_pretty(&session)?;
				std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
				println!("📝 Wrote {}", path.display());
			}
			Ok(())
		}
		Commands::Ls { image, path } => list(&image, &path),
		Commands::Cat { image, path, out } => cat(&image, &path, out.as_deref()),
		Commands::Recover {
			image,
			session,
			out,
			ids,
			hashes,
		} => {
			let session = load_session(cli.db.as_deref(), &session)?;
			let ids = (!ids.is_empty()).then_some(ids.as_slice());
			let report = recover_files(&image, &session, &out, ids, &hashes)?;

			for detail in &report.recovery_details {
				let mark = match &detail.state {
					ExtractionState::Complete => "✅".to_string(),
					ExtractionState::Partial => "⚠️ partial".to_string(),
					ExtractionState::Failed(reason) => format!("❌ {}", reason),
				};
				let sha = detail.outcome.as_ref().map_or("", |o| o.sha256());
				println!("{:>5}  {}  {}  {}", detail.file_id, detail.recovered_path.display(), sha, mark);
			}
			println!();
			println!(
				"🔄 Recovered {}/{} files ({} partial, {} failed), {} written to {}",
				report.recovered_files,
				report.total_files,
				report.partial_files,
				report.failed_files,
				format_size(report.total_bytes_recovered),
				report.output_directory.display()
			);
			Ok(())
		}
		Commands::Badsectors { image, retries, unit_size } => {
			let mut config = RecoveryConfig::default();
			if let Some(retries) = retries {
				config.bad_sectors.max_retries = retries;
			}
			config.bad_sectors.unit_size = unit_size.or(config.bad_sectors.unit_size);
			bad_sector_sweep(&image, config)
		}
		Commands::Sessions { action } => sessions(cli.db.as_deref(), action),
	}
}

fn init_tracing(verbose: bool) {
	let filter = if verbose {
		EnvFilter::new("debug")
	} else {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
	};
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}

fn manager(db: Option<&Path>) -> Result<SessionManager> {
	match db {
		Some(path) => SessionManager::with_path(path),
		None => SessionManager::new(),
	}
}

fn load_session(db: Option<&Path>, reference: &str) -> Result<RecoverySession> {
	let path = Path::new(reference);
	if path.is_file() {
		let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
		return serde_json::from_str(&text).with_context(|| format!("{} is not a session export", path.display()));
	}
	manager(db)?.load(reference)
}

fn context_with_progress(config: RecoveryConfig) -> Result<(ScanContext, Option<ProgressReporter>)> {
	let reporter = ProgressReporter::for_terminal()?;
	let mut ctx = ScanContext::new(config);
	if let Some(reporter) = &reporter {
		ctx = ctx.with_progress(reporter.sink());
	}
	Ok((ctx, reporter))
}

fn detect(image: &Path) -> Result<()> {
	println!("🔍 Detecting file system type for: {}", image.display());
	let source = open_source(image).with_context(|| format!("Failed to open {}", image.display()))?;
	let fs_type = detect_filesystem(source.as_ref())?;
	if fs_type == FileSystemType::Raw {
		println!("❓ No known filesystem; the medium can still be carved");
	}

	let fs = open_filesystem(source, &ScanContext::default())?;
	let tree = fs.directory_tree()?;
	println!("✅ Detected: {}", fs_type);
	println!("💾 Size:           {}", format_size(fs.source()?.size()));
	println!("🧱 Cluster size:   {} bytes", fs.cluster_size()?);
	println!("📦 Clusters:       {}", fs.total_clusters()?);
	println!("📈 Allocated:      {}", fs.cluster_map()?.allocated_cluster_count());
	println!("📁 Live files:     {}", tree.file_count());
	Ok(())
}

fn scan(image: &Path, config: RecoveryConfig) -> Result<RecoverySession> {
	let (ctx, reporter) = context_with_progress(config)?;
	let mut scan = ScanSession::open(image, ctx)?;
	let result = scan.run();
	if let Some(reporter) = &reporter {
		reporter.finish();
	}
	result?;
	Ok(scan.finish())
}

fn print_session(session: &RecoverySession) {
	println!("✅ Scan completed{}", if session.cancelled { " (cancelled, partial results)" } else { "" });
	println!("📊 Session ID:        {}", session.id);
	println!("📁 File System:       {}", session.fs_type);
	println!("🔎 Mode:              {}", session.mode);
	println!("💾 Device Size:       {}", format_size(session.metadata.device_size));
	println!("📈 Files Found:       {}", session.metadata.files_found);
	println!("🔄 Recoverable Files: {}", session.metadata.recoverable_files);
	if !session.bad_sectors.is_empty() {
		println!("⚠️  Bad sectors:       {}", session.bad_sectors.len());
	}
	if session.skipped_units > 0 {
		println!("⚠️  Skipped units:     {}", session.skipped_units);
	}
	print_entries(session);
}

fn print_entries(session: &RecoverySession) {
	if session.entries.is_empty() {
		return;
	}
	println!();
	println!("{:>5}  {:<12} {:>5}  {:>10}  {}", "ID", "STATUS", "PROB", "SIZE", "PATH");
	for entry in &session.entries {
		let path = if entry.file.path.is_empty() { &entry.file.name } else { &entry.file.path };
		println!(
			"{:>5}  {:<12} {:>4.0}%  {:>10}  {}",
			entry.id,
			entry.recovery_status.to_string(),
			entry.recovery_probability * 100.0,
			format_size(entry.file.size),
			path
		);
	}
}

fn list(image: &Path, path: &str) -> Result<()> {
	let source = open_source(image).with_context(|| format!("Failed to open {}", image.display()))?;
	let fs = open_filesystem(source, &ScanContext::default())?;

	for dir in fs.list_directories(path)? {
		print_dir_line(&dir);
	}
	for file in fs.list_files(path)? {
		let modified = file.modified.map(|t| t.format("%Y-%m-%d %H:%M").to_string()).unwrap_or_default();
		println!("     {:>10}  {:<16}  {}", format_size(file.size), modified, file.name);
	}
	Ok(())
}

fn print_dir_line(dir: &DirectoryEntry) {
	let modified = dir.modified.map(|t| t.format("%Y-%m-%d %H:%M").to_string()).unwrap_or_default();
	println!("📁   {:>10}  {:<16}  {}/", format!("{} files", dir.file_count()), modified, dir.name);
}

fn cat(image: &Path, path: &str, out: Option<&Path>) -> Result<()> {
	let source = open_source(image).with_context(|| format!("Failed to open {}", image.display()))?;
	let fs = open_filesystem(source, &ScanContext::default())?;
	let data = fs.read_file(path)?;

	match out {
		Some(dest) => {
			std::fs::write(dest, &data).with_context(|| format!("Failed to write {}", dest.display()))?;
			eprintln!("Wrote {} to {}", format_size(data.len() as u64), dest.display());
		}
		None => {
			let mut stdout = std::io::stdout().lock();
			stdout.write_all(&data)?;
			stdout.flush()?;
		}
	}
	Ok(())
}

fn bad_sector_sweep(image: &Path, config: RecoveryConfig) -> Result<()> {
	let (ctx, reporter) = context_with_progress(config)?;
	let source = open_source(image).with_context(|| format!("Failed to open {}", image.display()))?;
	let fs = open_filesystem(source, &ctx)?;
	tracing::info!("Sweeping {} in {}-byte clusters", image.display(), fs.cluster_size()?);
	let report = fs.scan_bad_sectors(&ctx);
	if let Some(reporter) = &reporter {
		reporter.finish();
	}
	let report = report?;

	for info in &report.items {
		let latency = info.latency_ms.map(|ms| format!("{} ms", ms)).unwrap_or_default();
		println!(
			"{:?}  offset {:#012x}  cluster {:>8}  {} bytes  {} attempts  {}",
			info.kind, info.offset, info.cluster, info.length, info.attempts, latency
		);
	}
	let health = revenant_core::DiskHealthInfo::default().merge_bad_sectors(&report.items);
	println!();
	println!(
		"{} Unreadable: {}, slow: {}{}",
		if health.is_healthy() { "✅" } else { "⚠️ " },
		health.bad_sector_count,
		health.slow_sector_count,
		if report.cancelled { " (cancelled)" } else { "" }
	);
	Ok(())
}

fn sessions(db: Option<&Path>, action: SessionAction) -> Result<()> {
	let manager = manager(db)?;
	match action {
		SessionAction::List { fs } => {
			let sessions = match fs {
				Some(fs_type) => manager.list_sessions_by_fs(fs_type)?,
				None => manager.list()?,
			};
			if sessions.is_empty() {
				println!("No saved sessions in {}", manager.database().path().display());
				return Ok(());
			}
			for s in sessions {
				let id = s.id.to_string();
				println!(
					"{}  {}  {:<5} {:<9} {:>5} found {:>5} recoverable  {}{}",
					&id[..8],
					s.created_at.format("%Y-%m-%d %H:%M"),
					s.fs_type.to_string(),
					s.mode.to_string(),
					s.files_found,
					s.recoverable_files,
					s.device_path.display(),
					if s.cancelled { " (cancelled)" } else { "" }
				);
			}
		}
		SessionAction::Show { id } => print_session(&manager.load(&id)?),
		SessionAction::Delete { id } => {
			manager.delete(&id)?;
			println!("🗑️  Deleted session {}", id);
		}
		SessionAction::Cleanup { days } => {
			let removed = manager.cleanup(days)?;
			println!("🧹 Removed {} sessions older than {} days", removed, days);
		}
		SessionAction::Export { id, path } => {
			manager.export_json(&id, &path)?;
			println!("📝 Exported to {}", path.display());
		}
		SessionAction::Import { path } => {
			let id = manager.import_json(&path)?;
			println!("💾 Imported session {}", id);
		}
	}
	Ok(())
}

fn format_size(bytes: u64) -> String {
	const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
	let mut value = bytes as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 {
		format!("{} B", bytes)
	} else {
		format!("{:.1} {}", value, UNITS[unit])
	}
}
