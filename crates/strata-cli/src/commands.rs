use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use colored::Colorize;
use strata_provider::{BackendConfig, BlobManager, ManagerConfig};
use strata_remote::InMemoryObjectClient;
use strata_types::{BlobContext, BlobSource, BlobUpdate, StorageClass, MAIN_XPATH};
use tracing::debug;

use crate::cli::*;

/// Endpoint served by a process-local object service.
pub const MEMORY_ENDPOINT: &str = "memory";

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = ManagerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Command::Config(args) = &cli.command {
        if args.check {
            println!("{} {} is valid", "✓".green().bold(), cli.config.display());
            return Ok(());
        }
    }
    let manager = open_manager(config)?;
    let json = matches!(cli.format, OutputFormat::Json);
    match cli.command {
        Command::Put(args) => cmd_put(&manager, args, json),
        Command::Get(args) => cmd_get(&manager, args),
        Command::Rm(args) => cmd_rm(&manager, args),
        Command::Status(args) => cmd_status(&manager, args, json),
        Command::Update(args) => cmd_update(&manager, args),
        Command::Gc(args) => cmd_gc(&manager, args),
        Command::Config(_) => cmd_config(&manager),
    }
}

/// Build the manager, backing every `memory` endpoint with an in-process
/// object service whose buckets are created up front.
pub fn open_manager(config: ManagerConfig) -> anyhow::Result<BlobManager> {
    let buckets: BTreeSet<String> = config
        .providers
        .values()
        .filter_map(|p| match &p.backend {
            BackendConfig::Remote { endpoint, bucket, .. } if endpoint == MEMORY_ENDPOINT => {
                Some(bucket.clone())
            }
            _ => None,
        })
        .collect();
    let mut builder = BlobManager::builder(config);
    if !buckets.is_empty() {
        debug!(?buckets, "serving memory endpoint in process");
        let client = Arc::new(InMemoryObjectClient::new(MEMORY_ENDPOINT));
        for bucket in &buckets {
            client.create_bucket(bucket);
        }
        builder = builder.object_client(client);
    }
    Ok(builder.build()?)
}

fn cmd_put(manager: &BlobManager, args: PutArgs, json: bool) -> anyhow::Result<()> {
    anyhow::ensure!(args.file.is_file(), "{} is not a file", args.file.display());
    let mut context = BlobContext::new(BlobSource::from_file(&args.file));
    if let Some(doc) = args.doc {
        context = context.with_doc(doc, args.xpath.as_deref().unwrap_or(MAIN_XPATH));
    }
    if let Some(name) = args.file.file_name().and_then(|n| n.to_str()) {
        context = context.with_filename(name);
    }
    if let Some(mime_type) = args.mime_type {
        context = context.with_mime_type(mime_type);
    }
    let provider = match &args.provider {
        Some(name) => manager.provider(name)?,
        None => manager.default_provider()?,
    };
    let info = provider.write_blob(&context)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("{} Stored {}", "✓".green().bold(), info.key.yellow());
        if let Some(length) = info.length {
            println!("  Length: {length}");
        }
        if let (Some(digest), Some(algorithm)) = (&info.digest, &info.digest_algorithm) {
            println!("  Digest: {} {}", algorithm.cyan(), digest);
        }
    }
    Ok(())
}

fn cmd_get(manager: &BlobManager, args: GetArgs) -> anyhow::Result<()> {
    match args.output {
        Some(path) => {
            if !manager.read_to_file(&args.key, &path)? {
                eprintln!("{} {} is missing, wrote an empty file", "!".yellow().bold(), args.key);
            }
        }
        None => {
            let data = manager.read_bytes(&args.key)?;
            std::io::stdout().lock().write_all(&data)?;
        }
    }
    Ok(())
}

fn cmd_rm(manager: &BlobManager, args: RmArgs) -> anyhow::Result<()> {
    for key in &args.keys {
        manager.delete_blob(key)?;
        println!("  {} {}", "deleted:".red(), key);
    }
    Ok(())
}

fn cmd_status(manager: &BlobManager, args: StatusArgs, json: bool) -> anyhow::Result<()> {
    let status = manager.status(&args.key)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    let downloadable = if status.downloadable { "yes".green() } else { "no".red() };
    println!("{}", args.key.yellow().bold());
    println!("  Storage class: {}", status.storage_class.to_string().cyan());
    println!("  Downloadable: {downloadable}");
    if status.restore_in_progress {
        println!("  Restore: {}", "in progress".yellow());
    }
    Ok(())
}

fn cmd_update(manager: &BlobManager, args: UpdateArgs) -> anyhow::Result<()> {
    let update = if let Some(class) = &args.storage_class {
        BlobUpdate::StorageClass {
            class: class.parse::<StorageClass>()?,
        }
    } else if let Some(days) = args.restore {
        BlobUpdate::Restore { days }
    } else if let Some(hold) = args.legal_hold {
        BlobUpdate::LegalHold { hold }
    } else if let Some(days) = args.retain_days {
        BlobUpdate::RetainUntil {
            until: (days > 0).then(|| SystemTime::now() + Duration::from_secs(days * 24 * 60 * 60)),
        }
    } else {
        anyhow::bail!("nothing to update");
    };
    manager.update_blob(&args.key, &update)?;
    println!("{} Updated {}", "✓".green(), args.key.yellow());
    Ok(())
}

fn cmd_gc(manager: &BlobManager, args: GcArgs) -> anyhow::Result<()> {
    let text = fs::read_to_string(&args.keep)
        .with_context(|| format!("reading {}", args.keep.display()))?;
    let provider = match &args.provider {
        Some(name) => manager.provider(name)?,
        None => manager.default_provider()?,
    };
    let prefix = format!("{}:", provider.name());
    let marked: HashSet<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.strip_prefix(&prefix).unwrap_or(l).to_string())
        .collect();
    let report = provider.garbage_collect(&marked, args.dry_run)?;
    let verb = if args.dry_run { "would remove" } else { "removed" };
    println!(
        "{} GC {}: {} {} blobs ({} bytes), kept {}, ignored {}",
        "✓".green(),
        provider.name().bold(),
        verb,
        report.deleted,
        report.deleted_bytes,
        report.kept,
        report.ignored
    );
    Ok(())
}

fn cmd_config(manager: &BlobManager) -> anyhow::Result<()> {
    let default = manager.default_provider().ok().map(|p| p.name().to_string());
    for name in manager.provider_names() {
        let provider = manager.provider(name)?;
        let marker = if default.as_deref() == Some(name) { "*".green().bold() } else { " ".normal() };
        println!("{marker} {}  {}  {:?}", name.bold(), provider.key_strategy().to_string().cyan(), provider.kind());
        if provider.is_record() {
            println!("    {}", "record".yellow());
        }
    }
    Ok(())
}
