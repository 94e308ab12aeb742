//! Sluice CLI: offline administration of a gateway data directory.
//!
//! Usage:
//!   sluice check [--config path]
//!   sluice cache <subcommand> [--config path]
//!   sluice watermark <subcommand> [--config path]

use clap::{Parser, Subcommand};
use sluice::config::default_config_path;
use sluice::{
    ConnectorId, ContentCache, EntryId, Gateway, GatewayConfig, ItemScope, SearchParams, Tier,
};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Cache and watermark administration for the data-collection gateway"
)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log more; repeat for debug and trace output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Check,
    /// Inspect and manage north connector caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Inspect and manage south connector watermarks
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List entries of a tier
    Search {
        north: String,
        #[arg(long, default_value = "cache")]
        tier: String,
        /// Case-insensitive name filter
        #[arg(long)]
        name: Option<String>,
    },
    /// Write an entry's payload to stdout
    Read {
        north: String,
        tier: String,
        id: String,
    },
    /// Move entries between tiers (all entries when no id is given)
    Move {
        north: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        ids: Vec<String>,
    },
    /// Remove entries from a tier (all entries when no id is given)
    Remove {
        north: String,
        tier: String,
        ids: Vec<String>,
    },
    /// Entry counts and sizes per tier
    Stats { north: String },
}

#[derive(Subcommand)]
enum WatermarkAction {
    /// List the watermarks of a south connector
    List { south: String },
    /// Switch a south connector between per-item and aggregate watermarks
    Granularity {
        south: String,
        /// `true` for one watermark per item
        #[arg(long, action = clap::ArgAction::Set)]
        per_item: bool,
    },
}

fn load_config(path: &Path) -> Result<GatewayConfig, String> {
    GatewayConfig::load(path).map_err(|e| format!("Failed to load {}: {}", path.display(), e))
}

fn open_cache(config: &GatewayConfig, north: &str) -> Result<ContentCache, String> {
    let id = ConnectorId::from(north);
    let north_cfg = config
        .north(&id)
        .ok_or_else(|| format!("north connector '{}' not found", north))?;
    ContentCache::open(config.cache_dir(), id, north_cfg.caching.tier_limits())
        .map_err(|e| format!("Failed to open cache: {}", e))
}

fn parse_tier(raw: &str) -> Result<Tier, String> {
    raw.parse::<Tier>().map_err(|e| e.to_string())
}

fn parse_ids(raw: &[String]) -> Result<Vec<EntryId>, String> {
    raw.iter()
        .map(|id| EntryId::parse(id.as_str()).map_err(|e| e.to_string()))
        .collect()
}

fn cmd_check(path: &Path) -> Result<(), String> {
    let config = load_config(path)?;
    let items: usize = config.south.iter().map(|s| s.items.len()).sum();
    println!(
        "{}: ok ({} scan modes, {} south connectors, {} items, {} north connectors)",
        path.display(),
        config.scan_modes.len(),
        config.south.len(),
        items,
        config.north.len()
    );
    Ok(())
}

fn cmd_cache(config: &GatewayConfig, action: CacheAction) -> Result<(), String> {
    match action {
        CacheAction::Search { north, tier, name } => {
            let cache = open_cache(config, &north)?;
            let mut params = SearchParams::new();
            if let Some(name) = name {
                params = params.with_name(name);
            }
            let entries = cache
                .search(parse_tier(&tier)?, &params)
                .map_err(|e| e.to_string())?;
            if entries.is_empty() {
                println!("No entries.");
                return Ok(());
            }
            println!("{:<32}  {:<25}  {:>10}  {}", "ID", "CREATED", "BYTES", "NAME");
            println!("{}", "-".repeat(86));
            for entry in entries {
                println!(
                    "{:<32}  {:<25}  {:>10}  {}",
                    entry.id,
                    entry.metadata.created_at.to_rfc3339(),
                    entry.metadata.content_size,
                    entry.name()
                );
            }
            Ok(())
        }
        CacheAction::Read { north, tier, id } => {
            let cache = open_cache(config, &north)?;
            let id = EntryId::parse(id).map_err(|e| e.to_string())?;
            let payload = cache
                .read_payload(parse_tier(&tier)?, &id)
                .map_err(|e| e.to_string())?;
            std::io::stdout()
                .write_all(&payload)
                .map_err(|e| e.to_string())
        }
        CacheAction::Move { north, from, to, ids } => {
            let cache = open_cache(config, &north)?;
            let (from, to) = (parse_tier(&from)?, parse_tier(&to)?);
            let moved = if ids.is_empty() {
                cache.move_all(from, to)
            } else {
                cache.move_entries(&parse_ids(&ids)?, from, to)
            }
            .map_err(|e| e.to_string())?;
            println!("Moved {} entries from {} to {}", moved, from, to);
            Ok(())
        }
        CacheAction::Remove { north, tier, ids } => {
            let cache = open_cache(config, &north)?;
            let tier = parse_tier(&tier)?;
            let removed = if ids.is_empty() {
                cache.remove_all(tier)
            } else {
                cache.remove(tier, &parse_ids(&ids)?)
            }
            .map_err(|e| e.to_string())?;
            println!("Removed {} entries from {}", removed, tier);
            Ok(())
        }
        CacheAction::Stats { north } => {
            let cache = open_cache(config, &north)?;
            let stats = cache.stats().map_err(|e| e.to_string())?;
            println!("{:<8}  {:>8}  {:>12}", "TIER", "ENTRIES", "BYTES");
            for tier in Tier::ALL {
                let tier_stats = stats.tier(tier);
                println!("{:<8}  {:>8}  {:>12}", tier, tier_stats.entries, tier_stats.bytes);
            }
            if stats.corrupt > 0 {
                println!("{} corrupt entries flagged", stats.corrupt);
            }
            Ok(())
        }
    }
}

fn cmd_watermark(path: &Path, config: GatewayConfig, action: WatermarkAction) -> Result<(), String> {
    let gateway = Gateway::open(config).map_err(|e| format!("Failed to open gateway: {}", e))?;
    match action {
        WatermarkAction::List { south } => {
            let rows = gateway
                .list_watermarks(&ConnectorId::from(south.as_str()))
                .map_err(|e| e.to_string())?;
            if rows.is_empty() {
                println!("No watermarks for '{}'.", south);
                return Ok(());
            }
            println!("{:<24}  {:<24}  {}", "SCAN MODE", "ITEM", "MAX INSTANT");
            println!("{}", "-".repeat(80));
            for row in rows {
                let item = match &row.item {
                    ItemScope::All => "(all)".to_string(),
                    ItemScope::Item(id) => id.to_string(),
                };
                println!("{:<24}  {:<24}  {}", row.scan_mode, item, row.max_instant.to_rfc3339());
            }
            Ok(())
        }
        WatermarkAction::Granularity { south, per_item } => {
            let id = ConnectorId::from(south.as_str());
            gateway
                .set_per_item_granularity(&id, per_item)
                .map_err(|e| e.to_string())?;
            // Persist so the next start does not switch back
            let yaml = gateway
                .config()
                .and_then(|c| Ok(c.to_yaml_string()?))
                .map_err(|e| e.to_string())?;
            std::fs::write(path, yaml).map_err(|e| e.to_string())?;
            println!(
                "Watermarks of '{}' are now {}",
                south,
                if per_item { "per item" } else { "per scan mode" }
            );
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    sluice::logging::init(cli.verbose);
    let path = cli.config.unwrap_or_else(default_config_path);

    let result = match cli.command {
        Commands::Check => cmd_check(&path),
        Commands::Cache { action } => load_config(&path).and_then(|c| cmd_cache(&c, action)),
        Commands::Watermark { action } => {
            load_config(&path).and_then(|c| cmd_watermark(&path, c, action))
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
