use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use prettytable::{Cell, Row as PrettyRow, Table};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tagservice::db::Database;
use tagservice::environment::ServiceConfig;
use tagservice::logging;
use tagservice::retag::{RemoteTagClient, TagClient};
use tagservice::tagger::{
    parse_version, DictionaryDefinition, DictionaryInfo, MatchService, TaggerRegistry, Version,
};

#[derive(Parser)]
#[clap(name = "dictionary-manager", about = "Manage tagging dictionaries and their sources")]
struct Cli {
    /// SQLite database (defaults to DATABASE_PATH)
    #[clap(long)]
    database: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or replace a dictionary definition
    Define {
        /// Dictionary name
        #[clap(required = true)]
        name: String,

        /// Entity type of every entry (negative for chemical classes)
        #[clap(required = true, allow_negative_numbers = true)]
        entity_type: i32,

        /// Source holding the dictionary entries
        #[clap(long, default_value = "")]
        dictionary_source: String,

        /// Source holding blacklist snapshots
        #[clap(long, default_value = "")]
        blacklist_source: String,

        /// Source holding whitelist snapshots
        #[clap(long, default_value = "")]
        whitelist_source: String,

        /// Field of a whitelist record holding the identifier
        #[clap(long, requires = "whitelist_words")]
        whitelist_key: Option<String>,

        /// Field of a whitelist record holding the surface forms
        #[clap(long, requires = "whitelist_key")]
        whitelist_words: Option<String>,

        /// Link rendered per binding, `{id}` and `{type}` are substituted
        #[clap(long)]
        link_template: Option<String>,

        /// Document field listing the identifiers found
        #[clap(long)]
        summary_field: Option<String>,
    },

    /// Import entries from a JSON array of {"identifier", "surface_forms"} objects
    ImportEntries {
        source: String,
        file: PathBuf,

        /// Drop the existing entries of the source first
        #[clap(short, long)]
        replace: bool,
    },

    /// Add a blacklist snapshot from a JSON array of surface forms
    ImportBlacklist {
        source: String,
        file: PathBuf,

        /// Snapshot version, RFC 3339 (defaults to now)
        #[clap(short, long)]
        version: Option<String>,
    },

    /// Add a whitelist snapshot from a JSON array of records
    ImportWhitelist {
        source: String,
        file: PathBuf,

        /// Snapshot version, RFC 3339 (defaults to now)
        #[clap(short, long)]
        version: Option<String>,
    },

    /// List dictionaries with their live versions
    List {
        /// Ask a running tag service instead of building locally
        #[clap(long)]
        service_url: Option<String>,
    },

    /// Tag a text with one dictionary and highlight the matches
    Tag {
        dictionary: String,
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::configure_logging_for("dictionary-manager");

    let args = Cli::parse();
    let database = args
        .database
        .unwrap_or_else(|| ServiceConfig::from_env().database_path);
    let db = Database::new(&database)
        .await
        .with_context(|| format!("Failed to open database {}", database))?;

    match args.command {
        Commands::Define {
            name,
            entity_type,
            dictionary_source,
            blacklist_source,
            whitelist_source,
            whitelist_key,
            whitelist_words,
            link_template,
            summary_field,
        } => {
            let mut definition = DictionaryDefinition::new(&name, entity_type)
                .with_dictionary_source(&dictionary_source)
                .with_blacklist_source(&blacklist_source);
            if let (Some(key), Some(words)) = (whitelist_key, whitelist_words) {
                definition = definition.with_whitelist_source(&whitelist_source, &key, &words);
            } else if !whitelist_source.is_empty() {
                bail!("--whitelist-source needs --whitelist-key and --whitelist-words");
            }
            definition.link_template = link_template;
            definition.summary_field = summary_field;

            db.define_dictionary(&definition).await?;
            println!("{} {}", "Defined".bright_green(), name.bright_yellow());
        }
        Commands::ImportEntries {
            source,
            file,
            replace,
        } => {
            let records: Vec<serde_json::Value> = read_json(&file)?;
            if replace {
                let removed = db.clear_entries(&source).await?;
                println!("Removed {} entries from {}", removed, source);
            }
            let imported = db.import_entries(&source, &records).await?;
            println!("{} {} entries into {}", "Imported".bright_green(), imported, source.bright_yellow());
        }
        Commands::ImportBlacklist {
            source,
            file,
            version,
        } => {
            let words: Vec<String> = read_json(&file)?;
            let version = snapshot_version(version.as_deref())?;
            db.add_blacklist_snapshot(&source, &words, version).await?;
            println!(
                "{} blacklist of {} words into {} at {}",
                "Added".bright_green(),
                words.len(),
                source.bright_yellow(),
                version
            );
        }
        Commands::ImportWhitelist {
            source,
            file,
            version,
        } => {
            let records: Vec<serde_json::Value> = read_json(&file)?;
            let version = snapshot_version(version.as_deref())?;
            db.add_whitelist_snapshot(&source, &records, version).await?;
            println!(
                "{} whitelist of {} groups into {} at {}",
                "Added".bright_green(),
                records.len(),
                source.bright_yellow(),
                version
            );
        }
        Commands::List { service_url } => {
            let dictionaries = match service_url {
                Some(url) => RemoteTagClient::new(&url)?.list_dictionaries().await?,
                None => {
                    let registry = TaggerRegistry::new();
                    let report = registry.reload(&db).await?;
                    for (name, reason) in &report.failed {
                        println!("{} {}: {}", "Failed".bright_red(), name, reason);
                    }
                    registry.dictionaries()
                }
            };
            print_dictionaries(&dictionaries);
        }
        Commands::Tag { dictionary, text } => {
            let registry = Arc::new(TaggerRegistry::new());
            registry.reload(&db).await?;
            let service = MatchService::new(registry);
            let spans = service.tag(&dictionary, &text)?;

            println!("{}", highlight(&text, &spans));
            println!("{}", "─".repeat(80).dimmed());
            for span in &spans {
                let bindings: Vec<String> = span
                    .bindings
                    .iter()
                    .map(|b| format!("{}:{}", b.entity_type, b.identifier))
                    .collect();
                println!(
                    "[{}, {}] {} -> {}",
                    span.start,
                    span.end,
                    span.surface(&text).unwrap_or_default().bright_yellow(),
                    bindings.join(", ")
                );
            }
            println!("{}: {}", "Matches".bright_blue(), spans.len());
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn snapshot_version(version: Option<&str>) -> Result<Version> {
    match version {
        Some(version) => Ok(parse_version(version)?),
        None => Ok(Utc::now()),
    }
}

fn print_dictionaries(dictionaries: &[DictionaryInfo]) {
    if dictionaries.is_empty() {
        println!("No dictionaries.");
        return;
    }

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Name"),
        Cell::new("Entity types"),
        Cell::new("Blacklist"),
        Cell::new("Whitelist"),
    ]));
    for info in dictionaries {
        let types: Vec<String> = info.entity_types.iter().map(i32::to_string).collect();
        table.add_row(PrettyRow::new(vec![
            Cell::new(&info.name),
            Cell::new(&types.join(",")),
            Cell::new(&info.blacklist),
            Cell::new(&info.whitelist),
        ]));
    }
    table.printstd();
}

/// The text with every matched region highlighted; overlapping regions are merged.
fn highlight(text: &str, spans: &[tagservice::matcher::MatchSpan]) -> String {
    let mut regions: Vec<(usize, usize)> = Vec::new();
    for span in spans {
        if span.surface(text).is_none() {
            continue;
        }
        match regions.last_mut() {
            Some(last) if span.start <= last.1 => last.1 = last.1.max(span.end + 1),
            _ => regions.push((span.start, span.end + 1)),
        }
    }

    let mut out = String::new();
    let mut taken = 0;
    for (start, end) in regions {
        out.push_str(&text[taken..start]);
        out.push_str(&text[start..end].bright_green().bold().to_string());
        taken = end;
    }
    out.push_str(&text[taken..]);
    out
}
