use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use prettytable::{Cell, Row as PrettyRow, Table};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tagservice::db::Database;
use tagservice::environment::ServiceConfig;
use tagservice::logging;
use tagservice::retag::{LocalTagClient, RemoteTagClient, RetagOrchestrator, TagClient};
use tagservice::tagger::{format_version, TaggerRegistry};

#[derive(Parser)]
#[clap(name = "document-manager", about = "Manage tagged documents")]
struct Cli {
    /// SQLite database (defaults to DATABASE_PATH)
    #[clap(long)]
    database: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add documents from a JSON array of objects with an "id" and one string per element
    Add { file: PathBuf },

    /// Run one retag sweep over all documents
    Retag {
        /// Tag through a running tag service instead of in-process
        #[clap(long)]
        service_url: Option<String>,
    },

    /// Show a document's rendered elements, summaries and tag records
    Show {
        #[clap(required = true)]
        id: String,
    },

    /// Show the statistics of a dictionary
    Stats {
        dictionary: String,

        /// Number of top words and identifiers to show
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::configure_logging_for("document-manager");

    let args = Cli::parse();
    let config = ServiceConfig::from_env();
    let database = args.database.unwrap_or_else(|| config.database_path.clone());
    let db = Database::new(&database)
        .await
        .with_context(|| format!("Failed to open database {}", database))?;

    match args.command {
        Commands::Add { file } => add_documents(&db, &file).await?,
        Commands::Retag { service_url } => retag(&db, &config, service_url.as_deref()).await?,
        Commands::Show { id } => show_document(&db, &id).await?,
        Commands::Stats { dictionary, limit } => show_statistics(&db, &dictionary, limit).await?,
    }

    Ok(())
}

async fn add_documents(db: &Database, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let records: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", file.display()))?;

    let mut changed = 0;
    for record in &records {
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Document without \"id\" in {}", file.display()))?;
        let elements: BTreeMap<String, String> = record
            .iter()
            .filter(|(key, _)| key.as_str() != "id")
            .filter_map(|(key, value)| value.as_str().map(|text| (key.clone(), text.to_string())))
            .collect();

        if db.add_document(id, &elements).await? {
            changed += 1;
        }
    }

    println!(
        "{} {} documents, {} new or changed",
        "Loaded".bright_green(),
        records.len(),
        changed
    );
    Ok(())
}

async fn retag(db: &Database, config: &ServiceConfig, service_url: Option<&str>) -> Result<()> {
    let client: Arc<dyn TagClient> = match service_url {
        Some(url) => Arc::new(RemoteTagClient::new(url)?),
        None => Arc::new(LocalTagClient::new(Arc::new(TaggerRegistry::new()), db.clone())),
    };
    let orchestrator = RetagOrchestrator::new(
        client,
        db.clone(),
        config.document_elements.clone(),
        config.retag_concurrency,
        config.stats_top_n,
    );

    let report = orchestrator.sweep().await?;
    println!(
        "{} {} of {} documents ({} records)",
        "Retagged".bright_green(),
        report.retagged,
        report.documents,
        report.records
    );
    for (id, reason) in &report.failed {
        println!("{} {}: {}", "Failed".bright_red(), id, reason);
    }
    if report.statistics_updated {
        println!("Statistics updated");
    }
    Ok(())
}

async fn show_document(db: &Database, id: &str) -> Result<()> {
    let document = db
        .load_document(id)
        .await?
        .ok_or_else(|| anyhow!("No document {}", id))?;

    println!("{}  {}", "DOCUMENT".bright_blue(), id.bright_yellow());
    match document.modified_at {
        Some(modified) => println!("{}: {}", "Modified".bright_blue(), format_version(&modified)),
        None => println!("{}: {}", "Modified".bright_blue(), "never tagged".dimmed()),
    }

    for (element, original) in &document.elements {
        println!("\n{}", element.bright_blue());
        println!("{}", "─".repeat(80).dimmed());
        println!("{}", document.rendered.get(element).unwrap_or(original));
    }

    if !document.summaries.is_empty() {
        println!();
        for (field, identifiers) in &document.summaries {
            println!("{}: {}", field.bright_blue(), identifiers.join(", "));
        }
    }

    let records = db.load_tag_records(id).await?;
    if !records.is_empty() {
        let mut table = Table::new();
        table.add_row(PrettyRow::new(vec![
            Cell::new("Dictionary"),
            Cell::new("Spans"),
            Cell::new("Blacklist"),
            Cell::new("Whitelist"),
            Cell::new("Tagged"),
        ]));
        for record in records.values() {
            let spans: usize = record.spans.values().map(Vec::len).sum();
            table.add_row(PrettyRow::new(vec![
                Cell::new(&record.dictionary),
                Cell::new(&spans.to_string()),
                Cell::new(&format_version(&record.versions.blacklist)),
                Cell::new(&format_version(&record.versions.whitelist)),
                Cell::new(&format_version(&record.tagged_at)),
            ]));
        }
        println!();
        table.printstd();
    }
    Ok(())
}

async fn show_statistics(db: &Database, dictionary: &str, limit: usize) -> Result<()> {
    let stats = db
        .load_statistics(dictionary)
        .await?
        .ok_or_else(|| anyhow!("No statistics for '{}'", dictionary))?;

    println!("{}  {}", "STATISTICS".bright_blue(), dictionary.bright_yellow());
    println!("Documents: {}", stats.total_documents);
    println!("Words: {}", stats.total_words);
    println!(
        "Tagged words: {} ({} distinct, {:.2} per document)",
        stats.total_tagged_words, stats.distinct_tagged_words, stats.average_tagged_words_per_document
    );
    println!(
        "Identifiers: {} ({} distinct, {:.2} per document)",
        stats.total_identifiers, stats.distinct_identifiers, stats.average_identifiers_per_document
    );

    let mut words = Table::new();
    words.add_row(PrettyRow::new(vec![Cell::new("Word"), Cell::new("Count")]));
    for (word, count) in stats.top_tagged_words.iter().take(limit) {
        words.add_row(PrettyRow::new(vec![Cell::new(word), Cell::new(&count.to_string())]));
    }
    words.printstd();

    let mut identifiers = Table::new();
    identifiers.add_row(PrettyRow::new(vec![
        Cell::new("Identifier"),
        Cell::new("Tags"),
        Cell::new("Documents"),
    ]));
    for entry in stats.top_identifiers.iter().take(limit) {
        identifiers.add_row(PrettyRow::new(vec![
            Cell::new(&entry.identifier),
            Cell::new(&entry.tags.to_string()),
            Cell::new(&entry.documents.to_string()),
        ]));
    }
    identifiers.printstd();
    Ok(())
}
