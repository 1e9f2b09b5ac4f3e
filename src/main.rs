use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use stock_ledger::adjudication::CommitRequest;
use stock_ledger::config::{Config, DEFAULT_CONFIG_PATH};
use stock_ledger::{
    Category, LedgerError, LedgerStore, NewProduct, ProductFilter, commit_adjudication,
    import_spreadsheet, process_invoice, write_template, write_template_xlsx,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stock_ledger")]
#[command(about = "Inventory ledger with supplier invoice reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and create the database
    Init,

    /// Edit the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage catalog products
    Product {
        #[command(subcommand)]
        action: ProductAction,
    },

    /// Reconcile supplier invoices
    Invoice {
        #[command(subcommand)]
        action: InvoiceAction,
    },

    /// Bulk import products from an XLSX or CSV file
    Import { file: PathBuf },

    /// Write an import template (XLSX for a .xlsx path, CSV otherwise)
    Template { out: PathBuf },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Point the configuration at another database file
    SetDb { path: String },
}

#[derive(Subcommand)]
enum ProductAction {
    /// Add a product manually
    Add {
        #[arg(long)]
        code: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        short_code: Option<String>,
        #[arg(long, default_value_t = 0)]
        stock: i64,
        #[arg(long, default_value = "consumable")]
        category: Category,
    },

    /// List products, newest first
    List {
        #[arg(long, default_value = "all")]
        filter: ProductFilter,
    },

    /// Delete every product matching a filter
    Delete {
        #[arg(long)]
        filter: ProductFilter,
    },

    /// Dashboard counters
    Stats,
}

#[derive(Subcommand)]
enum InvoiceAction {
    /// Parse a CFDI invoice, auto-resolve known items and queue the rest
    Parse { file: PathBuf },

    /// Print an editable decision file for a pending batch
    Pending { batch_id: String },

    /// Commit a decision file
    Commit { file: PathBuf },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), LedgerError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cfg = Config::load_or_default(&cli.config)?;

    // init tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.filter));
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => {
            if Config::write_default(&cli.config)? {
                info!(path = %cli.config.display(), "Configuration written");
            }
            let cfg = Config::load(&cli.config)?;
            LedgerStore::new(&cfg.db_path)?;
        }
        Commands::Config {
            action: ConfigAction::SetDb { path },
        } => {
            Config::update_db_path(&cli.config, &path)?;
            info!(db_path = %path, "Configuration updated");
        }
        Commands::Product { action } => {
            let mut db = LedgerStore::new(&cfg.db_path)?;
            let threshold = cfg.inventory.low_stock_threshold;
            match action {
                ProductAction::Add {
                    code,
                    description,
                    short_code,
                    stock,
                    category,
                } => {
                    let product = db.add_product(&NewProduct {
                        code,
                        short_code,
                        description,
                        stock,
                        category,
                    })?;
                    print_json(&product)?;
                }
                ProductAction::List { filter } => print_json(&db.list_products(filter, threshold)?)?,
                ProductAction::Delete { filter } => {
                    let deleted = db.delete_products(filter, threshold)?;
                    print_json(&serde_json::json!({ "deleted": deleted }))?;
                }
                ProductAction::Stats => print_json(&db.stats(threshold)?)?,
            }
        }
        Commands::Invoice { action } => {
            let mut db = LedgerStore::new(&cfg.db_path)?;
            match action {
                InvoiceAction::Parse { file } => {
                    let outcome = process_invoice(&mut db, &fs::read(&file)?, &cfg.invoices)?;
                    print_json(&outcome)?;
                }
                InvoiceAction::Pending { batch_id } => {
                    let batch = db
                        .load_pending_batch(&batch_id, cfg.invoices.pending_ttl())?
                        .ok_or_else(|| LedgerError::BatchNotFound(batch_id.clone()))?;
                    print_json(&CommitRequest::template(&batch))?;
                }
                InvoiceAction::Commit { file } => {
                    let request: CommitRequest = serde_json::from_slice(&fs::read(&file)?)?;
                    let report = commit_adjudication(&mut db, request, &cfg.invoices)?;
                    print_json(&report)?;
                }
            }
        }
        Commands::Import { file } => {
            let mut db = LedgerStore::new(&cfg.db_path)?;
            let report = import_spreadsheet(&mut db, &fs::read(&file)?)?;
            print_json(&report)?;
        }
        Commands::Template { out } => {
            let file = fs::File::create(&out)?;
            match out.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("xlsx") => write_template_xlsx(file)?,
                _ => write_template(file)?,
            }
            info!(path = %out.display(), "Template written");
        }
    }

    Ok(())
}
