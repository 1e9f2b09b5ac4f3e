use crate::catalog::DEFAULT_LOW_STOCK_THRESHOLD;
use crate::error::Result;
use crate::invoice::DEFAULT_ISSUER;
use serde::Deserialize;
use std::{fs, io, path::Path};
use time::Duration;
use toml_edit::{DocumentMut, value};

pub const DEFAULT_CONFIG_PATH: &str = "stock_ledger.toml";

/// Written by `stock_ledger init`.
pub const DEFAULT_CONFIG: &str = r#"# stock_ledger configuration

# SQLite database file; parent directories are created on first use.
db_path = "inventory/stock.db"

[inventory]
# Products with stock below this count as low.
low_stock_threshold = 5

[invoices]
# Unadjudicated batches older than this are discarded.
pending_ttl_hours = 72
# Issuer id recorded when an invoice has no RFC.
fallback_issuer = "GENERIC"

[logging]
# tracing EnvFilter directive; RUST_LOG takes precedence.
filter = "info"
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub inventory: InventorySection,
    #[serde(default)]
    pub invoices: InvoiceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

fn default_db_path() -> String {
    "inventory/stock.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventorySection {
    pub low_stock_threshold: i64,
}

impl Default for InventorySection {
    fn default() -> Self {
        Self {
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvoiceSection {
    pub pending_ttl_hours: i64,
    pub fallback_issuer: String,
}

impl Default for InvoiceSection {
    fn default() -> Self {
        Self {
            pending_ttl_hours: 72,
            fallback_issuer: DEFAULT_ISSUER.to_string(),
        }
    }
}

impl InvoiceSection {
    pub fn pending_ttl(&self) -> Duration {
        Duration::hours(self.pending_ttl_hours.max(0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            inventory: InventorySection::default(),
            invoices: InvoiceSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the commented default file. Returns false if one already exists.
    pub fn write_default(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(false);
        }
        fs::write(path, DEFAULT_CONFIG)?;
        Ok(true)
    }

    /// Rewrite `db_path` in place, keeping comments and layout.
    pub fn update_db_path(path: impl AsRef<Path>, db_path: &str) -> Result<()> {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let mut doc = content.parse::<DocumentMut>()?;

        doc["db_path"] = value(db_path);

        fs::write(&path, doc.to_string())?;
        Ok(())
    }
}
