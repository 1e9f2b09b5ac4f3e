// src/catalog.rs

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Row id of a product. Never reused after deletion (AUTOINCREMENT).
pub type ProductId = i64;

/// Products below this stock level count as "low" unless configured otherwise.
pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 5;

/// Upper bound for a product's stock and for a single stock delta.
pub const MAX_STOCK: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "herramienta")]
    Tool,
    #[default]
    #[serde(alias = "consumible")]
    Consumable,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tool => "tool",
            Category::Consumable => "consumable",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown category `{0}` (expected tool or consumable)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tool" | "herramienta" => Ok(Category::Tool),
            "consumable" | "consumible" => Ok(Category::Consumable),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

impl ToSql for Category {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Category {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A stocked inventory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub code: String,
    pub short_code: Option<String>,
    pub description: String,
    pub stock: i64,
    pub category: Category,
}

/// Input for creating a product. `code` is normalized on insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProduct {
    pub code: String,
    #[serde(default)]
    pub short_code: Option<String>,
    pub description: String,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub category: Category,
}

/// Selection used by listing, bulk deletion and the dashboard counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProductFilter {
    #[default]
    All,
    Tool,
    Consumable,
    /// Stock strictly below the low-stock threshold.
    Low,
}

#[derive(Debug, Error)]
#[error("unknown filter `{0}` (expected all, tool, consumable or low)")]
pub struct UnknownFilter(pub String);

impl FromStr for ProductFilter {
    type Err = UnknownFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(ProductFilter::All),
            "tool" | "herramienta" => Ok(ProductFilter::Tool),
            "consumable" | "consumible" => Ok(ProductFilter::Consumable),
            "low" => Ok(ProductFilter::Low),
            other => Err(UnknownFilter(other.to_string())),
        }
    }
}

impl ProductFilter {
    /// SQL predicate plus the threshold parameter it binds, if any.
    pub(crate) fn predicate(self, low_stock_threshold: i64) -> (&'static str, Option<i64>) {
        match self {
            ProductFilter::All => ("1 = 1", None),
            ProductFilter::Tool => ("category = 'tool'", None),
            ProductFilter::Consumable => ("category = 'consumable'", None),
            ProductFilter::Low => ("stock < ?1", Some(low_stock_threshold)),
        }
    }
}

/// Dashboard counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CatalogStats {
    pub total: i64,
    pub tools: i64,
    pub consumables: i64,
    pub low_stock: i64,
}

/// Uppercase, apostrophes to hyphens, trimmed.
pub fn normalize_code(raw: &str) -> String {
    raw.to_uppercase().replace('\'', "-").trim().to_string()
}

/// Convert an invoice/spreadsheet quantity into a stock delta.
///
/// Rounds to the nearest whole unit. NaN, infinite and negative quantities
/// contribute nothing: stock is never decremented on these paths.
/// Quantities above [`MAX_STOCK`] are capped.
pub fn whole_units(quantity: f64) -> i64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0;
    }
    let units = quantity.round();
    if units > MAX_STOCK as f64 {
        warn!(quantity, cap = MAX_STOCK, "Quantity out of range, capped");
        return MAX_STOCK;
    }
    units as i64
}

/// Trim and drop empty strings.
pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  a-001 "), "A-001");
        assert_eq!(normalize_code("b'100"), "B-100");
        assert_eq!(normalize_code("   "), "");
    }

    #[test]
    fn test_whole_units() {
        assert_eq!(whole_units(10.0), 10);
        assert_eq!(whole_units(2.6), 3);
        assert_eq!(whole_units(f64::NAN), 0);
        assert_eq!(whole_units(-4.0), 0);
        assert_eq!(whole_units(f64::INFINITY), 0);
        assert_eq!(whole_units(1e19), MAX_STOCK);
        assert_eq!(whole_units(MAX_STOCK as f64), MAX_STOCK);
    }

    #[test]
    fn test_category_parsing_accepts_legacy_labels() {
        assert_eq!("tool".parse::<Category>().unwrap(), Category::Tool);
        assert_eq!("Herramienta".parse::<Category>().unwrap(), Category::Tool);
        assert_eq!("consumible".parse::<Category>().unwrap(), Category::Consumable);
        assert!("widget".parse::<Category>().is_err());
        assert_eq!(Category::default(), Category::Consumable);
    }

    #[test]
    fn test_category_serde_alias() {
        let c: Category = serde_json::from_str("\"herramienta\"").unwrap();
        assert_eq!(c, Category::Tool);
        assert_eq!(serde_json::to_string(&Category::Consumable).unwrap(), "\"consumable\"");
    }

    #[test]
    fn test_filter_parsing() {
        assert_eq!("LOW".parse::<ProductFilter>().unwrap(), ProductFilter::Low);
        assert_eq!("all".parse::<ProductFilter>().unwrap(), ProductFilter::All);
        assert!("everything".parse::<ProductFilter>().is_err());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some("  x ")), Some("x".to_string()));
        assert_eq!(non_empty(Some("   ")), None);
        assert_eq!(non_empty(None), None);
    }
}
