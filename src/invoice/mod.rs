// src/invoice/mod.rs

mod cfdi;

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};

pub use cfdi::looks_like_rfc;

/// Issuer id used when an invoice carries no usable issuer block.
pub const DEFAULT_ISSUER: &str = "GENERIC";

/// A single supplier line item, in document order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub supplier_code: String,
    pub description: String,
    /// NaN when the document value could not be parsed.
    #[serde(deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub unit_cost: f64,
}

/// Everything we read out of a supplier invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub issuer_id: String,
    pub issuer_name: Option<String>,
    pub folio: Option<String>,
    pub issued_at: Option<String>,
    pub currency: Option<String>,
    pub total: Option<f64>,
    pub line_items: Vec<LineItem>,
}

/// A line item that could not be auto-matched and awaits a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedItem {
    pub correlation_id: String,
    pub issuer_id: String,
    pub supplier_code: String,
    pub description: String,
    #[serde(deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub unit_cost: f64,
}

/// Parse a CFDI tax invoice. `fallback_issuer` replaces a missing issuer id.
pub fn parse_invoice(bytes: &[u8], fallback_issuer: &str) -> Result<Invoice> {
    cfdi::extract(bytes, fallback_issuer)
}

/// serde_json writes non-finite floats as `null`; read them back as NaN.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmatched_item_survives_nan_through_json() {
        let item = UnmatchedItem {
            correlation_id: "c1".into(),
            issuer_id: "AAA010101AAA".into(),
            supplier_code: "X1".into(),
            description: "Bolt".into(),
            quantity: f64::NAN,
            unit_cost: 2.5,
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"quantity\":null"));

        let back: UnmatchedItem = serde_json::from_str(&json).unwrap();
        assert!(back.quantity.is_nan());
        assert_eq!(back.unit_cost, 2.5);
    }
}
