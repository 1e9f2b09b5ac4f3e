use crate::catalog::ProductId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid invoice document: {0}")]
    InvalidDocument(String),

    #[error("required field missing: {field}")]
    MissingField { field: &'static str },

    #[error("product code `{code}` already exists")]
    DuplicateCode { code: String },

    #[error("product {id} not found")]
    ProductNotFound { id: ProductId },

    #[error("correlation id `{0}` is not part of the pending batch")]
    UnknownCorrelation(String),

    #[error("correlation id `{0}` was already decided in this request")]
    DuplicateDecision(String),

    #[error("pending batch `{0}` not found or expired")]
    BatchNotFound(String),

    #[error("invalid spreadsheet: {0}")]
    InvalidSpreadsheet(String),

    #[error("migration {version} was modified after being applied (stored {stored}, current {current})")]
    MigrationChecksum {
        version: i64,
        stored: String,
        current: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config edit error: {0}")]
    ConfigEdit(#[from] toml_edit::TomlError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("xlsx error: {0}")]
    Xlsx(#[from] calamine::XlsxError),

    #[error("xlsx write error: {0}")]
    XlsxWrite(#[from] rust_xlsxwriter::XlsxError),
}

impl LedgerError {
    /// Errors that only invalidate a single batch item and never abort the batch.
    pub fn is_item_level(&self) -> bool {
        matches!(
            self,
            LedgerError::MissingField { .. }
                | LedgerError::DuplicateCode { .. }
                | LedgerError::ProductNotFound { .. }
                | LedgerError::UnknownCorrelation(_)
                | LedgerError::DuplicateDecision(_)
        )
    }

    /// Stable machine-readable label, used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::InvalidDocument(_) => "invalid_document",
            LedgerError::MissingField { .. } => "missing_field",
            LedgerError::DuplicateCode { .. } => "duplicate_code",
            LedgerError::ProductNotFound { .. } => "product_not_found",
            LedgerError::UnknownCorrelation(_) => "unknown_correlation",
            LedgerError::DuplicateDecision(_) => "duplicate_decision",
            LedgerError::BatchNotFound(_) => "batch_not_found",
            LedgerError::InvalidSpreadsheet(_) => "invalid_spreadsheet",
            LedgerError::MigrationChecksum { .. } => "migration_checksum",
            LedgerError::Storage(_) => "storage",
            LedgerError::Io(_) => "io",
            LedgerError::Json(_) => "json",
            LedgerError::Config(_) | LedgerError::ConfigEdit(_) => "config",
            LedgerError::Csv(_) | LedgerError::Xlsx(_) | LedgerError::XlsxWrite(_) => "spreadsheet",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_level_classification() {
        assert!(LedgerError::MissingField { field: "target_code" }.is_item_level());
        assert!(LedgerError::DuplicateCode { code: "A".into() }.is_item_level());
        assert!(LedgerError::DuplicateDecision("c1".into()).is_item_level());
        assert!(!LedgerError::InvalidDocument("x".into()).is_item_level());
        assert!(!LedgerError::BatchNotFound("b".into()).is_item_level());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(
            LedgerError::MissingField { field: "target_code" }.kind(),
            "missing_field"
        );
        assert_eq!(LedgerError::ProductNotFound { id: 7 }.kind(), "product_not_found");
    }
}
