pub mod adjudication;
pub mod catalog;
pub mod config;
pub mod error;
pub mod import;
pub mod invoice;
pub mod ledger_db;
pub mod migrations;
pub mod reconcile;

pub use adjudication::{AdjudicatedItem, CommitReport, CommitRequest, Disposition, commit_adjudication};
pub use catalog::{Category, NewProduct, Product, ProductFilter, ProductId};
pub use error::{LedgerError, Result};
pub use import::{ImportReport, import_spreadsheet, write_template, write_template_xlsx};
pub use invoice::{Invoice, LineItem, UnmatchedItem, parse_invoice};
pub use ledger_db::{LedgerStore, MappingConflict, SupplierCodeMapping};
pub use reconcile::{InvoiceOutcome, process_invoice, reconcile};
