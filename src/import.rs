// src/import.rs

use crate::catalog::{Category, NewProduct, normalize_code, whole_units};
use crate::error::{LedgerError, Result};
use crate::ledger_db::{self, LedgerStore};
use calamine::{Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use std::io::{Cursor, Write};
use tracing::{debug, info, warn};

pub const TEMPLATE_HEADER: [&str; 4] = ["CODE", "SHORT_CODES", "DESCRIPTION", "QUANTITY"];
const TEMPLATE_EXAMPLE: [&str; 4] = ["A-001", "SUPPLIER-KEY-1, OTHER-KEY", "Sample drill", "10"];
const TEMPLATE_EXAMPLE_QUANTITY: f64 = 10.0;
const DEFAULT_DESCRIPTION: &str = "No description";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// One spreadsheet data row, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub code: String,
    pub short_codes: String,
    pub description: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported_count: usize,
    pub created: usize,
    pub updated: usize,
}

/// Upsert every row of an XLSX (first worksheet) or CSV file into the catalog.
pub fn import_spreadsheet(store: &mut LedgerStore, bytes: &[u8]) -> Result<ImportReport> {
    let rows = read_rows(bytes)?;
    let mut report = ImportReport::default();

    for (index, row) in rows.iter().enumerate() {
        let code = normalize_code(&row.code);
        if code.is_empty() {
            debug!(row = index + 2, "Row without code skipped");
            continue;
        }

        let tx = store.immediate()?;
        let created = match upsert_row(&tx, &code, row) {
            Ok(created) => created,
            Err(e) if e.is_item_level() => {
                warn!(row = index + 2, code = %code, error = %e, "Row rejected");
                continue;
            }
            Err(e) => return Err(e),
        };
        tx.commit()?;

        report.imported_count += 1;
        if created {
            report.created += 1;
        } else {
            report.updated += 1;
        }
    }

    info!(
        imported = report.imported_count,
        created = report.created,
        updated = report.updated,
        "Spreadsheet imported"
    );
    Ok(report)
}

/// Increment an existing product or create a new one. Returns true on create.
fn upsert_row(conn: &rusqlite::Connection, code: &str, row: &ImportRow) -> Result<bool> {
    let quantity = whole_units(row.quantity);

    if let Some(existing) = ledger_db::find_product_by_code(conn, code)? {
        ledger_db::increment_stock(conn, existing.id, quantity)?;
        return Ok(false);
    }

    let description = match row.description.trim() {
        "" => DEFAULT_DESCRIPTION,
        d => d,
    };
    ledger_db::insert_product(
        conn,
        &NewProduct {
            code: code.to_string(),
            short_code: first_short_code(&row.short_codes),
            description: description.to_string(),
            stock: quantity,
            category: Category::Consumable,
        },
    )?;
    Ok(true)
}

/// The short-codes column may list several comma-separated keys; the first one is kept.
fn first_short_code(raw: &str) -> Option<String> {
    let mut keys = raw.split(',').map(str::trim).filter(|k| !k.is_empty());
    let first = keys.next().map(str::to_string);
    let dropped = keys.count();
    if dropped > 0 {
        debug!(kept = ?first, dropped, "Extra short codes ignored");
    }
    first
}

/// Data rows (header skipped) from either an XLSX workbook or CSV text.
pub fn read_rows(bytes: &[u8]) -> Result<Vec<ImportRow>> {
    if bytes.starts_with(ZIP_MAGIC) {
        read_xlsx_rows(bytes)
    } else {
        read_csv_rows(bytes)
    }
}

fn read_xlsx_rows(bytes: &[u8]) -> Result<Vec<ImportRow>> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| LedgerError::InvalidSpreadsheet("workbook has no worksheets".into()))??;

    Ok(range
        .rows()
        .skip(1)
        .map(|cells| ImportRow {
            code: cell_text(cells.first()),
            short_codes: cell_text(cells.get(1)),
            description: cell_text(cells.get(2)),
            quantity: cell_number(cells.get(3)),
        })
        .collect())
}

fn cell_text(cell: Option<&Data>) -> String {
    match cell {
        Some(Data::Empty) | None => String::new(),
        Some(c) => c.to_string().trim().to_string(),
    }
}

fn cell_number(cell: Option<&Data>) -> f64 {
    match cell {
        Some(Data::Int(i)) => *i as f64,
        Some(Data::Float(f)) => *f,
        Some(Data::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn read_csv_rows(bytes: &[u8]) -> Result<Vec<ImportRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(row = index + 2, error = %e, "Unreadable CSV row skipped");
                continue;
            }
        };
        let field = |i: usize| record.get(i).unwrap_or_default().to_string();
        rows.push(ImportRow {
            code: field(0),
            short_codes: field(1),
            description: field(2),
            quantity: record
                .get(3)
                .and_then(|q| q.parse().ok())
                .unwrap_or(0.0),
        });
    }
    Ok(rows)
}

/// Write a CSV import template with one example row.
pub fn write_template<W: Write>(writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(TEMPLATE_HEADER)?;
    csv.write_record(TEMPLATE_EXAMPLE)?;
    csv.flush()?;
    Ok(())
}

/// Write the import template as an XLSX workbook: header row, one example row.
pub fn write_template_xlsx<W: Write>(mut writer: W) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Products")?;
    for (col, title) in (0u16..).zip(TEMPLATE_HEADER) {
        sheet.write_string(0, col, title)?;
    }
    for (col, value) in (0u16..).zip(&TEMPLATE_EXAMPLE[..3]) {
        sheet.write_string(1, col, *value)?;
    }
    sheet.write_number(1, 3, TEMPLATE_EXAMPLE_QUANTITY)?;

    writer.write_all(&workbook.save_to_buffer()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_imports_cleanly() {
        let mut buf = Vec::new();
        write_template(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("CODE,SHORT_CODES,DESCRIPTION,QUANTITY"));

        let mut db = LedgerStore::open_in_memory().unwrap();
        let report = import_spreadsheet(&mut db, &buf).unwrap();
        assert_eq!(report.imported_count, 1);
        assert_eq!(report.created, 1);

        let p = db.find_product_by_code("A-001").unwrap().unwrap();
        assert_eq!(p.stock, 10);
        assert_eq!(p.short_code.as_deref(), Some("SUPPLIER-KEY-1"));
        assert_eq!(p.category, Category::Consumable);
    }

    #[test]
    fn test_rows_upsert_and_skip_blank_codes() {
        let csv = "code,short_codes,description,quantity\n\
                   a-001,,Drill,5\n\
                   ,,Orphan,3\n\
                   A-001,,Drill again,2\n\
                   c'7,K1,,many\n";
        let mut db = LedgerStore::open_in_memory().unwrap();
        let report = import_spreadsheet(&mut db, csv.as_bytes()).unwrap();

        assert_eq!(report.imported_count, 3);
        assert_eq!(report.created, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(db.find_product_by_code("A-001").unwrap().unwrap().stock, 7);

        let c7 = db.find_product_by_code("C-7").unwrap().unwrap();
        assert_eq!(c7.stock, 0, "malformed quantity counts as zero");
        assert_eq!(c7.description, "No description");
        assert_eq!(c7.short_code.as_deref(), Some("K1"));
    }

    #[test]
    fn test_short_rows_are_tolerated() {
        let rows = read_rows(b"code,short,desc,qty\nONLY-CODE\n").unwrap();
        assert_eq!(
            rows,
            vec![ImportRow {
                code: "ONLY-CODE".into(),
                short_codes: String::new(),
                description: String::new(),
                quantity: 0.0,
            }]
        );
    }

    #[test]
    fn test_xlsx_template_imports_cleanly() {
        let mut buf = Vec::new();
        write_template_xlsx(&mut buf).unwrap();
        assert!(buf.starts_with(ZIP_MAGIC));

        let rows = read_rows(&buf).unwrap();
        assert_eq!(
            rows,
            vec![ImportRow {
                code: "A-001".into(),
                short_codes: "SUPPLIER-KEY-1, OTHER-KEY".into(),
                description: "Sample drill".into(),
                quantity: 10.0,
            }]
        );

        let mut db = LedgerStore::open_in_memory().unwrap();
        let report = import_spreadsheet(&mut db, &buf).unwrap();
        assert_eq!(report.created, 1);
        let p = db.find_product_by_code("A-001").unwrap().unwrap();
        assert_eq!(p.stock, 10);
        assert_eq!(p.short_code.as_deref(), Some("SUPPLIER-KEY-1"));
    }

    #[test]
    fn test_corrupt_workbook_is_an_error() {
        let err = read_rows(b"PK\x03\x04definitely not a zip").unwrap_err();
        assert!(matches!(err, LedgerError::Xlsx(_)));
    }

    #[test]
    fn test_first_short_code() {
        assert_eq!(first_short_code(" K1 , K2"), Some("K1".to_string()));
        assert_eq!(first_short_code(" , "), None);
    }

    #[test]
    fn test_cell_conversions() {
        assert_eq!(cell_number(Some(&Data::Int(4))), 4.0);
        assert_eq!(cell_number(Some(&Data::String(" 2.5 ".into()))), 2.5);
        assert_eq!(cell_number(Some(&Data::Bool(true))), 0.0);
        assert_eq!(cell_text(Some(&Data::String(" a-1 ".into()))), "a-1");
        assert_eq!(cell_text(Some(&Data::Empty)), "");
    }
}
