// src/reconcile.rs

use crate::catalog::{ProductId, whole_units};
use crate::config::InvoiceSection;
use crate::error::Result;
use crate::invoice::{self, Invoice, LineItem, UnmatchedItem};
use crate::ledger_db::{self, LedgerStore, MappingOutcome};
use rusqlite::Transaction;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// How a single line item was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Resolved through an existing supplier mapping.
    Mapped(ProductId),
    /// Resolved by matching the supplier code against a product code or short code.
    CodeMatch(ProductId),
    Unmatched,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub resolved_count: usize,
    pub unmatched: Vec<UnmatchedItem>,
}

/// Result of `process_invoice`: the report plus the pending batch holding the unmatched items.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceOutcome {
    pub issuer_id: String,
    pub resolved_count: usize,
    pub unmatched: Vec<UnmatchedItem>,
    pub batch_id: Option<String>,
}

/// Parse an invoice, auto-resolve what we can, and park the rest for adjudication.
pub fn process_invoice(
    store: &mut LedgerStore,
    document: &[u8],
    settings: &InvoiceSection,
) -> Result<InvoiceOutcome> {
    let invoice = invoice::parse_invoice(document, &settings.fallback_issuer)?;
    store.purge_expired_batches(settings.pending_ttl())?;

    let report = reconcile(store, &invoice)?;
    let batch_id = if report.unmatched.is_empty() {
        None
    } else {
        Some(store.save_pending_batch(&invoice.issuer_id, &report.unmatched)?)
    };

    Ok(InvoiceOutcome {
        issuer_id: invoice.issuer_id,
        resolved_count: report.resolved_count,
        unmatched: report.unmatched,
        batch_id,
    })
}

/// Resolve every line of `invoice` in document order. Each line commits on its own.
pub fn reconcile(store: &mut LedgerStore, invoice: &Invoice) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for line in &invoice.line_items {
        let mut tx = store.immediate()?;
        let resolution = resolve_line(&mut tx, &invoice.issuer_id, line)?;
        tx.commit()?;

        match resolution {
            Resolution::Mapped(_) | Resolution::CodeMatch(_) => report.resolved_count += 1,
            Resolution::Unmatched => report.unmatched.push(UnmatchedItem {
                correlation_id: Uuid::new_v4().to_string(),
                issuer_id: invoice.issuer_id.clone(),
                supplier_code: line.supplier_code.clone(),
                description: line.description.clone(),
                quantity: line.quantity,
                unit_cost: line.unit_cost,
            }),
        }
    }

    info!(
        issuer = %invoice.issuer_id,
        resolved = report.resolved_count,
        unmatched = report.unmatched.len(),
        "Invoice reconciled"
    );
    Ok(report)
}

/// Settle one line inside `tx`: mapping first, then direct code match.
pub fn resolve_line(tx: &mut Transaction<'_>, issuer_id: &str, line: &LineItem) -> Result<Resolution> {
    let delta = whole_units(line.quantity);
    if delta == 0 && line.quantity != 0.0 {
        warn!(code = %line.supplier_code, quantity = line.quantity, "Quantity not usable, adding no stock");
    }

    if let Some(mapping) = ledger_db::find_mapping(tx, issuer_id, &line.supplier_code)? {
        if ledger_db::increment_stock(tx, mapping.product_id, delta)? {
            info!(code = %line.supplier_code, product_id = mapping.product_id, delta, "Auto-matched via mapping");
            return Ok(Resolution::Mapped(mapping.product_id));
        }
        warn!(
            supplier = %issuer_id,
            code = %line.supplier_code,
            product_id = mapping.product_id,
            "Mapping points at a deleted product, treating as no match"
        );
    }

    let Some(product) = ledger_db::find_product_by_any_code(tx, &line.supplier_code)? else {
        info!(code = %line.supplier_code, "No match, queued for adjudication");
        return Ok(Resolution::Unmatched);
    };

    if let Some(MappingOutcome::Conflict(conflict)) =
        ledger_db::remember_mapping(tx, issuer_id, &line.supplier_code, product.id)
    {
        warn!(%conflict, "Mapping conflict");
    }
    ledger_db::increment_stock(tx, product.id, delta)?;
    info!(code = %line.supplier_code, product_id = product.id, delta, "Auto-matched via product code");
    Ok(Resolution::CodeMatch(product.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Category, NewProduct, ProductFilter};

    const ISSUER: &str = "AAA010101AAA";

    fn line(code: &str, quantity: f64) -> LineItem {
        LineItem {
            supplier_code: code.into(),
            description: format!("{code} from supplier"),
            quantity,
            unit_cost: 1.0,
        }
    }

    fn invoice(lines: Vec<LineItem>) -> Invoice {
        Invoice {
            issuer_id: ISSUER.into(),
            issuer_name: None,
            folio: None,
            issued_at: None,
            currency: None,
            total: None,
            line_items: lines,
        }
    }

    fn add(db: &mut LedgerStore, code: &str, short_code: Option<&str>, stock: i64) -> ProductId {
        db.add_product(&NewProduct {
            code: code.into(),
            short_code: short_code.map(str::to_string),
            description: "item".into(),
            stock,
            category: Category::Consumable,
        })
        .unwrap()
        .id
    }

    #[test]
    fn test_code_match_memoizes_mapping() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        let id = add(&mut db, "B-100", Some("X1"), 0);

        let report = reconcile(&mut db, &invoice(vec![line("X1", 10.0)])).unwrap();
        assert_eq!(report.resolved_count, 1);
        assert!(report.unmatched.is_empty());
        assert_eq!(db.get_product(id).unwrap().unwrap().stock, 10);
        assert_eq!(db.get_mapping(ISSUER, "X1").unwrap().unwrap().product_id, id);

        let mut tx = db.immediate().unwrap();
        let second = resolve_line(&mut tx, ISSUER, &line("X1", 1.0)).unwrap();
        tx.commit().unwrap();
        assert_eq!(second, Resolution::Mapped(id));
    }

    #[test]
    fn test_mapping_beats_code_match() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        let mapped = add(&mut db, "MAPPED", None, 0);
        let same_code = add(&mut db, "X1", None, 0);
        ledger_db::upsert_mapping(db.connection(), ISSUER, "X1", mapped).unwrap();

        reconcile(&mut db, &invoice(vec![line("X1", 4.0)])).unwrap();
        assert_eq!(db.get_product(mapped).unwrap().unwrap().stock, 4);
        assert_eq!(db.get_product(same_code).unwrap().unwrap().stock, 0);
    }

    #[test]
    fn test_mapping_is_per_issuer() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        let id = add(&mut db, "P-1", None, 0);
        ledger_db::upsert_mapping(db.connection(), "OTHER010101AAA", "X1", id).unwrap();

        let report = reconcile(&mut db, &invoice(vec![line("X1", 1.0)])).unwrap();
        assert_eq!(report.resolved_count, 0);
        assert_eq!(report.unmatched.len(), 1);
    }

    #[test]
    fn test_unmatched_items_keep_document_order_and_fresh_ids() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        add(&mut db, "KNOWN", None, 0);

        let report = reconcile(
            &mut db,
            &invoice(vec![line("U1", 1.0), line("KNOWN", 2.0), line("U2", 3.0)]),
        )
        .unwrap();
        assert_eq!(report.resolved_count, 1);
        let codes: Vec<&str> = report
            .unmatched
            .iter()
            .map(|u| u.supplier_code.as_str())
            .collect();
        assert_eq!(codes, vec!["U1", "U2"]);
        assert_ne!(report.unmatched[0].correlation_id, report.unmatched[1].correlation_id);
        assert_eq!(report.unmatched[1].quantity, 3.0);
        assert_eq!(report.unmatched[1].issuer_id, ISSUER);
        assert_eq!(db.get_counts().unwrap().1, 1, "unmatched lines create no mapping");
    }

    #[test]
    fn test_dangling_mapping_falls_through_to_code_match() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        let gone = add(&mut db, "OLD", None, 0);
        ledger_db::upsert_mapping(db.connection(), ISSUER, "X1", gone).unwrap();
        db.delete_products(ProductFilter::All, 5).unwrap();

        let report = reconcile(&mut db, &invoice(vec![line("X1", 2.0)])).unwrap();
        assert_eq!(report.unmatched.len(), 1, "dangling mapping is no match");

        let fresh = add(&mut db, "X1", None, 0);
        let report = reconcile(&mut db, &invoice(vec![line("X1", 2.0)])).unwrap();
        assert_eq!(report.resolved_count, 1);
        assert_eq!(db.get_product(fresh).unwrap().unwrap().stock, 2);
        assert_eq!(db.get_mapping(ISSUER, "X1").unwrap().unwrap().product_id, fresh);
    }

    #[test]
    fn test_nan_quantity_resolves_without_stock_change() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        let id = add(&mut db, "X1", None, 7);

        let report = reconcile(&mut db, &invoice(vec![line("X1", f64::NAN)])).unwrap();
        assert_eq!(report.resolved_count, 1);
        assert_eq!(db.get_product(id).unwrap().unwrap().stock, 7);
    }

    #[test]
    fn test_process_invoice_parks_unmatched_in_pending_batch() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        let xml = br#"<cfdi:Comprobante xmlns:cfdi="http://www.sat.gob.mx/cfd/4">
            <cfdi:Emisor Rfc="AAA010101AAA"/>
            <cfdi:Conceptos>
              <cfdi:Concepto NoIdentificacion="X1" Descripcion="Bolt" Cantidad="10" ValorUnitario="2.5"/>
            </cfdi:Conceptos>
        </cfdi:Comprobante>"#;

        let outcome = process_invoice(&mut db, xml, &InvoiceSection::default()).unwrap();
        assert_eq!(outcome.resolved_count, 0);
        let batch_id = outcome.batch_id.expect("batch stored");
        let batch = db
            .load_pending_batch(&batch_id, InvoiceSection::default().pending_ttl())
            .unwrap()
            .unwrap();
        assert_eq!(batch.items, outcome.unmatched);
    }

    #[test]
    fn test_process_invoice_without_unmatched_stores_no_batch() {
        let mut db = LedgerStore::open_in_memory().unwrap();
        add(&mut db, "X1", None, 0);
        let xml = br#"<Comprobante><Emisor Rfc="AAA010101AAA"/><Conceptos>
            <Concepto NoIdentificacion="X1" Cantidad="1" ValorUnitario="1"/>
        </Conceptos></Comprobante>"#;

        let outcome = process_invoice(&mut db, xml, &InvoiceSection::default()).unwrap();
        assert_eq!(outcome.resolved_count, 1);
        assert!(outcome.batch_id.is_none());
        assert_eq!(db.get_counts().unwrap().2, 0);
    }
}
