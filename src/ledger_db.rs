use crate::catalog::{
    CatalogStats, MAX_STOCK, NewProduct, Product, ProductFilter, ProductId, normalize_code,
};
use crate::error::{LedgerError, Result};
use crate::invoice::UnmatchedItem;
use crate::migrations::{self, MIGRATIONS};
use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter,
};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PRODUCT_COLUMNS: &str = "id, code, short_code, description, stock, category";

pub struct LedgerStore {
    conn: Connection,
}

/// Persisted `(supplier_id, supplier_code) -> product_id` association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplierCodeMapping {
    pub supplier_id: String,
    pub supplier_code: String,
    pub product_id: ProductId,
}

/// A mapping re-submission that disagrees with the stored target. The stored target wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingConflict {
    pub supplier_id: String,
    pub supplier_code: String,
    pub existing_product_id: ProductId,
    pub rejected_product_id: ProductId,
}

impl fmt::Display for MappingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "code {} from {} already maps to product {} (ignored {})",
            self.supplier_code, self.supplier_id, self.existing_product_id, self.rejected_product_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
    Created,
    /// Already pointed at the requested product.
    Unchanged,
    /// The previous target had been deleted; the pair now points at the new product.
    ReplacedDangling { previous: ProductId },
    Conflict(MappingConflict),
}

/// Unmatched items held server-side between parsing and adjudication.
#[derive(Debug, Clone, Serialize)]
pub struct PendingBatch {
    pub batch_id: String,
    pub issuer_id: String,
    pub created_at: i64,
    pub items: Vec<UnmatchedItem>,
}

impl LedgerStore {
    /// Open (or create) the SQLite ledger and bring its schema up to date.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        // Concurrent writers wait for each other's IMMEDIATE transactions instead of failing.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        info!(path = %db_path.display(), "Opening ledger database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        let applied = migrations::run(&mut conn, MIGRATIONS)?;
        info!(applied, "Database initialized successfully");
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Start a read-modify-write unit that holds the write lock from its first statement.
    pub fn immediate(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Manual entry: create a product, rejecting duplicate codes.
    pub fn add_product(&mut self, new: &NewProduct) -> Result<Product> {
        let tx = self.immediate()?;
        let id = insert_product(&tx, new)?;
        let product = find_product(&tx, id)?.ok_or(LedgerError::ProductNotFound { id })?;
        tx.commit()?;
        Ok(product)
    }

    pub fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        find_product(&self.conn, id)
    }

    pub fn find_product_by_code(&self, code: &str) -> Result<Option<Product>> {
        find_product_by_code(&self.conn, &normalize_code(code))
    }

    /// Products matching `filter`, newest first.
    pub fn list_products(&self, filter: ProductFilter, low_stock_threshold: i64) -> Result<Vec<Product>> {
        let (predicate, bound) = filter.predicate(low_stock_threshold);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE {predicate}
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params_from_iter(bound.iter()), row_to_product)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Bulk delete by filter. Supplier mappings to deleted products are left dangling.
    pub fn delete_products(&mut self, filter: ProductFilter, low_stock_threshold: i64) -> Result<usize> {
        let (predicate, bound) = filter.predicate(low_stock_threshold);
        let tx = self.immediate()?;
        let deleted = tx.execute(
            &format!("DELETE FROM products WHERE {predicate}"),
            params_from_iter(bound.iter()),
        )?;
        tx.commit()?;
        info!(?filter, deleted, "Products deleted");
        Ok(deleted)
    }

    pub fn stats(&self, low_stock_threshold: i64) -> Result<CatalogStats> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(category = 'tool'), 0),
                    COALESCE(SUM(category = 'consumable'), 0),
                    COALESCE(SUM(stock < ?1), 0)
             FROM products",
            params![low_stock_threshold],
            |row| {
                Ok(CatalogStats {
                    total: row.get(0)?,
                    tools: row.get(1)?,
                    consumables: row.get(2)?,
                    low_stock: row.get(3)?,
                })
            },
        )?)
    }

    // -----------------------------------------------------------------------
    // Supplier code map
    // -----------------------------------------------------------------------

    pub fn get_mapping(&self, supplier_id: &str, supplier_code: &str) -> Result<Option<SupplierCodeMapping>> {
        find_mapping(&self.conn, supplier_id, supplier_code)
    }

    pub fn mappings_for_product(&self, product_id: ProductId) -> Result<Vec<SupplierCodeMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT supplier_id, supplier_code, product_id FROM supplier_codes
             WHERE product_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![product_id], row_to_mapping)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Pending adjudication batches
    // -----------------------------------------------------------------------

    /// Store unmatched items under a fresh batch id.
    pub fn save_pending_batch(&self, issuer_id: &str, items: &[UnmatchedItem]) -> Result<String> {
        self.save_pending_batch_at(issuer_id, items, OffsetDateTime::now_utc())
    }

    pub(crate) fn save_pending_batch_at(
        &self,
        issuer_id: &str,
        items: &[UnmatchedItem],
        created_at: OffsetDateTime,
    ) -> Result<String> {
        let batch_id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO pending_batches (batch_id, issuer_id, items, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                batch_id,
                issuer_id,
                serde_json::to_string(items)?,
                created_at.unix_timestamp()
            ],
        )?;
        info!(batch_id = %batch_id, items = items.len(), "Pending batch stored");
        Ok(batch_id)
    }

    /// Load a batch that is younger than `ttl`.
    pub fn load_pending_batch(&self, batch_id: &str, ttl: Duration) -> Result<Option<PendingBatch>> {
        let cutoff = (OffsetDateTime::now_utc() - ttl).unix_timestamp();
        let row: Option<(String, String, String, i64)> = self
            .conn
            .query_row(
                "SELECT batch_id, issuer_id, items, created_at FROM pending_batches
                 WHERE batch_id = ?1 AND created_at >= ?2",
                params![batch_id, cutoff],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((batch_id, issuer_id, items, created_at)) => Ok(Some(PendingBatch {
                batch_id,
                issuer_id,
                created_at,
                items: serde_json::from_str(&items)?,
            })),
            None => Ok(None),
        }
    }

    pub fn delete_pending_batch(&self, batch_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM pending_batches WHERE batch_id = ?1",
            params![batch_id],
        )?;
        Ok(deleted > 0)
    }

    /// Drop batches older than `ttl`. Returns how many were removed.
    pub fn purge_expired_batches(&self, ttl: Duration) -> Result<usize> {
        let cutoff = (OffsetDateTime::now_utc() - ttl).unix_timestamp();
        let purged = self.conn.execute(
            "DELETE FROM pending_batches WHERE created_at < ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            info!(purged, "Expired pending batches removed");
        }
        Ok(purged)
    }

    /// Get count of products, mappings and pending batches
    pub fn get_counts(&self) -> Result<(usize, usize, usize)> {
        let products: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        let mappings: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM supplier_codes", [], |row| row.get(0))?;
        let pending: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_batches", [], |row| row.get(0))?;
        Ok((products, mappings, pending))
    }
}

// ---------------------------------------------------------------------------
// Row-level operations. These take a plain connection so they run unchanged
// inside a transaction or savepoint.
// ---------------------------------------------------------------------------

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        code: row.get(1)?,
        short_code: row.get(2)?,
        description: row.get(3)?,
        stock: row.get(4)?,
        category: row.get(5)?,
    })
}

fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<SupplierCodeMapping> {
    Ok(SupplierCodeMapping {
        supplier_id: row.get(0)?,
        supplier_code: row.get(1)?,
        product_id: row.get(2)?,
    })
}

pub fn find_product(conn: &Connection, id: ProductId) -> Result<Option<Product>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"),
            params![id],
            row_to_product,
        )
        .optional()?)
}

/// Exact match on an already-normalized code.
pub fn find_product_by_code(conn: &Connection, code: &str) -> Result<Option<Product>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE code = ?1"),
            params![code],
            row_to_product,
        )
        .optional()?)
}

/// First product (lowest id) whose code or short code equals `code`.
///
/// `short_code` is not unique, so several products may qualify; the oldest wins.
pub fn find_product_by_any_code(conn: &Connection, code: &str) -> Result<Option<Product>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                 WHERE code = ?1 OR short_code = ?1
                 ORDER BY id LIMIT 1"
            ),
            params![code],
            row_to_product,
        )
        .optional()?)
}

/// Insert a product after normalizing its code. Fails on empty fields or a taken code.
pub fn insert_product(conn: &Connection, new: &NewProduct) -> Result<ProductId> {
    let code = normalize_code(&new.code);
    if code.is_empty() {
        return Err(LedgerError::MissingField { field: "code" });
    }
    let description = new.description.trim();
    if description.is_empty() {
        return Err(LedgerError::MissingField {
            field: "description",
        });
    }
    if find_product_by_code(conn, &code)?.is_some() {
        return Err(LedgerError::DuplicateCode { code });
    }
    let short_code = new
        .short_code
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    conn.execute(
        "INSERT INTO products (code, short_code, description, stock, category)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            code,
            short_code,
            description,
            new.stock.clamp(0, MAX_STOCK),
            new.category
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(product_id = id, code = %code, stock = new.stock, "Product created");
    Ok(id)
}

/// Add `delta` units, saturating at [`MAX_STOCK`]. Returns false when the
/// product does not exist.
pub fn increment_stock(conn: &Connection, id: ProductId, delta: i64) -> Result<bool> {
    let delta = delta.clamp(0, MAX_STOCK);
    let updated = conn.execute(
        "UPDATE products SET stock = MIN(stock + ?1, ?3) WHERE id = ?2",
        params![delta, id, MAX_STOCK],
    )?;
    if updated > 0 {
        debug!(product_id = id, delta, "Stock incremented");
    }
    Ok(updated > 0)
}

pub fn find_mapping(
    conn: &Connection,
    supplier_id: &str,
    supplier_code: &str,
) -> Result<Option<SupplierCodeMapping>> {
    Ok(conn
        .query_row(
            "SELECT supplier_id, supplier_code, product_id FROM supplier_codes
             WHERE supplier_id = ?1 AND supplier_code = ?2",
            params![supplier_id, supplier_code],
            row_to_mapping,
        )
        .optional()?)
}

/// Remove one decided item from a stored batch. Returns false when the batch
/// or the item is gone.
pub fn take_pending_item(conn: &Connection, batch_id: &str, correlation_id: &str) -> Result<bool> {
    let items: Option<String> = conn
        .query_row(
            "SELECT items FROM pending_batches WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(items) = items else {
        return Ok(false);
    };

    let mut items: Vec<UnmatchedItem> = serde_json::from_str(&items)?;
    let before = items.len();
    items.retain(|item| item.correlation_id != correlation_id);
    if items.len() == before {
        return Ok(false);
    }
    conn.execute(
        "UPDATE pending_batches SET items = ?1 WHERE batch_id = ?2",
        params![serde_json::to_string(&items)?, batch_id],
    )?;
    debug!(batch_id, correlation_id, remaining = items.len(), "Pending item consumed");
    Ok(true)
}

/// Find-or-create a mapping. A live target is never re-pointed (first write wins);
/// a dangling one is replaced.
pub fn upsert_mapping(
    conn: &Connection,
    supplier_id: &str,
    supplier_code: &str,
    product_id: ProductId,
) -> Result<MappingOutcome> {
    let Some(existing) = find_mapping(conn, supplier_id, supplier_code)? else {
        conn.execute(
            "INSERT INTO supplier_codes (supplier_id, supplier_code, product_id) VALUES (?1, ?2, ?3)",
            params![supplier_id, supplier_code, product_id],
        )?;
        info!(supplier = %supplier_id, code = %supplier_code, product_id, "Supplier mapping created");
        return Ok(MappingOutcome::Created);
    };

    if existing.product_id == product_id {
        return Ok(MappingOutcome::Unchanged);
    }

    if find_product(conn, existing.product_id)?.is_none() {
        conn.execute(
            "UPDATE supplier_codes SET product_id = ?1 WHERE supplier_id = ?2 AND supplier_code = ?3",
            params![product_id, supplier_id, supplier_code],
        )?;
        info!(
            supplier = %supplier_id,
            code = %supplier_code,
            previous = existing.product_id,
            product_id,
            "Dangling supplier mapping replaced"
        );
        return Ok(MappingOutcome::ReplacedDangling {
            previous: existing.product_id,
        });
    }

    Ok(MappingOutcome::Conflict(MappingConflict {
        supplier_id: supplier_id.to_string(),
        supplier_code: supplier_code.to_string(),
        existing_product_id: existing.product_id,
        rejected_product_id: product_id,
    }))
}

/// Upsert a mapping inside its own savepoint. A failed write is rolled back on its
/// own, logged, and reported as `None`; the surrounding transaction carries on.
pub fn remember_mapping(
    tx: &mut Transaction<'_>,
    supplier_id: &str,
    supplier_code: &str,
    product_id: ProductId,
) -> Option<MappingOutcome> {
    match upsert_in_savepoint(tx, supplier_id, supplier_code, product_id) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(
                supplier = %supplier_id,
                code = %supplier_code,
                product_id,
                error = %e,
                "Supplier mapping write failed (ignored)"
            );
            None
        }
    }
}

fn upsert_in_savepoint(
    tx: &mut Transaction<'_>,
    supplier_id: &str,
    supplier_code: &str,
    product_id: ProductId,
) -> Result<MappingOutcome> {
    let sp = tx.savepoint()?;
    let outcome = upsert_mapping(&sp, supplier_id, supplier_code, product_id)?;
    sp.commit()?;
    Ok(outcome)
}
