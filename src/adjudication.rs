// src/adjudication.rs

use crate::catalog::{Category, NewProduct, ProductId, non_empty, whole_units};
use crate::config::InvoiceSection;
use crate::error::{LedgerError, Result};
use crate::invoice::{UnmatchedItem, lenient_f64};
use crate::ledger_db::{self, LedgerStore, MappingConflict, MappingOutcome, PendingBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// The human decision for one unmatched line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Disposition {
    #[serde(alias = "NEW")]
    Create,
    Link,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicatedItem {
    pub correlation_id: String,
    pub disposition: Disposition,
    #[serde(default)]
    pub issuer_id: String,
    #[serde(default)]
    pub supplier_code: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_code: Option<String>,
    #[serde(default)]
    pub target_description: Option<String>,
    #[serde(default)]
    pub target_category: Option<Category>,
    #[serde(default)]
    pub target_product_id: Option<ProductId>,
}

impl AdjudicatedItem {
    /// A SKIP decision pre-filled from an unmatched line, for editing by a human.
    pub fn undecided(item: &UnmatchedItem) -> Self {
        Self {
            correlation_id: item.correlation_id.clone(),
            disposition: Disposition::Skip,
            issuer_id: item.issuer_id.clone(),
            supplier_code: item.supplier_code.clone(),
            quantity: item.quantity,
            description: item.description.clone(),
            target_code: None,
            target_description: Some(item.description.clone()),
            target_category: None,
            target_product_id: None,
        }
    }

    /// Take issuer, code and quantity from the server-held record.
    fn bind_to(mut self, pending: &UnmatchedItem) -> Self {
        self.issuer_id = pending.issuer_id.clone();
        self.supplier_code = pending.supplier_code.clone();
        self.quantity = pending.quantity;
        if self.description.is_empty() {
            self.description = pending.description.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    /// When set, items are checked against and completed from this pending batch.
    #[serde(default)]
    pub batch_id: Option<String>,
    pub items: Vec<AdjudicatedItem>,
}

impl CommitRequest {
    /// Decision template for a pending batch: every item starts as SKIP.
    pub fn template(batch: &PendingBatch) -> Self {
        Self {
            batch_id: Some(batch.batch_id.clone()),
            items: batch.items.iter().map(AdjudicatedItem::undecided).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub correlation_id: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitReport {
    pub committed_count: usize,
    pub errors: Vec<ItemFailure>,
    pub conflicts: Vec<MappingConflict>,
}

/// Apply human decisions to the catalog and the supplier code map.
///
/// Item-level failures are collected in the report and never abort the batch.
/// A missing or expired batch, or a storage failure, fails the whole call.
pub fn commit_adjudication(
    store: &mut LedgerStore,
    request: CommitRequest,
    settings: &InvoiceSection,
) -> Result<CommitReport> {
    let pending = match &request.batch_id {
        Some(batch_id) => Some(
            store
                .load_pending_batch(batch_id, settings.pending_ttl())?
                .ok_or_else(|| LedgerError::BatchNotFound(batch_id.clone()))?,
        ),
        None => None,
    };

    let mut report = CommitReport::default();
    // Each pending record accepts one decision per request.
    let mut decided = HashSet::new();

    for item in request.items {
        if item.disposition == Disposition::Skip {
            debug!(correlation_id = %item.correlation_id, "Skipped by reviewer");
            continue;
        }
        let correlation_id = item.correlation_id.clone();

        let outcome = match &pending {
            Some(batch) => match batch.items.iter().find(|p| p.correlation_id == correlation_id) {
                None => Err(LedgerError::UnknownCorrelation(correlation_id.clone())),
                Some(_) if decided.contains(&correlation_id) => {
                    Err(LedgerError::DuplicateDecision(correlation_id.clone()))
                }
                Some(record) => {
                    decided.insert(correlation_id.clone());
                    commit_item(store, item.bind_to(record), Some(batch.batch_id.as_str()))
                }
            },
            None => commit_item(store, item, None),
        };

        match outcome {
            Ok(conflict) => {
                report.committed_count += 1;
                report.conflicts.extend(conflict);
            }
            Err(e) if e.is_item_level() => {
                warn!(correlation_id = %correlation_id, error = %e, "Adjudicated item rejected");
                report.errors.push(ItemFailure {
                    correlation_id,
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(batch) = &pending {
        store.delete_pending_batch(&batch.batch_id)?;
    }

    info!(
        committed = report.committed_count,
        errors = report.errors.len(),
        conflicts = report.conflicts.len(),
        "Adjudication committed"
    );
    Ok(report)
}

/// Commit one CREATE or LINK decision atomically. With a batch id the pending
/// record is removed in the same transaction, so a retried decision file cannot
/// apply it twice.
fn commit_item(
    store: &mut LedgerStore,
    item: AdjudicatedItem,
    batch_id: Option<&str>,
) -> Result<Option<MappingConflict>> {
    let delta = whole_units(item.quantity);
    let mut tx = store.immediate()?;

    let product_id = match item.disposition {
        Disposition::Create => {
            let code = required(item.target_code.as_deref(), "target_code")?;
            let description = required(item.target_description.as_deref(), "target_description")?;
            ledger_db::insert_product(
                &tx,
                &NewProduct {
                    code,
                    // Future invoices carrying this supplier code resolve by direct match.
                    short_code: non_empty(Some(item.supplier_code.as_str())),
                    description,
                    stock: delta,
                    category: item.target_category.unwrap_or_default(),
                },
            )?
        }
        Disposition::Link => {
            let id = item
                .target_product_id
                .ok_or(LedgerError::MissingField {
                    field: "target_product_id",
                })?;
            if !ledger_db::increment_stock(&tx, id, delta)? {
                return Err(LedgerError::ProductNotFound { id });
            }
            id
        }
        Disposition::Skip => return Ok(None),
    };

    let issuer_id = item.issuer_id.trim();
    let supplier_code = item.supplier_code.trim();
    let outcome = if issuer_id.is_empty() || supplier_code.is_empty() {
        None
    } else {
        ledger_db::remember_mapping(&mut tx, issuer_id, supplier_code, product_id)
    };
    if let Some(batch_id) = batch_id {
        ledger_db::take_pending_item(&tx, batch_id, &item.correlation_id)?;
    }
    tx.commit()?;

    info!(
        correlation_id = %item.correlation_id,
        disposition = ?item.disposition,
        product_id,
        delta,
        "Adjudicated item committed"
    );

    match outcome {
        Some(MappingOutcome::Conflict(conflict)) => {
            warn!(%conflict, "Mapping conflict, existing mapping kept");
            Ok(Some(conflict))
        }
        _ => Ok(None),
    }
}

fn required(value: Option<&str>, field: &'static str) -> Result<String> {
    non_empty(value).ok_or(LedgerError::MissingField { field })
}
