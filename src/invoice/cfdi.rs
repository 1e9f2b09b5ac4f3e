use super::{Invoice, LineItem};
use crate::catalog::non_empty;
use crate::error::{LedgerError, Result};
use regex::Regex;
use roxmltree::{Document, Node};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

const CFDI_NAMESPACES: &[&str] = &["http://www.sat.gob.mx/cfd/3", "http://www.sat.gob.mx/cfd/4"];

static RFC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-ZÑ&]{3,4}\d{6}[A-Z0-9]{3}$").expect("valid RFC pattern"));

/// Whether `id` has the shape of a Mexican tax-registration id (RFC).
pub fn looks_like_rfc(id: &str) -> bool {
    RFC_RE.is_match(id)
}

pub fn extract(bytes: &[u8], fallback_issuer: &str) -> Result<Invoice> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| LedgerError::InvalidDocument(format!("not UTF-8 text: {e}")))?;
    let text = text.trim_start_matches('\u{feff}');

    let doc = Document::parse(text)
        .map_err(|e| LedgerError::InvalidDocument(format!("malformed XML: {e}")))?;

    let root = doc.root_element();
    if !is_cfdi(root, "Comprobante") {
        return Err(LedgerError::InvalidDocument(format!(
            "root element `{}` is not a CFDI Comprobante",
            root.tag_name().name()
        )));
    }

    let emisor = child(root, "Emisor");
    let issuer_id = emisor
        .and_then(|e| non_empty(e.attribute("Rfc")))
        .unwrap_or_else(|| fallback_issuer.to_string());
    if issuer_id != fallback_issuer && !looks_like_rfc(&issuer_id) {
        warn!(issuer = %issuer_id, "Issuer id does not look like an RFC");
    }

    let line_items: Vec<LineItem> = child(root, "Conceptos")
        .map(|conceptos| {
            conceptos
                .children()
                .filter(|n| is_cfdi(*n, "Concepto"))
                .filter_map(extract_line_item)
                .collect()
        })
        .unwrap_or_default();

    let invoice = Invoice {
        issuer_id,
        issuer_name: emisor.and_then(|e| non_empty(e.attribute("Nombre"))),
        folio: extract_folio(root),
        issued_at: non_empty(root.attribute("Fecha")),
        currency: non_empty(root.attribute("Moneda")),
        total: root.attribute("Total").and_then(|t| t.trim().parse().ok()),
        line_items,
    };

    info!(
        issuer = %invoice.issuer_id,
        folio = ?invoice.folio,
        lines = invoice.line_items.len(),
        "Invoice parsed"
    );
    Ok(invoice)
}

/// Match on local name; the namespace must be a CFDI one, or absent for bare documents.
fn is_cfdi(node: Node<'_, '_>, local: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == local
        && node
            .tag_name()
            .namespace()
            .is_none_or(|ns| CFDI_NAMESPACES.contains(&ns))
}

fn child<'a, 'input>(node: Node<'a, 'input>, local: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| is_cfdi(*n, local))
}

fn extract_folio(root: Node<'_, '_>) -> Option<String> {
    match (
        non_empty(root.attribute("Serie")),
        non_empty(root.attribute("Folio")),
    ) {
        (Some(serie), Some(folio)) => Some(format!("{serie}-{folio}")),
        (None, folio) => folio,
        (serie, None) => serie,
    }
}

fn extract_line_item(concepto: Node<'_, '_>) -> Option<LineItem> {
    // Some suppliers only fill the SAT catalogue key; prefer their own part number.
    let Some(supplier_code) = non_empty(concepto.attribute("NoIdentificacion"))
        .or_else(|| non_empty(concepto.attribute("ClaveProdServ")))
    else {
        debug!("Dropping concept without a supplier code");
        return None;
    };

    let quantity = parse_amount(concepto.attribute("Cantidad"));
    let unit_cost = parse_amount(concepto.attribute("ValorUnitario"));
    if quantity.is_nan() {
        warn!(code = %supplier_code, raw = ?concepto.attribute("Cantidad"), "Unparseable quantity");
    }

    Some(LineItem {
        supplier_code,
        description: concepto
            .attribute("Descripcion")
            .map(|d| d.trim().to_string())
            .unwrap_or_default(),
        quantity,
        unit_cost,
    })
}

fn parse_amount(raw: Option<&str>) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}
