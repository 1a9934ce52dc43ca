//! Strict intake schema, normalization and line dedupe.

use serde::{Deserialize, Serialize};

use procura_core::{CustomerId, DomainError, UserId};
use procura_products::ProductKey;

/// Tagged intake payload: one variant per request kind. Unknown shapes are
/// rejected at deserialization time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntakeRequest {
    WishlistConversion(RawWishlist),
    ApplicationConversion(RawApplication),
}

/// Raw wishlist payload as submitted by a customer's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWishlist {
    pub customer_id: CustomerId,
    pub agent_id: UserId,
    pub lines: Vec<RawLine>,
}

/// One raw wishlist line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLine {
    pub title: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub quantity: i64,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Raw application payload (manager-entered catalog request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawApplication {
    pub title: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub final_price: Option<u64>,
}

/// Intake limits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Upper bound for a single line's quantity.
    pub max_line_quantity: i64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_line_quantity: 10_000,
        }
    }
}

/// A validated, deduplicated wishlist ready to become a [`WishlistEntry`].
///
/// [`WishlistEntry`]: crate::wishlist::WishlistEntry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistDraft {
    pub customer_id: CustomerId,
    pub agent_id: UserId,
    pub lines: Vec<WishlistLine>,
}

/// A normalized wishlist line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WishlistLine {
    pub title: String,
    pub sku: Option<String>,
    pub key: ProductKey,
    pub quantity: i64,
    pub comment: Option<String>,
}

/// A validated application ready for product resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDraft {
    pub title: String,
    pub sku: Option<String>,
    pub unit: String,
    pub final_price: Option<u64>,
    pub key: ProductKey,
}

/// Validate and normalize a raw wishlist.
///
/// Rejects empty line lists, blank product titles, non-positive quantities
/// and quantities above the configured per-line cap. Duplicate product
/// references are merged by [`dedupe_lines`].
pub fn normalize(raw: &RawWishlist, config: &IntakeConfig) -> Result<WishlistDraft, DomainError> {
    if raw.lines.is_empty() {
        return Err(DomainError::validation("wishlist has no lines"));
    }

    let mut lines = Vec::with_capacity(raw.lines.len());
    for (idx, line) in raw.lines.iter().enumerate() {
        let title = line.title.trim();
        if title.is_empty() {
            return Err(DomainError::validation(format!(
                "line {}: product title cannot be blank",
                idx + 1
            )));
        }
        if line.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "line {}: quantity must be positive",
                idx + 1
            )));
        }
        if line.quantity > config.max_line_quantity {
            return Err(DomainError::validation(format!(
                "line {}: quantity {} exceeds the per-line cap of {}",
                idx + 1,
                line.quantity,
                config.max_line_quantity
            )));
        }

        let sku = line.sku.as_deref().map(str::trim).filter(|s| !s.is_empty());
        lines.push(WishlistLine {
            title: title.to_string(),
            sku: sku.map(str::to_string),
            key: ProductKey::from_title_or_sku(title, sku),
            quantity: line.quantity,
            comment: line.comment.clone(),
        });
    }

    Ok(WishlistDraft {
        customer_id: raw.customer_id,
        agent_id: raw.agent_id,
        lines: dedupe_lines(lines),
    })
}

/// Merge duplicate product references within one entry by summing their
/// quantities. First-seen title, SKU and comment win; line order follows
/// first appearance.
pub fn dedupe_lines(lines: Vec<WishlistLine>) -> Vec<WishlistLine> {
    let mut merged: Vec<WishlistLine> = Vec::with_capacity(lines.len());

    for line in lines {
        match merged.iter_mut().find(|m| m.key == line.key) {
            Some(existing) => {
                existing.quantity += line.quantity;
            }
            None => merged.push(line),
        }
    }

    merged
}

/// Validate and normalize a raw application.
pub fn normalize_application(raw: &RawApplication) -> Result<ApplicationDraft, DomainError> {
    let title = raw.title.trim();
    if title.is_empty() {
        return Err(DomainError::validation("product title cannot be blank"));
    }

    let sku = raw.sku.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let unit = raw
        .unit
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .unwrap_or("pcs");

    Ok(ApplicationDraft {
        title: title.to_string(),
        sku: sku.map(str::to_string),
        unit: unit.to_string(),
        final_price: raw.final_price,
        key: ProductKey::from_title_or_sku(title, sku),
    })
}
