//! Billing: effective per-model price resolution and cost computation.
//!
//! Prices are USD per million tokens; costs are computed in integer femto-USD
//! (1e-15 USD) so accumulation cannot drift, and converted to USD only at the
//! read edge. Resolution order is manual override, then the latest active
//! synced catalog row, then a recorded unresolved-model occurrence.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::models::{BillingSnapshot, PriceSource, TokenUsage, Upstream};
use crate::core::database::{Database, ModelPriceRow};
use crate::core::error::Result;
use crate::core::error_types::{
    UnbilledReason, BILLING_STATUS_BILLED, BILLING_STATUS_UNBILLED,
};

pub const CURRENCY_USD: &str = "USD";

/// Effective prices for one model, USD per million tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPrice {
    pub source: PriceSource,
    pub input_price: f64,
    pub output_price: f64,
    pub cache_read_price: Option<f64>,
    pub cache_write_price: Option<f64>,
}

impl ResolvedPrice {
    fn from_row(row: ModelPriceRow, source: PriceSource) -> Self {
        Self {
            source,
            input_price: row.input_price,
            output_price: row.output_price,
            cache_read_price: row.cache_read_price,
            cache_write_price: row.cache_write_price,
        }
    }
}

/// Price lookup seam. Production reads Postgres; tests use the memory store.
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn manual_price(&self, model: &str) -> Result<Option<ModelPriceRow>>;
    async fn catalog_price(&self, model: &str) -> Result<Option<ModelPriceRow>>;
    async fn record_unresolved(&self, model: &str, upstream_name: &str) -> Result<()>;
}

pub struct PgPriceStore {
    db: Arc<Database>,
}

impl PgPriceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PriceStore for PgPriceStore {
    async fn manual_price(&self, model: &str) -> Result<Option<ModelPriceRow>> {
        Ok(self.db.get_manual_price(model).await?)
    }

    async fn catalog_price(&self, model: &str) -> Result<Option<ModelPriceRow>> {
        Ok(self.db.get_catalog_price(model).await?)
    }

    async fn record_unresolved(&self, model: &str, upstream_name: &str) -> Result<()> {
        Ok(self.db.record_unresolved_model(model, upstream_name).await?)
    }
}

#[derive(Default)]
pub struct MemoryPriceStore {
    pub manual: HashMap<String, ModelPriceRow>,
    pub catalog: HashMap<String, ModelPriceRow>,
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn manual_price(&self, model: &str) -> Result<Option<ModelPriceRow>> {
        Ok(self.manual.get(model).cloned())
    }

    async fn catalog_price(&self, model: &str) -> Result<Option<ModelPriceRow>> {
        Ok(self.catalog.get(model).cloned())
    }

    async fn record_unresolved(&self, _model: &str, _upstream_name: &str) -> Result<()> {
        Ok(())
    }
}

/// The billed (or structured-unbilled) outcome of one request.
#[derive(Debug, Clone)]
pub struct BillingOutcome {
    pub status: &'static str,
    pub snapshot: Option<BillingSnapshot>,
    pub unbilled_reason: Option<UnbilledReason>,
}

impl BillingOutcome {
    fn unbilled(reason: UnbilledReason) -> Self {
        Self {
            status: BILLING_STATUS_UNBILLED,
            snapshot: None,
            unbilled_reason: Some(reason),
        }
    }
}

pub struct BillingService {
    store: Arc<dyn PriceStore>,
}

impl BillingService {
    pub fn new(store: Arc<dyn PriceStore>) -> Self {
        Self { store }
    }

    /// Resolve the effective price for a model: manual override first, then
    /// the latest active catalog row. `None` means unresolved; the occurrence
    /// is recorded for the admin side to pick up.
    pub async fn resolve_price(
        &self,
        model: &str,
        upstream_name: &str,
    ) -> Result<Option<ResolvedPrice>> {
        if let Some(row) = self.store.manual_price(model).await? {
            return Ok(Some(ResolvedPrice::from_row(row, PriceSource::Manual)));
        }
        if let Some(row) = self.store.catalog_price(model).await? {
            return Ok(Some(ResolvedPrice::from_row(row, PriceSource::Catalog)));
        }

        if let Err(err) = self.store.record_unresolved(model, upstream_name).await {
            tracing::warn!(model = %model, error = %err, "Failed to record unresolved model");
        }
        Ok(None)
    }

    /// Price one request. Failures come back as structured unbilled reasons,
    /// never errors.
    pub async fn bill(
        &self,
        model: Option<&str>,
        usage: Option<&TokenUsage>,
        upstream: &Upstream,
    ) -> BillingOutcome {
        let Some(model) = model.filter(|m| !m.is_empty()) else {
            return BillingOutcome::unbilled(UnbilledReason::ModelMissing);
        };
        let Some(usage) = usage else {
            return BillingOutcome::unbilled(UnbilledReason::UsageMissing);
        };

        let price = match self.resolve_price(model, &upstream.name).await {
            Ok(Some(price)) => price,
            Ok(None) => return BillingOutcome::unbilled(UnbilledReason::PriceNotFound),
            Err(err) => {
                tracing::warn!(model = %model, error = %err, "Price resolution failed");
                return BillingOutcome::unbilled(UnbilledReason::PriceNotFound);
            }
        };

        match compute_snapshot(usage, &price, upstream) {
            Some(snapshot) => BillingOutcome {
                status: BILLING_STATUS_BILLED,
                snapshot: Some(snapshot),
                unbilled_reason: None,
            },
            None => BillingOutcome::unbilled(UnbilledReason::CalculationError),
        }
    }
}

/// Prompt tokens that bill at the plain input price.
///
/// OpenAI-style usage (cached_tokens set from the details object) includes
/// cache hits in `prompt_tokens`, so they are subtracted; Anthropic-style
/// usage reports cache fields separately and `raw_input_tokens` is already
/// cache-exclusive (zero in the streaming-delta fallback where the prompt
/// figure was synthesized from the cache fields).
fn noncache_prompt_tokens(usage: &TokenUsage) -> u64 {
    if usage.cached_tokens > 0 {
        usage.prompt_tokens.saturating_sub(usage.cache_read_tokens)
    } else {
        usage.raw_input_tokens
    }
}

fn cost_femto_usd(tokens: u64, price_per_million: f64, multiplier: f64) -> Option<i64> {
    // price/1e6 USD per token = price * 1e9 femto-USD per token
    let cost = tokens as f64 * price_per_million * multiplier * 1e9;
    if !cost.is_finite() || cost < 0.0 || cost > i64::MAX as f64 {
        return None;
    }
    Some(cost.round() as i64)
}

/// Compute the immutable billing snapshot. `None` signals a calculation error
/// (non-finite or negative inputs).
pub fn compute_snapshot(
    usage: &TokenUsage,
    price: &ResolvedPrice,
    upstream: &Upstream,
) -> Option<BillingSnapshot> {
    let input_mult = upstream.billing_input_multiplier;
    let output_mult = upstream.billing_output_multiplier;
    if !input_mult.is_finite() || !output_mult.is_finite() || input_mult < 0.0 || output_mult < 0.0
    {
        return None;
    }

    // A missing cache price bills that category at zero, it does not
    // unresolve the model
    let cache_read_price = price.cache_read_price.unwrap_or(0.0);
    let cache_write_price = price.cache_write_price.unwrap_or(0.0);

    let input_cost = cost_femto_usd(noncache_prompt_tokens(usage), price.input_price, input_mult)?;
    let output_cost = cost_femto_usd(usage.completion_tokens, price.output_price, output_mult)?;
    let cache_read_cost = cost_femto_usd(usage.cache_read_tokens, cache_read_price, input_mult)?;
    let cache_write_cost =
        cost_femto_usd(usage.cache_creation_tokens, cache_write_price, input_mult)?;

    Some(BillingSnapshot {
        price_source: price.source,
        input_price: price.input_price,
        output_price: price.output_price,
        cache_read_price,
        cache_write_price,
        input_multiplier: input_mult,
        output_multiplier: output_mult,
        input_cost_femto_usd: input_cost,
        output_cost_femto_usd: output_cost,
        cache_read_cost_femto_usd: cache_read_cost,
        cache_write_cost_femto_usd: cache_write_cost,
        total_cost_femto_usd: input_cost + output_cost + cache_read_cost + cache_write_cost,
        currency: CURRENCY_USD.to_string(),
        billed_at: Utc::now(),
    })
}
