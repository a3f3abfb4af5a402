use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::LedgerError;
use super::costs::{ChargeBreakdown, CreditCharge};
use super::plans::{PlanKey, resolve_plan_key};
use super::store::{Document, DocumentStore};
use super::usage::{UsageRecord, UsageRecorder, UsageStatus};
use crate::clock::{Clock, SystemClock};
use crate::observability::Observability;

pub const PROFILES: &str = "user_credit_profiles";

const DEFAULT_PRODUCT: &str = "generic";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditProfile {
    pub plan: PlanKey,
    pub credits: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeOutcome {
    pub plan: PlanKey,
    pub remaining_credits: u64,
    pub total_cost: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub metadata: Document,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOutcome {
    pub ok: bool,
    pub consumed: u64,
    pub balance: Option<u64>,
    pub plan_tier: Option<PlanKey>,
}

/// Per-user credit balances on top of a [`DocumentStore`].
///
/// Every balance mutation runs inside [`DocumentStore::transact`], so two
/// requests for the same user never both pass the balance check against the
/// same read.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn DocumentStore>,
    usage: UsageRecorder,
    clock: Arc<dyn Clock>,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger")
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        usage: UsageRecorder,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            usage,
            clock: Arc::new(SystemClock),
            observability,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn usage(&self) -> &UsageRecorder {
        &self.usage
    }

    /// Reads the profile, seeding it at the plan limit when it is missing or
    /// has no numeric balance. Returns `None` for a blank user id.
    pub async fn ensure_profile(
        &self,
        user_id: &str,
        plan_override: Option<&str>,
    ) -> Result<Option<CreditProfile>, LedgerError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Ok(None);
        }

        let plan_override = plan_override.map(|raw| resolve_plan_key(Some(raw)));
        let now = self.clock.now_epoch_millis();
        let seed = move |current: Option<&Document>| -> Result<Option<Document>, LedgerError> {
            if current.and_then(numeric_credits).is_some() {
                return Ok(None);
            }
            let plan = plan_override.unwrap_or_else(|| stored_plan(current));
            let mut patch = Document::new();
            patch.insert("plan".to_string(), Value::from(plan.as_str()));
            patch.insert("credits".to_string(), Value::from(plan.limit()));
            if current
                .and_then(|doc| doc.get("generatedCount"))
                .and_then(Value::as_u64)
                .is_none()
            {
                patch.insert("generatedCount".to_string(), Value::from(0u64));
            }
            patch.insert("updatedAt".to_string(), Value::from(now));
            Ok(Some(patch))
        };

        let committed = self
            .store
            .transact(PROFILES, user_id, Box::new(seed))
            .await?;
        let doc = committed.as_ref();
        let plan = plan_override.unwrap_or_else(|| stored_plan(doc));
        let credits = doc.and_then(numeric_credits).unwrap_or_else(|| plan.limit());
        tracing::debug!(user_id, plan = %plan, credits, "ensured credit profile");

        Ok(Some(CreditProfile { plan, credits }))
    }

    /// Debits the priced total of `charges` in one transaction.
    ///
    /// An empty charge list is the degenerate case: it reports the free plan at
    /// its full limit without touching storage.
    pub async fn apply_charges(
        &self,
        user_id: &str,
        charges: &[CreditCharge],
    ) -> Result<ChargeOutcome, LedgerError> {
        if charges.is_empty() {
            return Ok(ChargeOutcome {
                plan: PlanKey::Free,
                remaining_credits: PlanKey::Free.limit(),
                total_cost: 0,
            });
        }

        let breakdown = ChargeBreakdown::from_charges(charges);
        let total_cost = breakdown.total_cost;

        let user_id = user_id.trim();
        if user_id.is_empty() {
            self.usage.record(UsageRecord {
                user_id: None,
                product: charge_product(charges),
                amount: total_cost,
                status: UsageStatus::SkippedNoUser,
                metadata: charge_metadata(&breakdown),
                created_at: self.clock.now_epoch_millis(),
                balance_after: None,
            });
            return Err(LedgerError::InvalidRequest {
                reason: "missing user id".to_string(),
            });
        }

        let now = self.clock.now_epoch_millis();
        let mut last_charge = match serde_json::to_value(&breakdown) {
            Ok(Value::Object(doc)) => doc,
            _ => Document::new(),
        };
        last_charge.insert("chargedAt".to_string(), Value::from(now));

        let update = move |current: Option<&Document>| -> Result<Option<Document>, LedgerError> {
            let plan = stored_plan(current);
            let balance = current
                .and_then(numeric_credits)
                .unwrap_or_else(|| plan.limit());
            if balance < total_cost {
                return Err(LedgerError::InsufficientCredits {
                    required: total_cost,
                    available: balance,
                });
            }
            let generated = current
                .and_then(|doc| doc.get("generatedCount"))
                .and_then(Value::as_u64)
                .unwrap_or(0);

            let mut patch = Document::new();
            patch.insert("plan".to_string(), Value::from(plan.as_str()));
            patch.insert("credits".to_string(), Value::from(balance - total_cost));
            patch.insert(
                "generatedCount".to_string(),
                Value::from(generated.saturating_add(1)),
            );
            patch.insert("updatedAt".to_string(), Value::from(now));
            patch.insert("lastCharge".to_string(), Value::Object(last_charge.clone()));
            Ok(Some(patch))
        };

        let committed = self
            .store
            .transact(PROFILES, user_id, Box::new(update))
            .await;

        match committed {
            Ok(doc) => {
                let doc = doc.as_ref();
                let plan = stored_plan(doc);
                let remaining_credits = doc.and_then(numeric_credits).unwrap_or(0);
                self.observability.record_charge();
                tracing::debug!(
                    user_id,
                    plan = %plan,
                    total_cost,
                    remaining_credits,
                    "applied credit charges"
                );
                self.usage.record(UsageRecord {
                    user_id: Some(user_id.to_string()),
                    product: charge_product(charges),
                    amount: total_cost,
                    status: UsageStatus::Debited,
                    metadata: charge_metadata(&breakdown),
                    created_at: now,
                    balance_after: Some(remaining_credits),
                });
                Ok(ChargeOutcome {
                    plan,
                    remaining_credits,
                    total_cost,
                })
            }
            Err(err @ LedgerError::InsufficientCredits { .. }) => {
                self.observability.record_insufficient_credits();
                self.usage.record(UsageRecord {
                    user_id: Some(user_id.to_string()),
                    product: charge_product(charges),
                    amount: total_cost,
                    status: UsageStatus::InsufficientBalance,
                    metadata: charge_metadata(&breakdown),
                    created_at: now,
                    balance_after: None,
                });
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Advisory debit. Without a user or an initialized profile nothing is
    /// charged and the caller proceeds; once a profile has a balance, that
    /// balance is enforced.
    pub async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeOutcome, LedgerError> {
        let now = self.clock.now_epoch_millis();
        let amount = billed_amount(request.amount);
        let product = request
            .product
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PRODUCT)
            .to_string();
        let user_id = request
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let Some(user_id) = user_id else {
            self.observability.record_consume_skipped();
            self.usage.record(UsageRecord {
                user_id: None,
                product,
                amount,
                status: UsageStatus::SkippedNoUser,
                metadata: request.metadata,
                created_at: now,
                balance_after: None,
            });
            return Ok(ConsumeOutcome {
                ok: true,
                consumed: 0,
                balance: None,
                plan_tier: None,
            });
        };

        let existing = self.store.get(PROFILES, &user_id).await?;
        let plan_tier = existing.as_ref().map(|doc| stored_plan(Some(doc)));
        if existing.as_ref().and_then(numeric_credits).is_none() {
            self.observability.record_consume_skipped();
            self.usage.record(UsageRecord {
                user_id: Some(user_id),
                product,
                amount,
                status: UsageStatus::NoProfile,
                metadata: request.metadata,
                created_at: now,
                balance_after: None,
            });
            return Ok(ConsumeOutcome {
                ok: true,
                consumed: 0,
                balance: None,
                plan_tier,
            });
        }

        let update = move |current: Option<&Document>| -> Result<Option<Document>, LedgerError> {
            let balance = current.and_then(numeric_credits).unwrap_or(0);
            if balance < amount {
                return Err(LedgerError::InsufficientBalance {
                    required: amount,
                    available: balance,
                });
            }
            let mut patch = Document::new();
            patch.insert("credits".to_string(), Value::from(balance - amount));
            patch.insert("updatedAt".to_string(), Value::from(now));
            Ok(Some(patch))
        };

        match self
            .store
            .transact(PROFILES, &user_id, Box::new(update))
            .await
        {
            Ok(doc) => {
                let doc = doc.as_ref();
                let balance = doc.and_then(numeric_credits).unwrap_or(0);
                let plan = stored_plan(doc);
                self.observability.record_consume();
                tracing::debug!(
                    user_id = %user_id,
                    product = %product,
                    amount,
                    balance,
                    "consumed credits"
                );
                self.usage.record(UsageRecord {
                    user_id: Some(user_id),
                    product,
                    amount,
                    status: UsageStatus::Debited,
                    metadata: request.metadata,
                    created_at: now,
                    balance_after: Some(balance),
                });
                Ok(ConsumeOutcome {
                    ok: true,
                    consumed: amount,
                    balance: Some(balance),
                    plan_tier: Some(plan),
                })
            }
            Err(err @ LedgerError::InsufficientBalance { .. }) => {
                self.observability.record_insufficient_credits();
                self.usage.record(UsageRecord {
                    user_id: Some(user_id),
                    product,
                    amount,
                    status: UsageStatus::InsufficientBalance,
                    metadata: request.metadata,
                    created_at: now,
                    balance_after: None,
                });
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

fn stored_plan(doc: Option<&Document>) -> PlanKey {
    resolve_plan_key(doc.and_then(|doc| doc.get("plan")).and_then(Value::as_str))
}

/// Balance stored on the profile, if it is a usable number. Negative values
/// read as zero; fractional values round down.
fn numeric_credits(doc: &Document) -> Option<u64> {
    let value = doc.get("credits")?;
    if let Some(credits) = value.as_u64() {
        return Some(credits);
    }
    if value.as_i64().is_some() {
        return Some(0);
    }
    let credits = value.as_f64().filter(|credits| credits.is_finite())?;
    if credits <= 0.0 {
        return Some(0);
    }
    Some(credits.floor() as u64)
}

fn billed_amount(amount: f64) -> u64 {
    if amount.is_finite() && amount > 1.0 {
        amount.ceil() as u64
    } else {
        1
    }
}

/// Distinct action names in first-seen order, joined with `+`.
fn charge_product(charges: &[CreditCharge]) -> String {
    let mut names: Vec<&str> = Vec::with_capacity(charges.len());
    for charge in charges {
        let name = charge.action.as_str();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.join("+")
}

fn charge_metadata(breakdown: &ChargeBreakdown) -> Document {
    let mut metadata = Document::new();
    if let Ok(items) = serde_json::to_value(&breakdown.items) {
        metadata.insert("items".to_string(), items);
    }
    metadata
}
