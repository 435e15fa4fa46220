//! Model router: the fallback ladder every generative stage consults.
//!
//! For each dispatch the router:
//! 1. Picks a tier from attempt history ([`ladder::base_tier`])
//! 2. Raises it to the stage's permanent floor, if any
//! 3. Checks the monthly cost projection and steps down on overspend
//! 4. Acquires quota for the capability, stepping down on sustained exhaustion
//! 5. Reserves the projected cost in the persisted ledger
//!
//! Cost guards run before execution and are never reconciled afterwards.

pub mod budget;
pub mod ladder;
pub mod limiter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use curricula_shared::{
    AppConfig, BudgetConfig, CurriculaError, FallbackTier, LimitsConfig, Result, StageKind,
    StageLadder, StageLadders,
};
use curricula_storage::Storage;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

pub use budget::{CostLedger, current_month};
pub use ladder::{AttemptState, TierDecision, base_tier};
pub use limiter::{QuotaLimiter, QuotaResult};

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

/// Router settings extracted from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub ladders: StageLadders,
    pub budget: BudgetConfig,
    pub limits: LimitsConfig,
}

impl From<&AppConfig> for RouterConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            ladders: config.models.stages.clone(),
            budget: config.budget.clone(),
            limits: config.limits.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelRouter
// ---------------------------------------------------------------------------

pub struct ModelRouter {
    config: RouterConfig,
    storage: Arc<Storage>,
    ledger: Mutex<CostLedger>,
    floors: RwLock<HashMap<StageKind, FallbackTier>>,
    model_quota: QuotaLimiter,
    search_quota: QuotaLimiter,
}

impl ModelRouter {
    /// Load the current month's ledger and the stage floors, then build the router.
    pub async fn start(config: RouterConfig, storage: Arc<Storage>) -> Result<Self> {
        let month = current_month();
        let ledger = CostLedger::from_rows(&month, &storage.load_ledger(&month).await?);

        let mut floors = HashMap::new();
        for (stage, tier) in storage.load_stage_floors().await? {
            match stage.parse::<StageKind>() {
                Ok(stage) => {
                    floors.insert(stage, FallbackTier::from_index(tier));
                }
                Err(_) => warn!(stage = %stage, "ignoring floor for unknown stage"),
            }
        }

        let backoff = Duration::from_millis(config.limits.backoff_initial_ms);
        let max_wait = Duration::from_millis(config.limits.max_wait_ms);
        let model_quota = QuotaLimiter::new(
            "model",
            config.limits.model_rate_per_sec,
            config.limits.model_burst,
            backoff,
            max_wait,
        );
        let search_quota = QuotaLimiter::new(
            "search",
            config.limits.search_rate_per_sec,
            config.limits.search_burst,
            backoff,
            max_wait,
        );

        info!(month = %month, floors = floors.len(), "model router started");

        Ok(Self {
            config,
            storage,
            ledger: Mutex::new(ledger),
            floors: RwLock::new(floors),
            model_quota,
            search_quota,
        })
    }

    pub fn ladder(&self, stage: StageKind) -> Result<&StageLadder> {
        self.config
            .ladders
            .get(stage)
            .ok_or_else(|| CurriculaError::config(format!("stage {stage} has no model ladder")))
    }

    /// Current permanent minimum tier for a stage.
    pub async fn floor(&self, stage: StageKind) -> FallbackTier {
        self.floors
            .read()
            .await
            .get(&stage)
            .copied()
            .unwrap_or(FallbackTier::Primary)
    }

    /// Month-to-date spend reserved for a stage.
    pub async fn spent(&self, stage: StageKind) -> f64 {
        self.ledger.lock().await.spent(stage)
    }

    /// Permanently raise a stage's minimum tier. Floors never go down.
    #[instrument(skip_all, fields(stage = %stage, tier = %tier))]
    pub async fn escalate_floor(
        &self,
        stage: StageKind,
        tier: FallbackTier,
        reason: &str,
    ) -> Result<()> {
        let mut floors = self.floors.write().await;
        let current = floors.get(&stage).copied().unwrap_or(FallbackTier::Primary);
        if tier <= current {
            return Ok(());
        }
        self.storage
            .set_stage_floor(stage.as_str(), tier.index(), reason)
            .await?;
        floors.insert(stage, tier);
        warn!(reason = %reason, "stage tier floor raised");
        Ok(())
    }

    /// Choose the tier for the next dispatch of `stage` and reserve its cost.
    #[instrument(skip_all, fields(stage = %stage, failures = attempt.failures))]
    pub async fn decide(&self, stage: StageKind, attempt: &AttemptState) -> Result<TierDecision> {
        let ladder = self.ladder(stage)?;

        let (mut tier, mut reason) = base_tier(ladder, attempt);
        let floor = self.floor(stage).await;
        if floor > tier {
            tier = floor;
            reason = format!("{reason}; stage floor {floor}");
        }

        let budget_fit = {
            let mut ledger = self.ledger.lock().await;
            ledger.roll_to(&current_month());
            self.fit_budget(&ledger, stage, ladder, tier)
        };
        let mut budget_downgraded = false;
        if budget_fit != tier {
            budget_downgraded = true;
            reason = format!(
                "{reason}; projected spend over {:.2} USD ceiling, {tier} -> {budget_fit}",
                self.config.budget.ceiling(stage)
            );
            tier = budget_fit;
        }

        // The quota wait happens without the ledger lock so one backed-off
        // capability does not stall routing for every other stage.
        if tier != FallbackTier::Deterministic {
            let quota = match stage {
                StageKind::Search => &self.search_quota,
                _ => &self.model_quota,
            };
            if let Err(e) = quota.acquire().await {
                let next = match (tier.step_down(), quota.try_acquire()) {
                    (FallbackTier::Deterministic, _) => FallbackTier::Deterministic,
                    (t, QuotaResult::Allowed { .. }) => t,
                    (_, QuotaResult::Limited { .. }) => FallbackTier::Deterministic,
                };
                reason = format!("{reason}; {e}, {tier} -> {next}");
                tier = next;
            }
        }

        // Re-check under the lock: other dispatches may have reserved while
        // this one waited for quota.
        let (reserved_cost, month) = {
            let mut ledger = self.ledger.lock().await;
            ledger.roll_to(&current_month());
            let affordable = self.fit_budget(&ledger, stage, ladder, tier);
            if affordable != tier {
                budget_downgraded = true;
                reason = format!(
                    "{reason}; projected spend over {:.2} USD ceiling, {tier} -> {affordable}",
                    self.config.budget.ceiling(stage)
                );
                tier = affordable;
            }
            let cost = ladder::cost_for(ladder, tier);
            if cost > 0.0 {
                ledger.reserve(stage, cost);
            }
            (cost, ledger.month().to_string())
        };

        if reserved_cost > 0.0 {
            if let Err(e) = self
                .storage
                .add_spend(&month, stage.as_str(), reserved_cost)
                .await
            {
                self.ledger.lock().await.release(&month, stage, reserved_cost);
                return Err(e);
            }
        }

        let decision = TierDecision {
            stage,
            tier,
            model_id: ladder::model_for(ladder, tier).to_string(),
            reason,
            budget_downgraded,
            reserved_cost,
            extraction_only: ladder.critical && tier == FallbackTier::Deterministic,
        };
        info!(
            tier = %decision.tier,
            model = %decision.model_id,
            reason = %decision.reason,
            reserved = decision.reserved_cost,
            "tier selected"
        );
        Ok(decision)
    }

    /// One step down the ladder on overspend; tier 2 if that is still unaffordable.
    fn fit_budget(
        &self,
        ledger: &CostLedger,
        stage: StageKind,
        ladder: &StageLadder,
        tier: FallbackTier,
    ) -> FallbackTier {
        let budget = &self.config.budget;
        if ledger.can_afford(budget, stage, ladder::cost_for(ladder, tier)) {
            return tier;
        }
        let stepped = tier.step_down();
        if ledger.can_afford(budget, stage, ladder::cost_for(ladder, stepped)) {
            stepped
        } else {
            FallbackTier::Deterministic
        }
    }
}
