//! The correction engine proper.
//!
//! Strictly bounded, strictly reversible, strictly non-financial. The engine
//! has no write access to kernel tables; applied corrections materialize
//! only as configuration knobs read by non-kernel components.

use crate::outcome::{judge, MIN_WINDOW};
use chrono::{DateTime, Duration, Utc};
use hustlexp_storage::{
    CausalOutcomeRecord, CorrectionRecord, CorrectionStore, FlagStore, HustleStore, LedgerStore,
    MetricSet, StoreError, FLAG_SAFE_MODE,
};
use hustlexp_types::{
    is_forbidden_target, CorrectionId, CorrectionStatus, CorrectionType, Scope, Verdict,
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Rolling window for the SafeMode trip wire.
const SAFE_MODE_WINDOW: Duration = Duration::hours(24);
/// Minimum samples before the rate means anything.
const SAFE_MODE_MIN_SAMPLES: usize = 5;
/// Non-causal rate (percent) beyond which the engine latches SafeMode.
const SAFE_MODE_MAX_NON_CAUSAL_PCT: usize = 30;

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("correction not found: {0}")]
    NotFound(CorrectionId),

    #[error("invalid proposal: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A proposed correction, pre-screening.
#[derive(Debug, Clone)]
pub struct CorrectionProposal {
    pub correction_type: CorrectionType,
    pub target_entity: String,
    pub target_id: String,
    pub scope: Scope,
    pub adjustment: String,
    pub magnitude: Decimal,
    pub reason_code: String,
    pub ttl: Duration,
    pub proposed_by: String,
}

/// Why a proposal was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The target matches the forbidden set; the attempt is audited.
    ForbiddenTarget,
    /// SafeMode is latched; an operator must reset it.
    SafeModeActive,
    /// The scope's active-correction budget is exhausted.
    OverBudget,
    /// Magnitude outside the bounds for this correction type.
    MagnitudeOutOfBounds,
}

#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(CorrectionRecord),
    Blocked(BlockReason),
}

/// The advisory correction engine.
pub struct CorrectionEngine {
    store: Arc<dyn HustleStore>,
    /// Process-local SafeMode cache over the persisted flag row.
    safe_mode: AtomicBool,
    /// Actor recorded on audit rows for engine-initiated actions.
    system_actor: hustlexp_types::UserId,
}

impl CorrectionEngine {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self {
            store,
            safe_mode: AtomicBool::new(false),
            system_actor: hustlexp_types::UserId::generate(),
        }
    }

    /// Pin the audit actor to a real system account.
    pub fn with_system_actor(mut self, actor: hustlexp_types::UserId) -> Self {
        self.system_actor = actor;
        self
    }

    /// Cold-start hydration of the SafeMode cache from the flag row.
    pub async fn hydrate(&self) -> Result<(), CorrectionError> {
        let persisted = self
            .store
            .get_flag(FLAG_SAFE_MODE)
            .await?
            .map(|flag| flag.enabled)
            .unwrap_or(false);
        self.safe_mode.store(persisted, Ordering::SeqCst);
        Ok(())
    }

    pub fn safe_mode_active(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    async fn enter_safe_mode(&self, reason: &str) -> Result<(), CorrectionError> {
        self.safe_mode.store(true, Ordering::SeqCst);
        self.store
            .set_flag(FLAG_SAFE_MODE, true, Some(reason.to_string()))
            .await?;
        warn!(reason, "correction engine entered SafeMode");
        Ok(())
    }

    /// Operator-only reset.
    pub async fn reset_safe_mode(&self, operator: &str) -> Result<(), CorrectionError> {
        self.safe_mode.store(false, Ordering::SeqCst);
        self.store
            .set_flag(FLAG_SAFE_MODE, false, Some(format!("reset by {operator}")))
            .await?;
        info!(operator, "SafeMode reset");
        Ok(())
    }

    /// Screen and apply one proposal.
    pub async fn apply(
        &self,
        proposal: CorrectionProposal,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, CorrectionError> {
        if self.safe_mode_active() {
            return Ok(ApplyOutcome::Blocked(BlockReason::SafeModeActive));
        }

        if is_forbidden_target(&proposal.target_entity) {
            self.record_blocked(&proposal, now, "forbidden_target").await?;
            self.store
                .append_admin_audit(hustlexp_storage::AdminAuditAppend {
                    actor_id: self.system_actor,
                    action: "correction_blocked".to_string(),
                    target_kind: "correction".to_string(),
                    target_id: proposal.target_entity.clone(),
                    before: serde_json::json!({}),
                    after: serde_json::json!({
                        "proposed_by": proposal.proposed_by,
                        "reason_code": proposal.reason_code,
                    }),
                    reason: "forbidden correction target".to_string(),
                })
                .await?;
            warn!(
                target = %proposal.target_entity,
                proposed_by = %proposal.proposed_by,
                "forbidden correction target blocked"
            );
            return Ok(ApplyOutcome::Blocked(BlockReason::ForbiddenTarget));
        }

        if !proposal.correction_type.magnitude_in_bounds(proposal.magnitude) {
            self.record_blocked(&proposal, now, "magnitude_out_of_bounds")
                .await?;
            return Ok(ApplyOutcome::Blocked(BlockReason::MagnitudeOutOfBounds));
        }

        let record = CorrectionRecord {
            id: CorrectionId::generate(),
            correction_type: proposal.correction_type,
            target_entity: proposal.target_entity,
            target_id: proposal.target_id,
            scope_key: proposal.scope.key(),
            adjustment: proposal.adjustment,
            magnitude: proposal.magnitude,
            reason_code: proposal.reason_code,
            status: CorrectionStatus::Applied,
            expires_at: now + proposal.ttl,
            applied_by: proposal.proposed_by,
            reversed_at: None,
            created_at: now,
        };

        match self
            .store
            .apply_correction(record, proposal.scope.budget(), now)
            .await?
        {
            Some(applied) => {
                info!(
                    correction_id = %applied.id,
                    correction_type = %applied.correction_type,
                    scope = %applied.scope_key,
                    magnitude = %applied.magnitude,
                    "correction applied"
                );
                Ok(ApplyOutcome::Applied(applied))
            }
            None => Ok(ApplyOutcome::Blocked(BlockReason::OverBudget)),
        }
    }

    async fn record_blocked(
        &self,
        proposal: &CorrectionProposal,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), CorrectionError> {
        self.store
            .record_rejected(CorrectionRecord {
                id: CorrectionId::generate(),
                correction_type: proposal.correction_type,
                target_entity: proposal.target_entity.clone(),
                target_id: proposal.target_id.clone(),
                scope_key: proposal.scope.key(),
                adjustment: proposal.adjustment.clone(),
                magnitude: proposal.magnitude,
                reason_code: format!("{}:{}", reason, proposal.reason_code),
                status: CorrectionStatus::Rejected,
                expires_at: now,
                applied_by: proposal.proposed_by.clone(),
                reversed_at: None,
                created_at: now,
            })
            .await?;
        Ok(())
    }

    /// Explicit reversal path; every applied correction has one.
    pub async fn reverse(
        &self,
        id: CorrectionId,
        now: DateTime<Utc>,
    ) -> Result<CorrectionRecord, CorrectionError> {
        let reversed = self.store.reverse_correction(id, now).await?;
        info!(correction_id = %id, "correction reversed");
        Ok(reversed)
    }

    /// Expire corrections past their TTL; run periodically.
    pub async fn expire_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CorrectionRecord>, CorrectionError> {
        Ok(self.store.expire_due_corrections(now).await?)
    }

    /// Measure one correction against its control group and record the
    /// verdict; trips SafeMode when the rolling non-causal rate crosses the
    /// line.
    pub async fn measure_outcome(
        &self,
        correction_id: CorrectionId,
        treated_baseline: MetricSet,
        treated_post: MetricSet,
        control_baseline: MetricSet,
        control_post: MetricSet,
        window: Duration,
        measured_at: DateTime<Utc>,
    ) -> Result<Verdict, CorrectionError> {
        if window < MIN_WINDOW {
            return Err(CorrectionError::Validation(format!(
                "observation window {} shorter than the {}h minimum",
                window,
                MIN_WINDOW.num_hours()
            )));
        }
        self.store
            .get_correction(correction_id)
            .await?
            .ok_or(CorrectionError::NotFound(correction_id))?;

        let judgement = judge(
            &treated_baseline,
            &treated_post,
            &control_baseline,
            &control_post,
        );
        self.store
            .record_outcome(CausalOutcomeRecord {
                correction_id,
                treated_baseline,
                treated_post,
                control_baseline,
                control_post,
                net_lift: judgement.net_lift,
                verdict: judgement.verdict,
                confidence: judgement.confidence,
                measured_at,
            })
            .await?;
        info!(
            correction_id = %correction_id,
            verdict = %judgement.verdict,
            confidence = %judgement.confidence,
            "correction outcome recorded"
        );

        self.evaluate_safe_mode(measured_at).await?;
        Ok(judgement.verdict)
    }

    /// Latch SafeMode when the 24-hour rolling non-causal rate exceeds 30 %
    /// with at least five samples.
    pub async fn evaluate_safe_mode(&self, now: DateTime<Utc>) -> Result<bool, CorrectionError> {
        if self.safe_mode_active() {
            return Ok(true);
        }
        let outcomes = self.store.outcomes_since(now - SAFE_MODE_WINDOW).await?;
        if outcomes.len() < SAFE_MODE_MIN_SAMPLES {
            return Ok(false);
        }
        let non_causal = outcomes
            .iter()
            .filter(|outcome| outcome.verdict == Verdict::NonCausal)
            .count();
        if non_causal * 100 > outcomes.len() * SAFE_MODE_MAX_NON_CAUSAL_PCT {
            self.enter_safe_mode(&format!(
                "non-causal rate {non_causal}/{} over 24h",
                outcomes.len()
            ))
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Defense-in-depth sweep: an *applied* correction naming a forbidden
    /// target means the screen was bypassed. Reverse it and latch SafeMode.
    pub async fn audit_sweep(&self, now: DateTime<Utc>) -> Result<usize, CorrectionError> {
        let mut found = 0;
        for correction in self.store.applied_corrections(now).await? {
            if is_forbidden_target(&correction.target_entity) {
                found += 1;
                self.store.reverse_correction(correction.id, now).await?;
                self.enter_safe_mode(&format!(
                    "applied correction {} targets forbidden entity {}",
                    correction.id, correction.target_entity
                ))
                .await?;
            }
        }
        Ok(found)
    }
}
