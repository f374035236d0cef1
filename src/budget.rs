//! Cost ceiling and running spend accounting.
//!
//! Each extraction gets its own [`Ledger`]: a mutex-guarded pair of the
//! extraction's [`Budget`] and the [`Response`] being accumulated. Chunk calls
//! may run concurrently, so every check-and-reserve before a call and every
//! charge after it happens under that lock.
//!
//! Before a call the projected cost is *reserved*; a second concurrent chunk
//! sees the reservation and cannot squeeze in under a ceiling the first one
//! is about to use. After the call the reservation is released and the actual
//! cost is charged. A charge is never refused: the spend already happened.
//! If it crosses the ceiling the budget is flagged and every later
//! reservation fails with [`BudgetPhase::Incurred`].
//!
//! [`SharedBudget`] is the explicit opt-in for a ceiling that spans many
//! extractions. When one is configured its ceiling is authoritative and the
//! per-extraction totals are still reported in each response.

use crate::error::BudgetPhase;
use crate::response::{ApiResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// A cost ceiling plus running totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub max_cost: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cost: f64,
    /// Cost reserved by calls currently in flight.
    #[serde(skip)]
    reserved: f64,
    /// An accepted call pushed `total_cost` past `max_cost`.
    pub over_budget: bool,
}

/// A refused reservation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    pub phase: BudgetPhase,
    pub projected: f64,
    pub total_cost: f64,
    pub max_cost: f64,
}

impl Budget {
    pub fn new(max_cost: f64) -> Self {
        Self {
            max_cost,
            ..Default::default()
        }
    }

    /// Reserve `projected` dollars for a call, or refuse.
    fn reserve(&mut self, projected: f64) -> Result<(), Breach> {
        let breach = |phase| Breach {
            phase,
            projected,
            total_cost: self.total_cost,
            max_cost: self.max_cost,
        };
        if self.over_budget {
            return Err(breach(BudgetPhase::Incurred));
        }
        if self.total_cost + self.reserved + projected > self.max_cost {
            return Err(breach(BudgetPhase::Projected));
        }
        self.reserved += projected;
        Ok(())
    }

    fn release(&mut self, reserved: f64) {
        self.reserved = (self.reserved - reserved).max(0.0);
    }

    /// Add an incurred call. Returns `true` when this charge crossed the ceiling.
    fn charge(&mut self, prompt_tokens: u64, completion_tokens: u64, cost: f64) -> bool {
        self.total_prompt_tokens += prompt_tokens;
        self.total_completion_tokens += completion_tokens;
        self.total_cost += cost;
        if !self.over_budget && self.total_cost > self.max_cost {
            self.over_budget = true;
            return true;
        }
        false
    }

    /// Dollars left before the ceiling (never negative).
    pub fn remaining(&self) -> f64 {
        (self.max_cost - self.total_cost).max(0.0)
    }

    /// Dollars held by calls still in flight.
    pub fn reserved(&self) -> f64 {
        self.reserved
    }
}

/// A budget shared by many extractions, behind an explicit lock.
#[derive(Debug, Clone)]
pub struct SharedBudget {
    inner: Arc<Mutex<Budget>>,
}

impl SharedBudget {
    pub fn new(max_cost: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Budget::new(max_cost))),
        }
    }

    /// Lifetime totals so far.
    pub async fn snapshot(&self) -> Budget {
        self.inner.lock().await.clone()
    }
}

struct LedgerState {
    budget: Budget,
    response: Response,
}

/// Accounting for one extraction.
pub(crate) struct Ledger {
    state: Mutex<LedgerState>,
    shared: Option<SharedBudget>,
}

impl Ledger {
    pub(crate) fn new(max_cost: f64, shared: Option<SharedBudget>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                budget: Budget::new(max_cost),
                response: Response::default(),
            }),
            shared,
        }
    }

    /// Check-and-reserve before dispatch.
    pub(crate) async fn reserve(&self, projected: f64) -> Result<(), Breach> {
        let mut state = self.state.lock().await;
        match &self.shared {
            Some(shared) => shared.inner.lock().await.reserve(projected),
            None => state.budget.reserve(projected),
        }
    }

    /// Drop a reservation for a call that produced no reply.
    pub(crate) async fn release(&self, reserved: f64) {
        let mut state = self.state.lock().await;
        match &self.shared {
            Some(shared) => shared.inner.lock().await.release(reserved),
            None => state.budget.release(reserved),
        }
    }

    /// Charge a reply, release its reservation and append it to the response.
    /// Returns `true` when the ceiling is now exceeded.
    pub(crate) async fn charge(&self, reply: ApiResponse, reserved: f64) -> bool {
        let mut state = self.state.lock().await;
        let (p, c, cost) = (reply.prompt_tokens, reply.completion_tokens, reply.cost);
        state.budget.release(reserved);
        let local_crossed = state.budget.charge(p, c, cost);
        let over = match &self.shared {
            Some(shared) => {
                let mut lifetime = shared.inner.lock().await;
                lifetime.release(reserved);
                lifetime.charge(p, c, cost);
                lifetime.over_budget
            }
            None => {
                if local_crossed {
                    warn!(
                        "Spend ${:.4} crossed the ${:.4} ceiling; no further calls for this extraction",
                        state.budget.total_cost, state.budget.max_cost
                    );
                }
                state.budget.over_budget
            }
        };
        state.response.record(reply);
        state.response.over_budget |= over;
        over
    }

    /// Copy of the response accumulated so far.
    pub(crate) async fn snapshot(&self) -> Response {
        self.state.lock().await.response.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::FinishReason;

    fn reply(cost: f64) -> ApiResponse {
        ApiResponse {
            model: "m".into(),
            content: "[]".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            cost,
            finish: FinishReason::Stop,
            duration_ms: 1,
            chunk: 0,
        }
    }

    #[test]
    fn projected_breach_refuses_without_spend() {
        let mut b = Budget::new(0.01);
        let e = b.reserve(0.02).unwrap_err();
        assert_eq!(e.phase, BudgetPhase::Projected);
        assert_eq!(b.total_cost, 0.0);
    }

    #[test]
    fn reservations_count_against_ceiling() {
        let mut b = Budget::new(1.0);
        b.reserve(0.6).unwrap();
        assert!(b.reserve(0.6).is_err());
        b.release(0.6);
        b.reserve(0.6).unwrap();
    }

    #[test]
    fn charge_flags_first_crossing_only() {
        let mut b = Budget::new(1.0);
        assert!(!b.charge(1, 1, 0.7));
        assert!(b.charge(1, 1, 0.7));
        assert!(!b.charge(1, 1, 0.1));
        assert!(b.over_budget);
        assert_eq!(b.remaining(), 0.0);
        assert_eq!(b.reserve(0.0).unwrap_err().phase, BudgetPhase::Incurred);
    }

    #[tokio::test]
    async fn ledger_records_and_flags_over_budget() {
        let ledger = Ledger::new(0.1, None);
        ledger.reserve(0.05).await.unwrap();
        assert!(!ledger.charge(reply(0.05), 0.05).await);
        ledger.reserve(0.04).await.unwrap();
        assert!(ledger.charge(reply(0.2), 0.04).await);
        let r = ledger.snapshot().await;
        assert_eq!(r.api_responses.len(), 2);
        assert!(r.over_budget);
        assert!((r.total_cost - 0.25).abs() < 1e-12);
        let e = ledger.reserve(0.0).await.unwrap_err();
        assert_eq!(e.phase, BudgetPhase::Incurred);
    }

    #[tokio::test]
    async fn shared_budget_spans_ledgers() {
        let shared = SharedBudget::new(0.1);
        let first = Ledger::new(10.0, Some(shared.clone()));
        first.reserve(0.08).await.unwrap();
        first.charge(reply(0.08), 0.08).await;

        let second = Ledger::new(10.0, Some(shared.clone()));
        let e = second.reserve(0.05).await.unwrap_err();
        assert_eq!(e.phase, BudgetPhase::Projected);
        assert!((e.total_cost - 0.08).abs() < 1e-12);

        let lifetime = shared.snapshot().await;
        assert_eq!(lifetime.total_prompt_tokens, 10);
        // per-extraction totals stay separate
        assert_eq!(second.snapshot().await.total_cost, 0.0);
    }
}
