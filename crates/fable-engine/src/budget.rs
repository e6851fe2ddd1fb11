//! Per-user monthly budget tracking.
//!
//! Every provider call is paid for in two phases: the pipeline reserves the
//! item's estimated cost before dispatch, then settles the provider's actual
//! cost (or releases the hold) once the call resolves. Reserve is an atomic
//! check-and-hold against the tier's monthly ceiling, so two items racing for
//! the last cents of a budget can never both pass.
//!
//! A denial is not a provider failure: the fallback chain is not consulted
//! and the run fails with a `budget_exceeded` error the caller must act on.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};

use fable_models::{monthly_budget_cents, PlanTier};

use crate::error::{EngineError, EngineResult};

/// Current accounting period in "YYYY-MM" format.
pub fn current_period() -> String {
    let now = Utc::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

// =============================================================================
// Ledger entries
// =============================================================================

/// What a budget ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetEntryKind {
    /// Estimated cost held before dispatch
    Reserve,
    /// Actual cost charged after a successful call
    Settle,
    /// Hold returned after a failed or discarded call
    Release,
}

impl BudgetEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetEntryKind::Reserve => "reserve",
            BudgetEntryKind::Settle => "settle",
            BudgetEntryKind::Release => "release",
        }
    }
}

/// One append-only audit record of a budget movement.
#[derive(Debug, Clone)]
pub struct BudgetEntry {
    pub user_id: String,
    pub period: String,
    pub kind: BudgetEntryKind,
    pub amount_cents: u64,
    /// Total settled spend for the period after this entry.
    pub spent_after_cents: u64,
    /// What the movement paid for, e.g. "audio item 2 of gen-abc".
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// Reservations
// =============================================================================

/// A hold on a user's budget for one item.
///
/// Obtained from [`BudgetTracker::reserve`] and consumed by exactly one of
/// `settle` or `release`. The hold counts against the ceiling until then.
#[derive(Debug)]
pub struct Reservation {
    user_id: String,
    period: String,
    amount_cents: u64,
    description: String,
}

impl Reservation {
    /// Estimated cents held by this reservation.
    pub fn amount_cents(&self) -> u64 {
        self.amount_cents
    }
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug, Default)]
struct Account {
    spent_cents: u64,
    reserved_cents: u64,
}

#[derive(Debug, Default)]
struct BudgetState {
    accounts: HashMap<(String, String), Account>,
    entries: Vec<BudgetEntry>,
}

/// In-process budget accounts, keyed by user and month.
///
/// All movements for one check happen under a single lock, which is what
/// makes reserve a true check-and-hold.
#[derive(Debug, Default)]
pub struct BudgetTracker {
    state: Mutex<BudgetState>,
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically hold `amount_cents` against the user's remaining budget
    /// for the current month.
    ///
    /// Fails with [`EngineError::BudgetExceeded`] when settled spend plus
    /// outstanding holds plus the new amount would pass the tier ceiling.
    pub fn reserve(
        &self,
        user_id: &str,
        tier: PlanTier,
        amount_cents: u64,
        description: impl Into<String>,
    ) -> EngineResult<Reservation> {
        self.reserve_in_period(user_id, &current_period(), tier, amount_cents, description)
    }

    fn reserve_in_period(
        &self,
        user_id: &str,
        period: &str,
        tier: PlanTier,
        amount_cents: u64,
        description: impl Into<String>,
    ) -> EngineResult<Reservation> {
        let description = description.into();
        let ceiling = monthly_budget_cents(tier);
        let mut state = self.state.lock().unwrap();

        let account = state
            .accounts
            .entry((user_id.to_string(), period.to_string()))
            .or_default();
        let committed = account.spent_cents.saturating_add(account.reserved_cents);

        if committed.saturating_add(amount_cents) > ceiling {
            return Err(EngineError::BudgetExceeded {
                needed_cents: amount_cents,
                available_cents: ceiling.saturating_sub(committed),
                message: description,
            });
        }

        account.reserved_cents += amount_cents;
        let spent_after = account.spent_cents;
        state.entries.push(BudgetEntry {
            user_id: user_id.to_string(),
            period: period.to_string(),
            kind: BudgetEntryKind::Reserve,
            amount_cents,
            spent_after_cents: spent_after,
            description: description.clone(),
            recorded_at: Utc::now(),
        });

        Ok(Reservation {
            user_id: user_id.to_string(),
            period: period.to_string(),
            amount_cents,
            description,
        })
    }

    /// Consume a reservation, charging the provider's actual cost.
    ///
    /// The actual cost may differ from the hold in either direction: the
    /// remainder of a generous hold is returned, and an overage is charged
    /// anyway since the ceiling was enforced at reserve time.
    pub fn settle(&self, reservation: Reservation, actual_cents: u64) -> u64 {
        let mut state = self.state.lock().unwrap();

        let account = state
            .accounts
            .entry((reservation.user_id.clone(), reservation.period.clone()))
            .or_default();
        account.reserved_cents = account.reserved_cents.saturating_sub(reservation.amount_cents);
        account.spent_cents = account.spent_cents.saturating_add(actual_cents);
        let spent_after = account.spent_cents;

        state.entries.push(BudgetEntry {
            user_id: reservation.user_id,
            period: reservation.period,
            kind: BudgetEntryKind::Settle,
            amount_cents: actual_cents,
            spent_after_cents: spent_after,
            description: reservation.description,
            recorded_at: Utc::now(),
        });

        actual_cents
    }

    /// Consume a reservation without charging, returning the full hold.
    pub fn release(&self, reservation: Reservation) {
        let mut state = self.state.lock().unwrap();

        let account = state
            .accounts
            .entry((reservation.user_id.clone(), reservation.period.clone()))
            .or_default();
        account.reserved_cents = account.reserved_cents.saturating_sub(reservation.amount_cents);
        let spent_after = account.spent_cents;

        state.entries.push(BudgetEntry {
            user_id: reservation.user_id,
            period: reservation.period,
            kind: BudgetEntryKind::Release,
            amount_cents: reservation.amount_cents,
            spent_after_cents: spent_after,
            description: reservation.description,
            recorded_at: Utc::now(),
        });
    }

    /// Settled spend for the user in the current period.
    pub fn spent_cents(&self, user_id: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .accounts
            .get(&(user_id.to_string(), current_period()))
            .map(|a| a.spent_cents)
            .unwrap_or(0)
    }

    /// Outstanding holds for the user in the current period.
    pub fn reserved_cents(&self, user_id: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .accounts
            .get(&(user_id.to_string(), current_period()))
            .map(|a| a.reserved_cents)
            .unwrap_or(0)
    }

    /// Cents still available to the user before the tier ceiling.
    pub fn available_cents(&self, user_id: &str, tier: PlanTier) -> u64 {
        let state = self.state.lock().unwrap();
        let committed = state
            .accounts
            .get(&(user_id.to_string(), current_period()))
            .map(|a| a.spent_cents.saturating_add(a.reserved_cents))
            .unwrap_or(0);
        monthly_budget_cents(tier).saturating_sub(committed)
    }

    /// Audit entries for one user, oldest first.
    pub fn entries_for(&self, user_id: &str) -> Vec<BudgetEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_period_key_format() {
        let period = current_period();
        assert_eq!(period.len(), 7);
        let parts: Vec<&str> = period.split('-').collect();
        assert_eq!(parts.len(), 2);
        let month: u32 = parts[1].parse().unwrap();
        assert!((1..=12).contains(&month));
    }

    #[test]
    fn test_reserve_settle_accounting() {
        let tracker = BudgetTracker::new();

        // Free ceiling is 1500 cents
        let reservation = tracker
            .reserve("u1", PlanTier::Free, 90, "scene_video item 0")
            .unwrap();
        assert_eq!(tracker.reserved_cents("u1"), 90);
        assert_eq!(tracker.spent_cents("u1"), 0);

        tracker.settle(reservation, 45);
        assert_eq!(tracker.reserved_cents("u1"), 0);
        assert_eq!(tracker.spent_cents("u1"), 45);
        assert_eq!(tracker.available_cents("u1", PlanTier::Free), 1455);
    }

    #[test]
    fn test_release_returns_full_hold() {
        let tracker = BudgetTracker::new();

        let reservation = tracker.reserve("u1", PlanTier::Free, 500, "audio item 1").unwrap();
        tracker.release(reservation);

        assert_eq!(tracker.spent_cents("u1"), 0);
        assert_eq!(tracker.available_cents("u1", PlanTier::Free), 1500);
    }

    #[test]
    fn test_denial_when_holds_fill_the_ceiling() {
        let tracker = BudgetTracker::new();

        let _held = tracker.reserve("u1", PlanTier::Free, 1400, "bulk hold").unwrap();
        let err = tracker
            .reserve("u1", PlanTier::Free, 200, "audio item 0")
            .unwrap_err();

        match err {
            EngineError::BudgetExceeded {
                needed_cents,
                available_cents,
                ..
            } => {
                assert_eq!(needed_cents, 200);
                assert_eq!(available_cents, 100);
            }
            other => panic!("expected budget denial, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_reserves_never_overcommit() {
        let tracker = Arc::new(BudgetTracker::new());

        // Free ceiling is 1500 cents; 20 threads race for 100-cent holds.
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    tracker
                        .reserve("u1", PlanTier::Free, 100, format!("item {i}"))
                        .is_ok()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();

        assert_eq!(granted, 15);
        assert_eq!(tracker.reserved_cents("u1"), 1500);
    }

    #[test]
    fn test_users_and_periods_are_independent() {
        let tracker = BudgetTracker::new();

        tracker
            .reserve_in_period("u1", "2026-07", PlanTier::Free, 1500, "july")
            .unwrap();
        // Same user, new month: full ceiling again
        tracker
            .reserve_in_period("u1", "2026-08", PlanTier::Free, 1500, "august")
            .unwrap();
        // Different user, same month: unaffected
        tracker
            .reserve_in_period("u2", "2026-07", PlanTier::Free, 1500, "july")
            .unwrap();
    }

    #[test]
    fn test_entries_record_every_movement() {
        let tracker = BudgetTracker::new();

        let r1 = tracker.reserve("u1", PlanTier::Creator, 40, "script").unwrap();
        tracker.settle(r1, 40);
        let r2 = tracker.reserve("u1", PlanTier::Creator, 12, "scene_images item 0").unwrap();
        tracker.release(r2);

        let entries = tracker.entries_for("u1");
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].kind, BudgetEntryKind::Reserve);
        assert_eq!(entries[1].kind, BudgetEntryKind::Settle);
        assert_eq!(entries[1].spent_after_cents, 40);
        assert_eq!(entries[3].kind, BudgetEntryKind::Release);
        assert_eq!(entries[3].spent_after_cents, 40);
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_pass_the_ceiling() {
        let tracker = Arc::new(BudgetTracker::new());

        // Free ceiling 1500; eight tasks racing for 200-cent holds can admit
        // at most seven.
        let mut handles = Vec::new();
        for i in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                tracker
                    .reserve("u1", PlanTier::Free, 200, format!("item {i}"))
                    .is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 7);
        assert_eq!(tracker.reserved_cents("u1"), 1400);
    }
}
