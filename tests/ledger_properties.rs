//! Property-based tests for credit ledger invariants
//!
//! These tests use proptest to verify the planning core that every mutating
//! ledger action applies under row locks:
//! - FIFO consumption: earlier grants drain completely before later ones
//! - No negative grant: planned remaining amounts never go below zero
//! - Conservation: credits moved out of active grants equal credits moved
//!   into failed grants
//! - Settlement bound: total settled is exactly min(debt, active balance)

use chrono::{Duration, Utc};
use credit_tracker::ledger::{allocate_fifo, plan_settlement, GrantDraw};
use credit_tracker::models::{CreditGrant, GrantStatus};
use proptest::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

fn grant(initial: i64, remaining: i64, status: GrantStatus) -> CreditGrant {
    let mut g = CreditGrant::new(
        "0xlicense",
        "did:asset:1",
        initial,
        status,
        "0xhash",
        None,
        Utc::now() + Duration::days(30),
    );
    g.remaining_amount = remaining;
    g
}

/// Strategy for active grants: spendable balance between 1 and 5000 each
fn active_grants_strategy() -> impl Strategy<Value = Vec<CreditGrant>> {
    prop::collection::vec((1i64..5_000, prop::bool::ANY), 0..8).prop_map(|specs| {
        specs
            .into_iter()
            .map(|(remaining, pending)| {
                let status = if pending {
                    GrantStatus::Pending
                } else {
                    GrantStatus::Confirmed
                };
                grant(remaining, remaining, status)
            })
            .collect()
    })
}

/// Strategy for failed grants: `spent` of the initial amount is debt
fn failed_grants_strategy() -> impl Strategy<Value = Vec<CreditGrant>> {
    prop::collection::vec((1i64..5_000, 0i64..5_000), 0..6).prop_map(|specs| {
        specs
            .into_iter()
            .map(|(initial, spent)| {
                let spent = spent.min(initial);
                grant(initial, initial - spent, GrantStatus::Failed)
            })
            .collect()
    })
}

/// Replay a plan's movements onto the grant snapshots.
fn apply_moves(grants: &mut [CreditGrant], moves: &[GrantDraw]) {
    let final_remaining: HashMap<Uuid, i64> = moves
        .iter()
        .map(|m| (m.grant_id, m.remaining_after))
        .collect();
    for g in grants.iter_mut() {
        if let Some(remaining) = final_remaining.get(&g.id) {
            g.remaining_amount = *remaining;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Property: a deduction takes exactly the requested amount, capped by
    /// what the grants hold
    #[test]
    fn prop_allocation_total_is_exact(
        grants in active_grants_strategy(),
        amount in 0i64..20_000,
    ) {
        let available: i64 = grants.iter().map(|g| g.remaining_amount).sum();
        let draws = allocate_fifo(&grants, amount);

        let taken: i64 = draws.iter().map(|d| d.amount).sum();
        prop_assert_eq!(taken, amount.min(available));
    }

    /// Property: consumption is a strict FIFO prefix; every drawn grant
    /// before the last is drained to zero
    #[test]
    fn prop_allocation_is_fifo_prefix(
        grants in active_grants_strategy(),
        amount in 1i64..20_000,
    ) {
        let draws = allocate_fifo(&grants, amount);

        for (i, draw) in draws.iter().enumerate() {
            prop_assert_eq!(draw.grant_id, grants[i].id);
            prop_assert!(draw.amount > 0);
            prop_assert!(draw.amount <= grants[i].remaining_amount);
            prop_assert_eq!(draw.remaining_after, grants[i].remaining_amount - draw.amount);
            if i + 1 < draws.len() {
                prop_assert_eq!(draw.remaining_after, 0);
            }
        }
    }

    /// Property: planned remaining amounts never go negative
    #[test]
    fn prop_no_negative_remaining(
        failed in failed_grants_strategy(),
        active in active_grants_strategy(),
    ) {
        let plan = plan_settlement(&failed, &active).unwrap();
        for mv in &plan.moves {
            prop_assert!(mv.amount > 0);
            prop_assert!(mv.remaining_after >= 0);
        }
    }

    /// Property: settlement moves exactly min(debt, balance) and records both
    /// sides of every transfer
    #[test]
    fn prop_settlement_bound_and_conservation(
        failed in failed_grants_strategy(),
        active in active_grants_strategy(),
    ) {
        let total_debt: i64 = failed.iter().map(|g| g.debt()).sum();
        let total_balance: i64 = active.iter().map(|g| g.remaining_amount).sum();

        let plan = plan_settlement(&failed, &active).unwrap();

        prop_assert_eq!(plan.total_settled, total_debt.min(total_balance));

        // |sum of amount_used| == 2 * settled: an active debit and a failed
        // credit for every settled credit
        let moved: i64 = plan.moves.iter().map(|m| m.amount).sum();
        prop_assert_eq!(moved, 2 * plan.total_settled);
    }

    /// Property: after applying a settlement, failed grants never exceed
    /// their initial amount and the books balance on both sides
    #[test]
    fn prop_settlement_application_balances(
        failed in failed_grants_strategy(),
        active in active_grants_strategy(),
    ) {
        let debt_before: i64 = failed.iter().map(|g| g.debt()).sum();
        let balance_before: i64 = active.iter().map(|g| g.remaining_amount).sum();

        let plan = plan_settlement(&failed, &active).unwrap();

        let mut failed_after = failed.clone();
        let mut active_after = active.clone();
        apply_moves(&mut failed_after, &plan.moves);
        apply_moves(&mut active_after, &plan.moves);

        for g in &failed_after {
            prop_assert!(g.remaining_amount <= g.initial_amount);
            prop_assert!(g.remaining_amount >= 0);
        }

        let debt_after: i64 = failed_after.iter().map(|g| g.debt()).sum();
        let balance_after: i64 = active_after.iter().map(|g| g.remaining_amount).sum();

        prop_assert_eq!(debt_before - debt_after, plan.total_settled);
        prop_assert_eq!(balance_before - balance_after, plan.total_settled);
    }

    /// Property: settlement converges; a second pass over the settled state
    /// has nothing left to move
    #[test]
    fn prop_settlement_converges(
        failed in failed_grants_strategy(),
        active in active_grants_strategy(),
    ) {
        let plan = plan_settlement(&failed, &active).unwrap();

        let mut failed_after = failed.clone();
        let mut active_after = active.clone();
        apply_moves(&mut failed_after, &plan.moves);
        apply_moves(&mut active_after, &plan.moves);

        // re-derive the inputs the way the store queries would
        let still_failed: Vec<CreditGrant> = failed_after
            .into_iter()
            .filter(|g| g.remaining_amount < g.initial_amount)
            .collect();
        let still_active: Vec<CreditGrant> = active_after
            .into_iter()
            .filter(|g| g.remaining_amount > 0)
            .collect();

        let second = plan_settlement(&still_failed, &still_active).unwrap();
        prop_assert_eq!(second.total_settled, 0);
        prop_assert!(second.moves.is_empty());
    }
}
