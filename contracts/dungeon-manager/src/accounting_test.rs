#![cfg(test)]

//! Escrow and reward-accounting tests.
//!
//! These pin down the money paths: the completion split (DM fee, royalty,
//! pro-rata player shares with dust retained), forfeiture on failure, the
//! value-conservation invariant over the contract's native balance, and the
//! pull-payment withdrawal queue.

use crate::test::{
    accept_current_dm, act, assert_game_error, complete, enter, fail_now, game_with_agents,
    new_agent, respond, reward_gold, setup, stake_dungeon_with, warp,
};
use crate::{Error, SessionState, ENTRY_BOND, SESSION_TIMEOUT};
use soroban_sdk::{vec, Address, String};
use soroban_sdk::testutils::Address as _;

// ============================================================================
// Completion Split
// ============================================================================

#[test]
fn completion_split_rounds_down_and_retains_dust() {
    let s = setup();
    let (dungeon_id, owner, agents) = game_with_agents(&s, 5, 3, 3);
    for a in agents.iter() {
        enter(&s, &a, dungeon_id);
    }
    let dm = accept_current_dm(&s, 1);
    let sess = s.client.get_session(&1);
    let p0 = sess.party.get_unchecked(0);
    let p1 = sess.party.get_unchecked(1);

    act(&s, 1, &p0);
    act(&s, 1, &p1);
    respond(
        &s,
        1,
        &dm,
        vec![
            &s.env,
            reward_gold(&s.env, &p0, 100),
            reward_gold(&s.env, &p1, 1),
            complete(&s.env),
        ],
    );

    // pool = 101: dm_fee = 15, royalty = 5, players_share = 81.
    // p0 gets 81 * 100 / 101 = 80, p1 gets 81 * 1 / 101 = 0; 1 unit of dust
    // is silently retained.
    assert_eq!(s.gold.balance_of(&dm), 15);
    assert_eq!(s.gold.balance_of(&p0), 80);
    assert_eq!(s.gold.balance_of(&p1), 0);
    assert_eq!(s.client.pending_royalties(&owner), 5);

    let minted = s.gold.balance_of(&dm) + s.gold.balance_of(&p0) + s.gold.balance_of(&p1);
    assert!(minted + s.client.pending_royalties(&owner) <= 101);
}

#[test]
fn completion_uses_fee_snapshot_of_creation_epoch() {
    let s = setup();
    let (dungeon_id, _owner, agents) = game_with_agents(&s, 5, 2, 2);
    enter(&s, &agents.get_unchecked(0), dungeon_id);
    enter(&s, &agents.get_unchecked(1), dungeon_id);
    let dm = accept_current_dm(&s, 1);
    let player = s.client.get_session(&1).party.get_unchecked(0);

    // The epoch rotates into Grace and the owner retunes the fee; the live
    // session still settles under the 15% pinned at its creation epoch.
    s.client.end_epoch();
    s.client.set_dm_fee_pct(&50);

    act(&s, 1, &player);
    respond(
        &s,
        1,
        &dm,
        vec![&s.env, reward_gold(&s.env, &player, 100), complete(&s.env)],
    );
    assert_eq!(s.gold.balance_of(&dm), 15);
    assert_eq!(s.gold.balance_of(&player), 80);
}

#[test]
fn double_complete_is_a_noop() {
    let s = setup();
    let (dungeon_id, owner, agents) = game_with_agents(&s, 5, 2, 2);
    enter(&s, &agents.get_unchecked(0), dungeon_id);
    enter(&s, &agents.get_unchecked(1), dungeon_id);
    let dm = accept_current_dm(&s, 1);
    let player = s.client.get_session(&1).party.get_unchecked(0);

    act(&s, 1, &player);
    // A stray second COMPLETE in the same batch must not double-settle.
    respond(
        &s,
        1,
        &dm,
        vec![
            &s.env,
            reward_gold(&s.env, &player, 100),
            complete(&s.env),
            complete(&s.env),
        ],
    );
    assert_eq!(s.gold.balance_of(&player), 80);
    assert_eq!(s.gold.balance_of(&dm), 15);
    assert_eq!(s.client.pending_royalties(&owner), 5);
    assert_eq!(s.client.get_agent_stats(&player).games_played, 1);

    // A whole follow-up response is rejected outright.
    let res = s.client.try_submit_dm_response(
        &1,
        &1,
        &String::from_str(&s.env, "again"),
        &vec![&s.env, complete(&s.env)],
        &dm,
    );
    assert_game_error(&res, Error::SessionNotActive);
}

#[test]
fn flee_then_complete_settles_both_legs() {
    let s = setup();
    let (dungeon_id, owner, agents) = game_with_agents(&s, 5, 3, 3);
    for a in agents.iter() {
        enter(&s, &a, dungeon_id);
    }
    let dm = accept_current_dm(&s, 1);
    let sess = s.client.get_session(&1);
    let p0 = sess.party.get_unchecked(0);
    let p1 = sess.party.get_unchecked(1);

    act(&s, 1, &p0);
    act(&s, 1, &p1);
    respond(&s, 1, &dm, vec![&s.env, reward_gold(&s.env, &p0, 100)]);

    // p0 cashes out early: 95 minted, 5 royalty booked.
    s.client.flee(&1, &p0);
    assert_eq!(s.gold.balance_of(&p0), 95);
    assert_eq!(s.client.pending_royalties(&owner), 5);

    // Completion still computes from the full (monotone) pool: dm_fee 15,
    // royalty 5 again, players_share 80 pro-rata over living gold (zero),
    // so nothing further is distributed to players.
    act(&s, 1, &p1);
    respond(&s, 1, &dm, vec![&s.env, complete(&s.env)]);
    assert_eq!(s.gold.balance_of(&dm), 15);
    assert_eq!(s.gold.balance_of(&p1), 0);
    assert_eq!(s.client.pending_royalties(&owner), 10);
}

// ============================================================================
// Bond Escrow & Value Conservation
// ============================================================================

#[test]
fn withdrawal_returns_exactly_the_entry_bond() {
    let s = setup();
    let (dungeon_id, _owner, agents) = game_with_agents(&s, 5, 2, 2);
    let a = agents.get_unchecked(0);
    let b = agents.get_unchecked(1);
    let start = s.native.balance(&a);

    enter(&s, &a, dungeon_id);
    assert_eq!(s.native.balance(&a), start - ENTRY_BOND);
    enter(&s, &b, dungeon_id);

    warp(&s.env, SESSION_TIMEOUT + 1);
    s.client.timeout_session(&1);
    s.client.withdraw_bond(&a);
    assert_eq!(s.native.balance(&a), start);

    let res = s.client.try_withdraw_bond(&a);
    assert_game_error(&res, Error::NothingToWithdraw);
}

#[test]
fn overpaid_bond_is_held_and_returned_in_full() {
    let s = setup();
    let (dungeon_id, _owner, agents) = game_with_agents(&s, 5, 2, 2);
    let a = agents.get_unchecked(0);
    let b = agents.get_unchecked(1);

    s.client.enter_dungeon(&a, &dungeon_id, &(2 * ENTRY_BOND));
    assert_eq!(s.client.bond_of(&1, &a), 2 * ENTRY_BOND);
    enter(&s, &b, dungeon_id);

    warp(&s.env, SESSION_TIMEOUT + 1);
    s.client.timeout_session(&1);
    assert_eq!(s.client.withdrawable_bond(&a), 2 * ENTRY_BOND);
}

#[test]
fn withdraw_with_empty_queue_fails() {
    let s = setup();
    let stranger = Address::generate(&s.env);
    let res = s.client.try_withdraw_bond(&stranger);
    assert_game_error(&res, Error::NothingToWithdraw);
}

#[test]
fn native_balance_equals_bonds_plus_queues_plus_loot() {
    let s = setup();
    let (d1, _o1) = stake_dungeon_with(&s, 1, 5, 2);
    let (d2, _o2) = stake_dungeon_with(&s, 2, 5, 2);
    s.client.start_epoch();
    let a = new_agent(&s);
    let b = new_agent(&s);
    let c = new_agent(&s);
    let d = new_agent(&s);

    // Session 1 completes: both bonds go to the withdrawable queue.
    enter(&s, &a, d1);
    enter(&s, &b, d1);
    let dm = accept_current_dm(&s, 1);
    let player = s.client.get_session(&1).party.get_unchecked(0);
    act(&s, 1, &player);
    respond(&s, 1, &dm, vec![&s.env, complete(&s.env)]);

    // Session 2 fails: both bonds forfeit into dungeon 1's loot pool.
    enter(&s, &a, d1);
    enter(&s, &b, d1);
    let dm = accept_current_dm(&s, 2);
    let player = s.client.get_session(&2).party.get_unchecked(0);
    act(&s, 2, &player);
    respond(&s, 2, &dm, vec![&s.env, fail_now(&s.env)]);

    // Session 3 stays live: bonds remain in per-session escrow.
    enter(&s, &c, d2);
    enter(&s, &d, d2);
    accept_current_dm(&s, 3);

    // Session 4 times out: bonds go to the withdrawable queue.
    enter(&s, &a, d1);
    enter(&s, &b, d1);
    warp(&s.env, SESSION_TIMEOUT + 1);
    s.client.timeout_session(&4);

    let conserved = |s: &crate::test::Setup| {
        let queues = s.client.withdrawable_bond(&a)
            + s.client.withdrawable_bond(&b)
            + s.client.withdrawable_bond(&c)
            + s.client.withdrawable_bond(&d);
        let held = s.client.bond_of(&3, &c) + s.client.bond_of(&3, &d);
        let loot =
            s.client.get_dungeon(&d1).loot_pool + s.client.get_dungeon(&d2).loot_pool;
        queues + held + loot
    };
    assert_eq!(s.native.balance(&s.manager), 8 * ENTRY_BOND);
    assert_eq!(conserved(&s), 8 * ENTRY_BOND);

    // Withdrawals drain the queue and the contract balance in lockstep.
    s.client.withdraw_bond(&a);
    assert_eq!(s.native.balance(&s.manager), 6 * ENTRY_BOND);
    assert_eq!(conserved(&s), 6 * ENTRY_BOND);
}

// ============================================================================
// Loot Pool Awards
// ============================================================================

#[test]
fn dm_can_recycle_forfeited_gold_within_caps() {
    let s = setup();
    let (dungeon_id, _owner, agents) = game_with_agents(&s, 5, 2, 2);
    let a = agents.get_unchecked(0);
    let b = agents.get_unchecked(1);

    // First run fails with 100 accrued gold, seeding the loot pool.
    enter(&s, &a, dungeon_id);
    enter(&s, &b, dungeon_id);
    let dm = accept_current_dm(&s, 1);
    let player = s.client.get_session(&1).party.get_unchecked(0);
    act(&s, 1, &player);
    respond(
        &s,
        1,
        &dm,
        vec![&s.env, reward_gold(&s.env, &player, 100), fail_now(&s.env)],
    );
    let dgn = s.client.get_dungeon(&dungeon_id);
    assert_eq!(dgn.loot_gold, 100);
    assert_eq!(dgn.loot_pool, 2 * ENTRY_BOND);

    // Second run: the DM pays out of the loot pool.
    enter(&s, &a, dungeon_id);
    enter(&s, &b, dungeon_id);
    let dm = accept_current_dm(&s, 2);
    let sess = s.client.get_session(&2);
    let player = sess.party.get_unchecked(0);

    // Per-action cap applies to loot awards too.
    let res = s.client.try_award_from_loot_pool(&2, &dm, &player, &101);
    assert_game_error(&res, Error::GoldCapExceeded);
    // Only the session's DM may draw.
    let res = s.client.try_award_from_loot_pool(&2, &player, &player, &10);
    assert_game_error(&res, Error::NotDm);
    // The DM is not a valid target.
    let res = s.client.try_award_from_loot_pool(&2, &dm, &dm, &10);
    assert_game_error(&res, Error::NotPartyMember);

    s.client.award_from_loot_pool(&2, &dm, &player, &60);
    assert_eq!(s.client.get_dungeon(&dungeon_id).loot_gold, 40);
    assert_eq!(s.client.session_gold(&2, &player), 60);
    assert_eq!(s.client.get_session(&2).gold_pool, 60);

    // The pool cannot go negative.
    let res = s.client.try_award_from_loot_pool(&2, &dm, &player, &50);
    assert_game_error(&res, Error::InsufficientLootPool);

    // Recycled gold settles like any other on completion.
    act(&s, 2, &player);
    respond(&s, 2, &dm, vec![&s.env, complete(&s.env)]);
    // pool = 60: dm_fee 9, royalty 3, players_share 48.
    assert_eq!(s.gold.balance_of(&player), 48);
    assert_eq!(s.gold.balance_of(&dm), 9);
}

// ============================================================================
// Royalties
// ============================================================================

#[test]
fn royalty_claim_mints_once_and_zeroes_the_iou() {
    let s = setup();
    let (dungeon_id, owner, agents) = game_with_agents(&s, 5, 2, 2);
    enter(&s, &agents.get_unchecked(0), dungeon_id);
    enter(&s, &agents.get_unchecked(1), dungeon_id);
    let dm = accept_current_dm(&s, 1);
    let player = s.client.get_session(&1).party.get_unchecked(0);
    act(&s, 1, &player);
    respond(
        &s,
        1,
        &dm,
        vec![&s.env, reward_gold(&s.env, &player, 100), complete(&s.env)],
    );
    assert_eq!(s.client.pending_royalties(&owner), 5);

    s.client.claim_royalties(&owner);
    assert_eq!(s.gold.balance_of(&owner), 5);
    assert_eq!(s.client.pending_royalties(&owner), 0);

    let res = s.client.try_claim_royalties(&owner);
    assert_game_error(&res, Error::NothingToWithdraw);
}

// ============================================================================
// Stats Bookkeeping
// ============================================================================

#[test]
fn games_played_counts_only_runs_that_happened() {
    let s = setup();
    let (dungeon_id, _owner, agents) = game_with_agents(&s, 5, 2, 2);
    let a = agents.get_unchecked(0);
    let b = agents.get_unchecked(1);

    // Completed run counts for every participant.
    enter(&s, &a, dungeon_id);
    enter(&s, &b, dungeon_id);
    let dm = accept_current_dm(&s, 1);
    let player = s.client.get_session(&1).party.get_unchecked(0);
    act(&s, 1, &player);
    respond(&s, 1, &dm, vec![&s.env, complete(&s.env)]);
    assert_eq!(s.client.get_agent_stats(&a).games_played, 1);
    assert_eq!(s.client.get_agent_stats(&b).games_played, 1);

    // A timed-out run never happened for the scoreboard.
    enter(&s, &a, dungeon_id);
    enter(&s, &b, dungeon_id);
    warp(&s.env, SESSION_TIMEOUT + 1);
    s.client.timeout_session(&2);
    assert_eq!(s.client.get_agent_stats(&a).games_played, 1);

    // A failed run does count.
    enter(&s, &a, dungeon_id);
    enter(&s, &b, dungeon_id);
    let dm = accept_current_dm(&s, 3);
    let player = s.client.get_session(&3).party.get_unchecked(0);
    act(&s, 3, &player);
    respond(&s, 3, &dm, vec![&s.env, fail_now(&s.env)]);
    assert_eq!(s.client.get_agent_stats(&a).games_played, 2);
    assert_eq!(s.client.get_agent_stats(&b).games_played, 2);

    let session = s.client.get_session(&3);
    assert_eq!(session.state, SessionState::Failed);
}
