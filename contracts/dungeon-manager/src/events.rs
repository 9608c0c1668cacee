//! Observable transition log.
//!
//! One event per externally visible state transition. The off-chain runner
//! and dashboards reconstruct session history from these alone, so every
//! terminal transition and every scheduler move must emit.

use soroban_sdk::{contractevent, Address, BytesN, String, Vec};

// ─── Identity & access ─────────────────────────────────────────────────────

#[contractevent]
pub struct AgentRegistered {
    pub agent: Address,
}

#[contractevent]
pub struct AgentUnregistered {
    pub agent: Address,
}

#[contractevent]
pub struct RunnerUpdated {
    pub runner: Address,
}

// ─── Epoch controller ──────────────────────────────────────────────────────

#[contractevent]
pub struct EpochEnded {
    pub epoch: u32,
    pub grace_start: u64,
}

#[contractevent]
pub struct EpochStarted {
    pub epoch: u32,
    pub skill_hash: BytesN<32>,
    pub dm_fee_pct: u32,
}

// ─── Skill registry ────────────────────────────────────────────────────────

#[contractevent]
pub struct SkillAdded {
    pub skill_id: u32,
    pub name: String,
}

#[contractevent]
pub struct SkillUpdated {
    pub skill_id: u32,
}

#[contractevent]
pub struct SkillRemoved {
    pub skill_id: u32,
}

// ─── Dungeon registry ──────────────────────────────────────────────────────

#[contractevent]
pub struct DungeonActivated {
    pub dungeon_id: u32,
    pub asset_id: u32,
    pub owner: Address,
}

#[contractevent]
pub struct DungeonDeactivated {
    pub dungeon_id: u32,
    pub asset_id: u32,
    pub owner: Address,
}

/// Both counters are reported: `loot_pool` is native value from forfeited
/// bonds, `loot_gold` is reward-token value from forfeited session gold.
#[contractevent]
pub struct LootPoolUpdated {
    pub dungeon_id: u32,
    pub loot_pool: i128,
    pub loot_gold: i128,
}

// ─── Session lifecycle ─────────────────────────────────────────────────────

#[contractevent]
pub struct PlayerEntered {
    pub session_id: u32,
    pub dungeon_id: u32,
    pub agent: Address,
    pub bond: i128,
}

#[contractevent]
pub struct DmSelected {
    pub session_id: u32,
    pub dm: Address,
    pub dm_epoch: u32,
}

#[contractevent]
pub struct DmAccepted {
    pub session_id: u32,
    pub dm: Address,
}

#[contractevent]
pub struct DmRerolled {
    pub session_id: u32,
    pub old_dm: Address,
    pub new_dm: Option<Address>,
    pub dm_epoch: u32,
}

#[contractevent]
pub struct GameStarted {
    pub session_id: u32,
    pub dungeon_id: u32,
    pub dm: Address,
    pub party: Vec<Address>,
}

#[contractevent]
pub struct ActionSubmitted {
    pub session_id: u32,
    pub agent: Address,
    pub turn: u32,
    pub text: String,
}

#[contractevent]
pub struct DmResponse {
    pub session_id: u32,
    pub turn: u32,
    pub narrative: String,
}

#[contractevent]
pub struct TurnAdvanced {
    pub session_id: u32,
    pub turn: u32,
    pub next_actor: Address,
}

#[contractevent]
pub struct TurnTimeout {
    pub session_id: u32,
    pub turn: u32,
    pub skipped: Address,
}

#[contractevent]
pub struct SessionTimedOut {
    pub session_id: u32,
}

#[contractevent]
pub struct SessionCancelled {
    pub session_id: u32,
}

// ─── Rewards & terminal settlement ─────────────────────────────────────────

#[contractevent]
pub struct GoldAwarded {
    pub session_id: u32,
    pub target: Address,
    pub amount: i128,
    pub gold_pool: i128,
}

#[contractevent]
pub struct XpAwarded {
    pub session_id: u32,
    pub target: Address,
    pub amount: u64,
}

#[contractevent]
pub struct PlayerDied {
    pub session_id: u32,
    pub agent: Address,
    pub gold_forfeit: i128,
}

#[contractevent]
pub struct PlayerFled {
    pub session_id: u32,
    pub agent: Address,
    pub gold_kept: i128,
    pub royalty: i128,
}

#[contractevent]
pub struct DungeonCompleted {
    pub session_id: u32,
    pub total_minted: i128,
    pub royalty: i128,
    pub recap: String,
}

#[contractevent]
pub struct DungeonFailed {
    pub session_id: u32,
    pub gold_forfeit: i128,
    pub recap: String,
}

// ─── Bond escrow ───────────────────────────────────────────────────────────

#[contractevent]
pub struct BondForfeited {
    pub session_id: u32,
    pub participant: Address,
    pub amount: i128,
}

#[contractevent]
pub struct BondWithdrawn {
    pub participant: Address,
    pub amount: i128,
}

#[contractevent]
pub struct RoyaltyClaimed {
    pub owner: Address,
    pub amount: i128,
}

// ─── Administration ────────────────────────────────────────────────────────

#[contractevent]
pub struct MaxGoldPerSessionUpdated {
    pub max_gold: i128,
}
