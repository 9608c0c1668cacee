#![no_std]

//! Dungeon Manager - session lifecycle and escrow core
//!
//! Holds entry bonds, assembles 2-6 player parties plus a randomly selected
//! Dungeon Master, enforces turn order with replay protection, and settles
//! rewards through an external token minter. The reward-token ledger, the
//! dungeon-asset ledger and the ticket ledger are separate contracts; this
//! core only holds capability addresses into each.

use soroban_sdk::xdr::ToXdr;
use soroban_sdk::{
    contract, contractclient, contracterror, contractimpl, contracttype, token, Address, Bytes,
    BytesN, Env, String, Vec,
};


#[cfg(test)]
mod accounting_test;

mod events;
use events::*;

// ============================================================================
// External Collaborator Interfaces
// ============================================================================

/// Reward-token ledger. The core mints on completion, flee and royalty claim;
/// it never burns and never holds a balance of its own.
#[contractclient(name = "GoldMinterClient")]
pub trait GoldMinter {
    fn mint(env: Env, to: Address, amount: i128);

    fn balance_of(env: Env, holder: Address) -> i128;
}

/// Non-fungible dungeon-identity ledger. Assets are transferred into custody
/// while staked; traits drive party size and the session gold cap.
#[contractclient(name = "DungeonAssetClient")]
pub trait DungeonAssetRegistry {
    fn transfer_from(env: Env, from: Address, to: Address, asset_id: u32);

    fn get_traits(env: Env, asset_id: u32) -> DungeonTraits;
}

/// Consumable entry-ticket ledger. One ticket is burned per dungeon entry.
#[contractclient(name = "TicketClient")]
pub trait TicketRegistry {
    fn balance_of(env: Env, holder: Address, ticket_kind: u32) -> i128;

    fn burn_one(env: Env, holder: Address, amount: i128);
}

// ============================================================================
// Errors
// ============================================================================

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Error {
    NotRegistered = 1,
    NotDungeonOwner = 2,
    NotDm = 3,
    NotPartyMember = 4,
    SessionNotFound = 10,
    SessionNotActive = 11,
    SessionNotWaitingDm = 12,
    NotYourTurn = 13,
    WrongTurn = 14,
    NoActionThisTurn = 15,
    StaleDmEpoch = 16,
    AcceptDeadlinePassed = 17,
    DeadlineNotPassed = 18,
    SessionNotTimedOut = 19,
    PlayerNotAlive = 20,
    AlreadyInParty = 21,
    PartyFull = 22,
    EpochNotActive = 30,
    EpochNotGrace = 31,
    GracePeriodActive = 32,
    ContractPaused = 33,
    DungeonNotFound = 34,
    DungeonNotActive = 35,
    DungeonHasLiveSession = 36,
    SkillNotFound = 37,
    InsufficientBond = 40,
    InsufficientTickets = 41,
    GoldCapExceeded = 42,
    XpCapExceeded = 43,
    ActionTooLong = 44,
    NarrativeTooLong = 45,
    SkillTooLong = 46,
    InvalidTraits = 47,
    InvalidTarget = 48,
    InvalidDmFee = 49,
    InsufficientLootPool = 50,
    NothingToWithdraw = 51,
}

// ============================================================================
// Data Types
// ============================================================================

#[contracttype]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SessionState {
    Waiting = 0,
    WaitingDm = 1,
    Active = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
    TimedOut = 6,
}

#[contracttype]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum EpochState {
    Active = 0,
    Grace = 1,
}

#[contracttype]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum DmActionKind {
    Narrate = 0,
    RewardGold = 1,
    RewardXp = 2,
    Damage = 3,
    KillPlayer = 4,
    Complete = 5,
    Fail = 6,
}

/// One entry of a DM response. `target` is ignored by NARRATE / COMPLETE /
/// FAIL; `value` is ignored by everything except the two reward kinds.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DmAction {
    pub kind: DmActionKind,
    pub target: Option<Address>,
    pub value: i128,
    pub narrative: String,
}

/// Traits read from the dungeon-asset ledger. `difficulty` must be in
/// [1, 10] and `party_size` in [2, 6]; anything else fails staking.
#[contracttype]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DungeonTraits {
    pub difficulty: u32,
    pub party_size: u32,
    pub theme: u32,
    pub rarity: u32,
}

// Session storage is split by write frequency:
// - SessionCore: roster and caps, written only during party assembly.
// - SessionRuntime: scheduler and pools, written on every turn.
// Readers get the merged `Session` view.

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionCore {
    pub session_id: u32,
    pub dungeon_id: u32,
    /// Game epoch the session was created in; completion settles under this
    /// epoch's fee snapshot even if the global epoch has moved on.
    pub epoch_id: u32,
    pub party_size: u32,
    pub max_gold: i128,
    /// Everyone who paid entry, in entry order. The player later elevated to
    /// DM keeps their original slot; `acted_this_turn` bits index into this.
    pub all_players: Vec<Address>,
    pub created_at: u64,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionRuntime {
    pub state: SessionState,
    pub dm: Option<Address>,
    /// Non-DM players in entry order; populated on DM selection.
    pub party: Vec<Address>,
    pub turn_number: u32,
    pub current_actor: Option<Address>,
    pub turn_deadline: u64,
    pub gold_pool: i128,
    /// Bit i set when `all_players[i]` has acted in the current turn.
    pub acted_this_turn: u32,
    pub dm_accept_deadline: u64,
    pub last_activity_ts: u64,
    /// Monotonic DM-selection counter; acceptance must quote it, so an
    /// accept racing a reroll is rejected as stale.
    pub dm_epoch: u32,
}

/// Merged read-only view of a session.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub session_id: u32,
    pub dungeon_id: u32,
    pub epoch_id: u32,
    pub party_size: u32,
    pub max_gold: i128,
    pub all_players: Vec<Address>,
    pub state: SessionState,
    pub dm: Option<Address>,
    pub party: Vec<Address>,
    pub turn_number: u32,
    pub current_actor: Option<Address>,
    pub turn_deadline: u64,
    pub gold_pool: i128,
    pub acted_this_turn: u32,
    pub dm_accept_deadline: u64,
    pub last_activity_ts: u64,
    pub dm_epoch: u32,
}

/// A staked dungeon slot. Hosts at most one live session at a time.
///
/// The two loot counters are deliberately separate: `loot_pool` is native
/// value from forfeited bonds, `loot_gold` is reward-token value from
/// forfeited session gold. `award_from_loot_pool` draws from `loot_gold`.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dungeon {
    pub asset_id: u32,
    pub owner: Address,
    pub active: bool,
    pub loot_pool: i128,
    pub loot_gold: i128,
    /// 0 = never hosted; session ids are 1-based.
    pub current_session_id: u32,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Skill {
    pub name: String,
    pub content: Bytes,
    pub updated_at: u64,
    /// Close of the grace edit window the content was written in. The edit
    /// rule itself is the Grace gate; this is bookkeeping for readers.
    pub locked_until: u64,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentStats {
    pub registered: bool,
    pub xp: u64,
    pub total_gold_earned: i128,
    /// Sessions the agent paid into that reached Completed or Failed.
    pub games_played: u32,
}

#[contracttype]
#[derive(Clone)]
enum DataKey {
    Admin,
    Runner,
    Paused,
    NativeToken,
    GoldToken,
    DungeonNft,
    Tickets,
    CurrentEpoch,
    EpochState,
    GraceStart,
    DmFeePct,
    MaxGoldPerSession,
    SessionCount,
    ActiveSessionCount,
    DungeonCount,
    SkillCount,
    EpochSkillHash(u32),
    EpochDmFee(u32),
    Agent(Address),
    Skill(u32),
    Dungeon(u32),
    SessionCore(u32),
    SessionRuntime(u32),
    Bond(u32, Address),
    SessionGold(u32, Address),
    Alive(u32, Address),
    ActionSubmitted(u32, u32),
    Withdrawable(Address),
    Royalties(Address),
}

// ============================================================================
// Constants
// ============================================================================

/// 0.01 native units at 18 decimals.
pub const ENTRY_BOND: i128 = 10_000_000_000_000_000;
pub const DM_ACCEPT_TIMEOUT: u64 = 300;
pub const TURN_TIMEOUT: u64 = 300;
pub const SESSION_TIMEOUT: u64 = 14_400;
/// After this much grace, the owner may start an epoch over live sessions.
pub const MAX_GRACE_PERIOD: u64 = 172_800;
pub const MAX_ACTION_LENGTH: u32 = 1_000;
pub const MAX_NARRATIVE_LENGTH: u32 = 2_000;
pub const MAX_SKILL_LENGTH: u32 = 50_000;
pub const MAX_GOLD_PER_ACTION: i128 = 100;
pub const MAX_XP_PER_ACTION: u64 = 50;
/// Session gold cap is difficulty x this, clamped by `max_gold_per_session`.
pub const BASE_GOLD_RATE: i128 = 100;
pub const ROYALTY_BPS: i128 = 500;
const BPS_DENOM: i128 = 10_000;
pub const DEFAULT_DM_FEE_PCT: u32 = 15;
pub const DEFAULT_MAX_GOLD_PER_SESSION: i128 = 500;

const MIN_DIFFICULTY: u32 = 1;
const MAX_DIFFICULTY: u32 = 10;
const MIN_PARTY_SIZE: u32 = 2;
const MAX_PARTY_SIZE: u32 = 6;
// DM fee + 5% royalty must never exceed the pool.
const MAX_DM_FEE_PCT: u32 = 95;

// ============================================================================
// Contract Implementation
// ============================================================================

#[contract]
pub struct DungeonManager;

#[contractimpl]
impl DungeonManager {
    /// The engine starts in Grace so the owner can stake dungeons and upload
    /// skills before the first Active epoch.
    pub fn __constructor(
        env: Env,
        admin: Address,
        runner: Address,
        native_token: Address,
        gold_token: Address,
        dungeon_nft: Address,
        tickets: Address,
    ) {
        let storage = env.storage().instance();
        storage.set(&DataKey::Admin, &admin);
        storage.set(&DataKey::Runner, &runner);
        storage.set(&DataKey::NativeToken, &native_token);
        storage.set(&DataKey::GoldToken, &gold_token);
        storage.set(&DataKey::DungeonNft, &dungeon_nft);
        storage.set(&DataKey::Tickets, &tickets);
        storage.set(&DataKey::Paused, &false);
        storage.set(&DataKey::CurrentEpoch, &0u32);
        storage.set(&DataKey::EpochState, &EpochState::Grace);
        storage.set(&DataKey::GraceStart, &env.ledger().timestamp());
        storage.set(&DataKey::DmFeePct, &DEFAULT_DM_FEE_PCT);
        storage.set(&DataKey::MaxGoldPerSession, &DEFAULT_MAX_GOLD_PER_SESSION);
        storage.set(&DataKey::SessionCount, &0u32);
        storage.set(&DataKey::ActiveSessionCount, &0u32);
        storage.set(&DataKey::DungeonCount, &0u32);
        storage.set(&DataKey::SkillCount, &0u32);
    }

    // ------------------------------------------------------------------
    // Identity & access
    // ------------------------------------------------------------------

    pub fn register_agent(env: Env, agent: Address) {
        Self::require_admin(&env);
        let mut stats = Self::load_stats(&env, &agent);
        stats.registered = true;
        Self::store_stats(&env, &agent, &stats);
        AgentRegistered { agent }.publish(&env);
    }

    pub fn unregister_agent(env: Env, agent: Address) {
        Self::require_admin(&env);
        let mut stats = Self::load_stats(&env, &agent);
        stats.registered = false;
        Self::store_stats(&env, &agent, &stats);
        AgentUnregistered { agent }.publish(&env);
    }

    pub fn set_runner(env: Env, new_runner: Address) {
        Self::require_admin(&env);
        env.storage().instance().set(&DataKey::Runner, &new_runner);
        RunnerUpdated { runner: new_runner }.publish(&env);
    }

    pub fn pause(env: Env) {
        Self::require_admin(&env);
        env.storage().instance().set(&DataKey::Paused, &true);
    }

    pub fn unpause(env: Env) {
        Self::require_admin(&env);
        env.storage().instance().set(&DataKey::Paused, &false);
    }

    pub fn set_max_gold_per_session(env: Env, max_gold: i128) {
        Self::require_admin(&env);
        env.storage().instance().set(&DataKey::MaxGoldPerSession, &max_gold);
        MaxGoldPerSessionUpdated { max_gold }.publish(&env);
    }

    /// Takes effect at the next `start_epoch`; running sessions keep the fee
    /// snapshotted for their creation epoch.
    pub fn set_dm_fee_pct(env: Env, pct: u32) -> Result<(), Error> {
        Self::require_admin(&env);
        if pct > MAX_DM_FEE_PCT {
            return Err(Error::InvalidDmFee);
        }
        env.storage().instance().set(&DataKey::DmFeePct, &pct);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Epoch controller
    // ------------------------------------------------------------------

    pub fn end_epoch(env: Env) -> Result<(), Error> {
        Self::require_admin(&env);
        if Self::epoch_state_raw(&env) != EpochState::Active {
            return Err(Error::EpochNotActive);
        }
        let now = env.ledger().timestamp();
        env.storage().instance().set(&DataKey::EpochState, &EpochState::Grace);
        env.storage().instance().set(&DataKey::GraceStart, &now);
        EpochEnded { epoch: Self::read_u32(&env, DataKey::CurrentEpoch), grace_start: now }
            .publish(&env);
        Ok(())
    }

    /// Pins the skill hash and DM fee for the new epoch. Blocked while live
    /// sessions exist, unless the grace period has run its full 48h.
    pub fn start_epoch(env: Env) -> Result<(), Error> {
        Self::require_admin(&env);
        if Self::epoch_state_raw(&env) != EpochState::Grace {
            return Err(Error::EpochNotGrace);
        }
        let now = env.ledger().timestamp();
        let live = Self::read_u32(&env, DataKey::ActiveSessionCount);
        let grace_start: u64 = env.storage().instance().get(&DataKey::GraceStart).unwrap();
        if live > 0 && now <= grace_start + MAX_GRACE_PERIOD {
            return Err(Error::GracePeriodActive);
        }

        let epoch = Self::read_u32(&env, DataKey::CurrentEpoch) + 1;
        let skill_hash = Self::compute_skill_hash(&env);
        let dm_fee_pct: u32 = env.storage().instance().get(&DataKey::DmFeePct).unwrap();
        env.storage().instance().set(&DataKey::CurrentEpoch, &epoch);
        env.storage().instance().set(&DataKey::EpochState, &EpochState::Active);
        env.storage()
            .persistent()
            .set(&DataKey::EpochSkillHash(epoch), &skill_hash);
        env.storage().persistent().set(&DataKey::EpochDmFee(epoch), &dm_fee_pct);
        EpochStarted { epoch, skill_hash, dm_fee_pct }.publish(&env);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Skill registry
    // ------------------------------------------------------------------

    /// Skills may be appended at any time; in-place edits and removals are
    /// restricted to Grace so running sessions see a frozen rule set.
    pub fn add_skill(env: Env, name: String, content: Bytes) -> Result<u32, Error> {
        Self::require_admin(&env);
        if content.len() > MAX_SKILL_LENGTH {
            return Err(Error::SkillTooLong);
        }
        let skill_id = Self::read_u32(&env, DataKey::SkillCount);
        env.storage().instance().set(&DataKey::SkillCount, &(skill_id + 1));
        let skill = Skill {
            name: name.clone(),
            content,
            updated_at: env.ledger().timestamp(),
            locked_until: Self::edit_window_close(&env),
        };
        env.storage().persistent().set(&DataKey::Skill(skill_id), &skill);
        SkillAdded { skill_id, name }.publish(&env);
        Ok(skill_id)
    }

    pub fn update_skill(env: Env, skill_id: u32, content: Bytes) -> Result<(), Error> {
        Self::require_admin(&env);
        if Self::epoch_state_raw(&env) != EpochState::Grace {
            return Err(Error::EpochNotGrace);
        }
        if content.len() > MAX_SKILL_LENGTH {
            return Err(Error::SkillTooLong);
        }
        let mut skill: Skill = env
            .storage()
            .persistent()
            .get(&DataKey::Skill(skill_id))
            .ok_or(Error::SkillNotFound)?;
        skill.content = content;
        skill.updated_at = env.ledger().timestamp();
        skill.locked_until = Self::edit_window_close(&env);
        env.storage().persistent().set(&DataKey::Skill(skill_id), &skill);
        SkillUpdated { skill_id }.publish(&env);
        Ok(())
    }

    /// Removed ids become gaps; the epoch hash concatenates the survivors in
    /// append order.
    pub fn remove_skill(env: Env, skill_id: u32) -> Result<(), Error> {
        Self::require_admin(&env);
        if Self::epoch_state_raw(&env) != EpochState::Grace {
            return Err(Error::EpochNotGrace);
        }
        if !env.storage().persistent().has(&DataKey::Skill(skill_id)) {
            return Err(Error::SkillNotFound);
        }
        env.storage().persistent().remove(&DataKey::Skill(skill_id));
        SkillRemoved { skill_id }.publish(&env);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dungeon registry
    // ------------------------------------------------------------------

    /// Transfers the dungeon asset into custody and opens a session slot.
    /// Grace-only: the set of stakeable dungeons is frozen while an epoch
    /// is running.
    pub fn stake_dungeon(env: Env, owner: Address, asset_id: u32) -> Result<u32, Error> {
        owner.require_auth();
        Self::require_not_paused(&env)?;
        if Self::epoch_state_raw(&env) != EpochState::Grace {
            return Err(Error::EpochNotGrace);
        }

        let nft = DungeonAssetClient::new(&env, &Self::read_address(&env, DataKey::DungeonNft));
        let traits = nft.get_traits(&asset_id);
        if traits.difficulty < MIN_DIFFICULTY
            || traits.difficulty > MAX_DIFFICULTY
            || traits.party_size < MIN_PARTY_SIZE
            || traits.party_size > MAX_PARTY_SIZE
        {
            return Err(Error::InvalidTraits);
        }

        let dungeon_id = Self::read_u32(&env, DataKey::DungeonCount);
        env.storage().instance().set(&DataKey::DungeonCount, &(dungeon_id + 1));
        let dungeon = Dungeon {
            asset_id,
            owner: owner.clone(),
            active: true,
            loot_pool: 0,
            loot_gold: 0,
            current_session_id: 0,
        };
        Self::store_dungeon(&env, dungeon_id, &dungeon);

        nft.transfer_from(&owner, &env.current_contract_address(), &asset_id);
        DungeonActivated { dungeon_id, asset_id, owner }.publish(&env);
        Ok(dungeon_id)
    }

    pub fn unstake_dungeon(env: Env, owner: Address, dungeon_id: u32) -> Result<(), Error> {
        owner.require_auth();
        if Self::epoch_state_raw(&env) != EpochState::Grace {
            return Err(Error::EpochNotGrace);
        }
        let mut dungeon = Self::load_dungeon(&env, dungeon_id)?;
        if owner != dungeon.owner {
            return Err(Error::NotDungeonOwner);
        }
        if !dungeon.active {
            return Err(Error::DungeonNotActive);
        }
        if dungeon.current_session_id != 0 {
            let rt = Self::load_runtime(&env, dungeon.current_session_id)?;
            if !Self::is_terminal(rt.state) {
                return Err(Error::DungeonHasLiveSession);
            }
        }

        dungeon.active = false;
        Self::store_dungeon(&env, dungeon_id, &dungeon);

        let nft = DungeonAssetClient::new(&env, &Self::read_address(&env, DataKey::DungeonNft));
        nft.transfer_from(&env.current_contract_address(), &owner, &dungeon.asset_id);
        DungeonDeactivated { dungeon_id, asset_id: dungeon.asset_id, owner }.publish(&env);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session entry & DM selection
    // ------------------------------------------------------------------

    /// Pay the entry bond and burn one ticket to join (or open) the dungeon's
    /// waiting session. When the party fills, DM selection fires in the same
    /// invocation.
    pub fn enter_dungeon(
        env: Env,
        agent: Address,
        dungeon_id: u32,
        bond: i128,
    ) -> Result<u32, Error> {
        agent.require_auth();
        Self::require_not_paused(&env)?;
        if !Self::load_stats(&env, &agent).registered {
            return Err(Error::NotRegistered);
        }
        if Self::epoch_state_raw(&env) != EpochState::Active {
            return Err(Error::EpochNotActive);
        }
        if bond < ENTRY_BOND {
            return Err(Error::InsufficientBond);
        }
        let mut dungeon = Self::load_dungeon(&env, dungeon_id)?;
        if !dungeon.active {
            return Err(Error::DungeonNotActive);
        }
        let tickets = TicketClient::new(&env, &Self::read_address(&env, DataKey::Tickets));
        if tickets.balance_of(&agent, &0u32) < 1 {
            return Err(Error::InsufficientTickets);
        }

        let now = env.ledger().timestamp();
        let (session_id, mut core, mut rt) = match Self::joinable_session(&env, &dungeon)? {
            Some((core, rt)) => {
                if core.all_players.contains(&agent) {
                    return Err(Error::AlreadyInParty);
                }
                if core.all_players.len() >= core.party_size {
                    return Err(Error::PartyFull);
                }
                (core.session_id, core, rt)
            }
            None => {
                let nft =
                    DungeonAssetClient::new(&env, &Self::read_address(&env, DataKey::DungeonNft));
                let traits = nft.get_traits(&dungeon.asset_id);
                let cap: i128 =
                    env.storage().instance().get(&DataKey::MaxGoldPerSession).unwrap();
                let max_gold = (traits.difficulty as i128 * BASE_GOLD_RATE).min(cap);

                let session_id = Self::read_u32(&env, DataKey::SessionCount) + 1;
                env.storage().instance().set(&DataKey::SessionCount, &session_id);
                Self::bump_active_sessions(&env, 1);
                dungeon.current_session_id = session_id;
                Self::store_dungeon(&env, dungeon_id, &dungeon);

                let core = SessionCore {
                    session_id,
                    dungeon_id,
                    epoch_id: Self::read_u32(&env, DataKey::CurrentEpoch),
                    party_size: traits.party_size,
                    max_gold,
                    all_players: Vec::new(&env),
                    created_at: now,
                };
                let rt = SessionRuntime {
                    state: SessionState::Waiting,
                    dm: None,
                    party: Vec::new(&env),
                    turn_number: 0,
                    current_actor: None,
                    turn_deadline: 0,
                    gold_pool: 0,
                    acted_this_turn: 0,
                    dm_accept_deadline: 0,
                    last_activity_ts: now,
                    dm_epoch: 0,
                };
                (session_id, core, rt)
            }
        };

        core.all_players.push_back(agent.clone());
        env.storage().persistent().set(&DataKey::Bond(session_id, agent.clone()), &bond);
        env.storage().persistent().set(&DataKey::Alive(session_id, agent.clone()), &true);
        rt.last_activity_ts = now;

        tickets.burn_one(&agent, &1i128);
        Self::native_token(&env).transfer(&agent, &env.current_contract_address(), &bond);
        PlayerEntered { session_id, dungeon_id, agent, bond }.publish(&env);

        if core.all_players.len() == core.party_size {
            Self::select_dm(&env, &core, &mut rt);
        }
        Self::store_core(&env, session_id, &core);
        Self::store_runtime(&env, session_id, &rt);
        Ok(session_id)
    }

    /// Runner-relayed DM acceptance. The quoted `dm_epoch` is the stale-accept
    /// guard: an accept racing a reroll is rejected.
    pub fn accept_dm(
        env: Env,
        session_id: u32,
        claimed_dm_epoch: u32,
        dm: Address,
    ) -> Result<(), Error> {
        Self::require_runner(&env);
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::WaitingDm {
            return Err(Error::SessionNotWaitingDm);
        }
        if rt.dm != Some(dm.clone()) {
            return Err(Error::NotDm);
        }
        if claimed_dm_epoch != rt.dm_epoch {
            return Err(Error::StaleDmEpoch);
        }
        let now = env.ledger().timestamp();
        if now > rt.dm_accept_deadline {
            return Err(Error::AcceptDeadlinePassed);
        }

        rt.state = SessionState::Active;
        rt.turn_number = 1;
        rt.acted_this_turn = 0;
        rt.last_activity_ts = now;
        // Players act first each turn.
        let first = rt.party.get_unchecked(0);
        rt.current_actor = Some(first);
        rt.turn_deadline = now + TURN_TIMEOUT;
        Self::store_runtime(&env, session_id, &rt);

        DmAccepted { session_id, dm: dm.clone() }.publish(&env);
        GameStarted {
            session_id,
            dungeon_id: core.dungeon_id,
            dm,
            party: rt.party.clone(),
        }
        .publish(&env);
        Ok(())
    }

    /// Permissionless sweep once the acceptance deadline is strictly past.
    /// The delinquent DM forfeits their bond to the dungeon's loot pool and
    /// leaves the roster; a new DM is drawn, or the session cancels when
    /// fewer than two entrants remain.
    pub fn reroll_dm(env: Env, session_id: u32) -> Result<(), Error> {
        let mut core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::WaitingDm {
            return Err(Error::SessionNotWaitingDm);
        }
        if env.ledger().timestamp() <= rt.dm_accept_deadline {
            return Err(Error::DeadlineNotPassed);
        }

        let old_dm = rt.dm.clone().unwrap();
        let mut dungeon = Self::load_dungeon(&env, core.dungeon_id)?;
        Self::forfeit_bond(&env, session_id, &old_dm, &mut dungeon);
        Self::store_dungeon(&env, core.dungeon_id, &dungeon);
        LootPoolUpdated {
            dungeon_id: core.dungeon_id,
            loot_pool: dungeon.loot_pool,
            loot_gold: dungeon.loot_gold,
        }
        .publish(&env);

        let idx = core.all_players.first_index_of(&old_dm).unwrap();
        core.all_players.remove(idx);
        env.storage().persistent().remove(&DataKey::Alive(session_id, old_dm.clone()));

        if core.all_players.len() >= 2 {
            Self::select_dm(&env, &core, &mut rt);
            DmRerolled {
                session_id,
                old_dm,
                new_dm: rt.dm.clone(),
                dm_epoch: rt.dm_epoch,
            }
            .publish(&env);
        } else {
            rt.state = SessionState::Cancelled;
            rt.dm = None;
            rt.current_actor = None;
            Self::bump_active_sessions(&env, -1);
            for p in core.all_players.iter() {
                Self::release_bond(&env, session_id, &p);
            }
            DmRerolled { session_id, old_dm, new_dm: None, dm_epoch: rt.dm_epoch }.publish(&env);
            SessionCancelled { session_id }.publish(&env);
        }
        Self::store_core(&env, session_id, &core);
        Self::store_runtime(&env, session_id, &rt);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gameplay: actions, responses, flee
    // ------------------------------------------------------------------

    /// Runner-relayed player action. `turn_index` must quote the session's
    /// current turn; a `(session, turn, player)` triple can act at most once.
    pub fn submit_action(
        env: Env,
        session_id: u32,
        turn_index: u32,
        text: String,
        player: Address,
    ) -> Result<(), Error> {
        Self::require_runner(&env);
        Self::require_not_paused(&env)?;
        if text.len() > MAX_ACTION_LENGTH {
            return Err(Error::ActionTooLong);
        }
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::Active {
            return Err(Error::SessionNotActive);
        }
        if rt.current_actor != Some(player.clone()) {
            return Err(Error::NotYourTurn);
        }
        if !Self::alive_of(&env, session_id, &player) {
            return Err(Error::PlayerNotAlive);
        }
        if turn_index != rt.turn_number {
            return Err(Error::WrongTurn);
        }

        env.storage()
            .persistent()
            .set(&DataKey::ActionSubmitted(session_id, turn_index), &true);
        let pos = Self::position_of(&core, &player);
        rt.acted_this_turn |= 1 << pos;
        rt.last_activity_ts = env.ledger().timestamp();
        ActionSubmitted { session_id, agent: player.clone(), turn: turn_index, text }
            .publish(&env);
        Self::advance_after_player(&env, &core, &mut rt, &player);
        Self::store_runtime(&env, session_id, &rt);
        Ok(())
    }

    /// Runner-relayed DM narration plus a batch of game effects. Requires at
    /// least one player action this turn, so the DM cannot respond into a
    /// vacuum. Stray COMPLETE/FAIL entries on a resolved session are no-ops.
    pub fn submit_dm_response(
        env: Env,
        session_id: u32,
        turn_index: u32,
        narrative: String,
        actions: Vec<DmAction>,
        dm: Address,
    ) -> Result<(), Error> {
        Self::require_runner(&env);
        Self::require_not_paused(&env)?;
        if narrative.len() > MAX_NARRATIVE_LENGTH {
            return Err(Error::NarrativeTooLong);
        }
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::Active {
            return Err(Error::SessionNotActive);
        }
        if rt.dm != Some(dm.clone()) {
            return Err(Error::NotDm);
        }
        if rt.current_actor != Some(dm.clone()) {
            return Err(Error::NotYourTurn);
        }
        if turn_index != rt.turn_number {
            return Err(Error::WrongTurn);
        }
        if !Self::action_submitted_flag(&env, session_id, turn_index) {
            return Err(Error::NoActionThisTurn);
        }

        DmResponse { session_id, turn: turn_index, narrative }.publish(&env);

        let mut dungeon = Self::load_dungeon(&env, core.dungeon_id)?;
        for action in actions.iter() {
            Self::apply_dm_action(&env, &core, &mut rt, &mut dungeon, &action)?;
        }

        if rt.state == SessionState::Active {
            rt.turn_number += 1;
            rt.acted_this_turn = 0;
            Self::advance_new_turn(&env, &core, &mut rt);
        }
        rt.last_activity_ts = env.ledger().timestamp();
        Self::store_dungeon(&env, core.dungeon_id, &dungeon);
        Self::store_runtime(&env, session_id, &rt);
        Ok(())
    }

    /// Runner-relayed early exit. The agent keeps 95% of their accrued gold
    /// (minted immediately), the dungeon owner books the 5% royalty, and the
    /// bond is released. The agent counts as dead for the rest of the run.
    pub fn flee(env: Env, session_id: u32, agent: Address) -> Result<(), Error> {
        Self::require_runner(&env);
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::Active {
            return Err(Error::SessionNotActive);
        }
        if !rt.party.contains(&agent) {
            return Err(Error::NotPartyMember);
        }
        if !Self::alive_of(&env, session_id, &agent) {
            return Err(Error::PlayerNotAlive);
        }

        env.storage().persistent().set(&DataKey::Alive(session_id, agent.clone()), &false);
        let gold = Self::gold_of(&env, session_id, &agent);
        Self::set_gold(&env, session_id, &agent, 0);
        let royalty = gold * ROYALTY_BPS / BPS_DENOM;
        let kept = gold - royalty;

        let mut dungeon = Self::load_dungeon(&env, core.dungeon_id)?;
        if royalty > 0 {
            Self::credit_royalty(&env, &dungeon.owner, royalty);
        }
        Self::release_bond(&env, session_id, &agent);
        if kept > 0 {
            let mut stats = Self::load_stats(&env, &agent);
            stats.total_gold_earned += kept;
            Self::store_stats(&env, &agent, &stats);
            let minter = GoldMinterClient::new(&env, &Self::read_address(&env, DataKey::GoldToken));
            minter.mint(&agent, &kept);
        }
        PlayerFled { session_id, agent: agent.clone(), gold_kept: kept, royalty }.publish(&env);

        rt.last_activity_ts = env.ledger().timestamp();
        if Self::count_living_party(&env, session_id, &rt) == 0 {
            Self::fail_session(
                &env,
                &core,
                &mut rt,
                &mut dungeon,
                String::from_str(&env, "The last adventurer fled the dungeon"),
            );
        } else if rt.current_actor == Some(agent.clone()) {
            let pos = Self::position_of(&core, &agent);
            rt.acted_this_turn |= 1 << pos;
            Self::advance_after_player(&env, &core, &mut rt, &agent);
        }
        Self::store_dungeon(&env, core.dungeon_id, &dungeon);
        Self::store_runtime(&env, session_id, &rt);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Permissionless once the turn deadline is strictly past. A delinquent
    /// party member is skipped (their turn bit is burned); a delinquent DM
    /// fails the whole session.
    pub fn timeout_advance(env: Env, session_id: u32) -> Result<(), Error> {
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::Active {
            return Err(Error::SessionNotActive);
        }
        if env.ledger().timestamp() <= rt.turn_deadline {
            return Err(Error::DeadlineNotPassed);
        }

        let actor = rt.current_actor.clone().unwrap();
        TurnTimeout { session_id, turn: rt.turn_number, skipped: actor.clone() }.publish(&env);
        if rt.dm == Some(actor.clone()) {
            let mut dungeon = Self::load_dungeon(&env, core.dungeon_id)?;
            Self::fail_session(
                &env,
                &core,
                &mut rt,
                &mut dungeon,
                String::from_str(&env, "DM abandoned the dungeon"),
            );
            Self::store_dungeon(&env, core.dungeon_id, &dungeon);
        } else {
            let pos = Self::position_of(&core, &actor);
            rt.acted_this_turn |= 1 << pos;
            rt.last_activity_ts = env.ledger().timestamp();
            Self::advance_after_player(&env, &core, &mut rt, &actor);
        }
        Self::store_runtime(&env, session_id, &rt);
        Ok(())
    }

    /// Permissionless sweep for sessions idle past the 4h cutoff. Nobody is
    /// at fault, so every held bond is released rather than forfeited.
    pub fn timeout_session(env: Env, session_id: u32) -> Result<(), Error> {
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::WaitingDm && rt.state != SessionState::Active {
            return Err(Error::SessionNotActive);
        }
        if env.ledger().timestamp() <= rt.last_activity_ts + SESSION_TIMEOUT {
            return Err(Error::SessionNotTimedOut);
        }

        rt.state = SessionState::TimedOut;
        rt.current_actor = None;
        Self::bump_active_sessions(&env, -1);
        for p in core.all_players.iter() {
            Self::release_bond(&env, session_id, &p);
        }
        Self::store_runtime(&env, session_id, &rt);
        SessionTimedOut { session_id }.publish(&env);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loot pool, escrow & royalties
    // ------------------------------------------------------------------

    /// The DM of an Active session may move previously forfeited gold from
    /// the dungeon's loot pool into a living party member's tab, under the
    /// same caps as a direct reward.
    pub fn award_from_loot_pool(
        env: Env,
        session_id: u32,
        dm: Address,
        target: Address,
        amount: i128,
    ) -> Result<(), Error> {
        dm.require_auth();
        let core = Self::load_core(&env, session_id)?;
        let mut rt = Self::load_runtime(&env, session_id)?;
        if rt.state != SessionState::Active {
            return Err(Error::SessionNotActive);
        }
        if rt.dm != Some(dm) {
            return Err(Error::NotDm);
        }
        if !rt.party.contains(&target) {
            return Err(Error::NotPartyMember);
        }
        if !Self::alive_of(&env, session_id, &target) {
            return Err(Error::PlayerNotAlive);
        }
        if amount <= 0 || amount > MAX_GOLD_PER_ACTION {
            return Err(Error::GoldCapExceeded);
        }
        if rt.gold_pool + amount > core.max_gold {
            return Err(Error::GoldCapExceeded);
        }
        let mut dungeon = Self::load_dungeon(&env, core.dungeon_id)?;
        if dungeon.loot_gold < amount {
            return Err(Error::InsufficientLootPool);
        }

        dungeon.loot_gold -= amount;
        rt.gold_pool += amount;
        Self::add_gold(&env, session_id, &target, amount);
        rt.last_activity_ts = env.ledger().timestamp();
        Self::store_dungeon(&env, core.dungeon_id, &dungeon);
        Self::store_runtime(&env, session_id, &rt);
        GoldAwarded { session_id, target, amount, gold_pool: rt.gold_pool }.publish(&env);
        LootPoolUpdated {
            dungeon_id: core.dungeon_id,
            loot_pool: dungeon.loot_pool,
            loot_gold: dungeon.loot_gold,
        }
        .publish(&env);
        Ok(())
    }

    /// Pull-payment withdrawal of released bonds. Available under pause.
    pub fn withdraw_bond(env: Env, caller: Address) -> Result<(), Error> {
        caller.require_auth();
        let key = DataKey::Withdrawable(caller.clone());
        let amount: i128 = env.storage().persistent().get(&key).unwrap_or(0);
        if amount == 0 {
            return Err(Error::NothingToWithdraw);
        }
        env.storage().persistent().remove(&key);
        Self::native_token(&env).transfer(&env.current_contract_address(), &caller, &amount);
        BondWithdrawn { participant: caller, amount }.publish(&env);
        Ok(())
    }

    /// Mints the caller's accrued royalty IOU. Available under pause.
    pub fn claim_royalties(env: Env, caller: Address) -> Result<(), Error> {
        caller.require_auth();
        let key = DataKey::Royalties(caller.clone());
        let amount: i128 = env.storage().persistent().get(&key).unwrap_or(0);
        if amount == 0 {
            return Err(Error::NothingToWithdraw);
        }
        env.storage().persistent().remove(&key);
        let minter = GoldMinterClient::new(&env, &Self::read_address(&env, DataKey::GoldToken));
        minter.mint(&caller, &amount);
        RoyaltyClaimed { owner: caller, amount }.publish(&env);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn get_session(env: Env, session_id: u32) -> Result<Session, Error> {
        let core = Self::load_core(&env, session_id)?;
        let rt = Self::load_runtime(&env, session_id)?;
        Ok(Session {
            session_id: core.session_id,
            dungeon_id: core.dungeon_id,
            epoch_id: core.epoch_id,
            party_size: core.party_size,
            max_gold: core.max_gold,
            all_players: core.all_players,
            state: rt.state,
            dm: rt.dm,
            party: rt.party,
            turn_number: rt.turn_number,
            current_actor: rt.current_actor,
            turn_deadline: rt.turn_deadline,
            gold_pool: rt.gold_pool,
            acted_this_turn: rt.acted_this_turn,
            dm_accept_deadline: rt.dm_accept_deadline,
            last_activity_ts: rt.last_activity_ts,
            dm_epoch: rt.dm_epoch,
        })
    }

    pub fn get_session_party(env: Env, session_id: u32) -> Result<Vec<Address>, Error> {
        Ok(Self::load_runtime(&env, session_id)?.party)
    }

    pub fn get_dungeon(env: Env, dungeon_id: u32) -> Result<Dungeon, Error> {
        Self::load_dungeon(&env, dungeon_id)
    }

    pub fn get_agent_stats(env: Env, agent: Address) -> AgentStats {
        Self::load_stats(&env, &agent)
    }

    pub fn is_registered(env: Env, agent: Address) -> bool {
        Self::load_stats(&env, &agent).registered
    }

    pub fn get_skill(env: Env, skill_id: u32) -> Result<Skill, Error> {
        env.storage()
            .persistent()
            .get(&DataKey::Skill(skill_id))
            .ok_or(Error::SkillNotFound)
    }

    pub fn skill_count(env: Env) -> u32 {
        Self::read_u32(&env, DataKey::SkillCount)
    }

    pub fn session_count(env: Env) -> u32 {
        Self::read_u32(&env, DataKey::SessionCount)
    }

    pub fn active_session_count(env: Env) -> u32 {
        Self::read_u32(&env, DataKey::ActiveSessionCount)
    }

    pub fn dungeon_count(env: Env) -> u32 {
        Self::read_u32(&env, DataKey::DungeonCount)
    }

    pub fn current_epoch(env: Env) -> u32 {
        Self::read_u32(&env, DataKey::CurrentEpoch)
    }

    pub fn epoch_state(env: Env) -> EpochState {
        Self::epoch_state_raw(&env)
    }

    pub fn grace_start_time(env: Env) -> u64 {
        env.storage().instance().get(&DataKey::GraceStart).unwrap()
    }

    pub fn epoch_skill_hash(env: Env, epoch: u32) -> Option<BytesN<32>> {
        env.storage().persistent().get(&DataKey::EpochSkillHash(epoch))
    }

    pub fn epoch_dm_fee(env: Env, epoch: u32) -> Option<u32> {
        env.storage().persistent().get(&DataKey::EpochDmFee(epoch))
    }

    pub fn withdrawable_bond(env: Env, participant: Address) -> i128 {
        env.storage()
            .persistent()
            .get(&DataKey::Withdrawable(participant))
            .unwrap_or(0)
    }

    pub fn pending_royalties(env: Env, owner: Address) -> i128 {
        env.storage().persistent().get(&DataKey::Royalties(owner)).unwrap_or(0)
    }

    pub fn bond_of(env: Env, session_id: u32, participant: Address) -> i128 {
        env.storage()
            .persistent()
            .get(&DataKey::Bond(session_id, participant))
            .unwrap_or(0)
    }

    pub fn session_gold(env: Env, session_id: u32, participant: Address) -> i128 {
        Self::gold_of(&env, session_id, &participant)
    }

    pub fn is_alive(env: Env, session_id: u32, participant: Address) -> bool {
        Self::alive_of(&env, session_id, &participant)
    }

    pub fn action_submitted(env: Env, session_id: u32, turn: u32) -> bool {
        Self::action_submitted_flag(&env, session_id, turn)
    }

    pub fn get_admin(env: Env) -> Address {
        Self::read_address(&env, DataKey::Admin)
    }

    pub fn get_runner(env: Env) -> Address {
        Self::read_address(&env, DataKey::Runner)
    }

    pub fn is_paused(env: Env) -> bool {
        env.storage().instance().get(&DataKey::Paused).unwrap()
    }

    pub fn max_gold_per_session(env: Env) -> i128 {
        env.storage().instance().get(&DataKey::MaxGoldPerSession).unwrap()
    }

    pub fn dm_fee_pct(env: Env) -> u32 {
        env.storage().instance().get(&DataKey::DmFeePct).unwrap()
    }

    // ------------------------------------------------------------------
    // Internals: DM selection & turn scheduler
    // ------------------------------------------------------------------

    /// Environmental seed: ledger timestamp and sequence mixed with the
    /// session id and roster. Adversary-influenceable; each entrant's bond
    /// makes manipulation costly, and the DM role referees rather than
    /// holding unbounded authority.
    fn dm_selection_index(env: &Env, session_id: u32, players: &Vec<Address>) -> u32 {
        let mut seed = Bytes::new(env);
        seed.append(&Bytes::from_array(env, &env.ledger().timestamp().to_be_bytes()));
        seed.append(&Bytes::from_array(env, &env.ledger().sequence().to_be_bytes()));
        seed.append(&Bytes::from_array(env, &session_id.to_be_bytes()));
        for p in players.iter() {
            seed.append(&p.to_xdr(env));
        }
        let digest: BytesN<32> = env.crypto().keccak256(&seed).into();
        let d = digest.to_array();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&d[0..8]);
        (u64::from_be_bytes(raw) % players.len() as u64) as u32
    }

    fn select_dm(env: &Env, core: &SessionCore, rt: &mut SessionRuntime) {
        let idx = Self::dm_selection_index(env, core.session_id, &core.all_players);
        let dm = core.all_players.get_unchecked(idx);
        let mut party = Vec::new(env);
        for p in core.all_players.iter() {
            if p != dm {
                party.push_back(p);
            }
        }
        let now = env.ledger().timestamp();
        rt.dm = Some(dm.clone());
        rt.party = party;
        rt.dm_epoch += 1;
        rt.dm_accept_deadline = now + DM_ACCEPT_TIMEOUT;
        rt.state = SessionState::WaitingDm;
        rt.acted_this_turn = 0;
        rt.last_activity_ts = now;
        DmSelected { session_id: core.session_id, dm, dm_epoch: rt.dm_epoch }.publish(env);
    }

    fn position_of(core: &SessionCore, who: &Address) -> u32 {
        core.all_players.first_index_of(who).unwrap()
    }

    fn has_acted(rt: &SessionRuntime, pos: u32) -> bool {
        rt.acted_this_turn & (1 << pos) != 0
    }

    /// Scan `party` from `start` (wrapping) for the first living member whose
    /// turn bit is clear; fall back to the DM when every member has acted.
    fn next_party_actor(
        env: &Env,
        core: &SessionCore,
        rt: &SessionRuntime,
        start: u32,
    ) -> Option<Address> {
        let n = rt.party.len();
        for k in 0..n {
            let p = rt.party.get_unchecked((start + k) % n);
            let pos = Self::position_of(core, &p);
            if Self::alive_of(env, core.session_id, &p) && !Self::has_acted(rt, pos) {
                return Some(p);
            }
        }
        None
    }

    fn set_current_actor(env: &Env, core: &SessionCore, rt: &mut SessionRuntime, actor: Address) {
        rt.current_actor = Some(actor.clone());
        rt.turn_deadline = env.ledger().timestamp() + TURN_TIMEOUT;
        TurnAdvanced { session_id: core.session_id, turn: rt.turn_number, next_actor: actor }
            .publish(env);
    }

    fn advance_after_player(
        env: &Env,
        core: &SessionCore,
        rt: &mut SessionRuntime,
        just_acted: &Address,
    ) {
        let start = rt.party.first_index_of(just_acted).unwrap() + 1;
        let next = match Self::next_party_actor(env, core, rt, start % rt.party.len()) {
            Some(p) => p,
            None => rt.dm.clone().unwrap(),
        };
        Self::set_current_actor(env, core, rt, next);
    }

    fn advance_new_turn(env: &Env, core: &SessionCore, rt: &mut SessionRuntime) {
        // A turn opening with the DM is only reachable with an empty party.
        let next = match Self::next_party_actor(env, core, rt, 0) {
            Some(p) => p,
            None => rt.dm.clone().unwrap(),
        };
        Self::set_current_actor(env, core, rt, next);
    }

    // ------------------------------------------------------------------
    // Internals: DM-action dispatch
    // ------------------------------------------------------------------

    fn apply_dm_action(
        env: &Env,
        core: &SessionCore,
        rt: &mut SessionRuntime,
        dungeon: &mut Dungeon,
        action: &DmAction,
    ) -> Result<(), Error> {
        match action.kind {
            DmActionKind::Complete => {
                Self::complete_session(env, core, rt, dungeon, action.narrative.clone());
                return Ok(());
            }
            DmActionKind::Fail => {
                Self::fail_session(env, core, rt, dungeon, action.narrative.clone());
                return Ok(());
            }
            _ => {}
        }
        // A terminal earlier in the same batch resolves the session; any
        // trailing game effects are tolerated as no-ops.
        if rt.state != SessionState::Active {
            return Ok(());
        }

        match action.kind {
            DmActionKind::Narrate | DmActionKind::Damage => Ok(()),
            DmActionKind::RewardGold => {
                let target = action.target.clone().ok_or(Error::InvalidTarget)?;
                if !Self::alive_of(env, core.session_id, &target) {
                    return Err(Error::PlayerNotAlive);
                }
                if action.value <= 0 || action.value > MAX_GOLD_PER_ACTION {
                    return Err(Error::GoldCapExceeded);
                }
                if rt.gold_pool + action.value > core.max_gold {
                    return Err(Error::GoldCapExceeded);
                }
                rt.gold_pool += action.value;
                Self::add_gold(env, core.session_id, &target, action.value);
                GoldAwarded {
                    session_id: core.session_id,
                    target,
                    amount: action.value,
                    gold_pool: rt.gold_pool,
                }
                .publish(env);
                Ok(())
            }
            DmActionKind::RewardXp => {
                let target = action.target.clone().ok_or(Error::InvalidTarget)?;
                if !Self::alive_of(env, core.session_id, &target) {
                    return Err(Error::PlayerNotAlive);
                }
                if action.value <= 0 || action.value > MAX_XP_PER_ACTION as i128 {
                    return Err(Error::XpCapExceeded);
                }
                let amount = action.value as u64;
                let mut stats = Self::load_stats(env, &target);
                stats.xp += amount;
                Self::store_stats(env, &target, &stats);
                XpAwarded { session_id: core.session_id, target, amount }.publish(env);
                Ok(())
            }
            DmActionKind::KillPlayer => {
                let target = action.target.clone().ok_or(Error::InvalidTarget)?;
                if rt.dm == Some(target.clone()) {
                    return Err(Error::InvalidTarget);
                }
                if !Self::alive_of(env, core.session_id, &target) {
                    return Err(Error::PlayerNotAlive);
                }
                env.storage()
                    .persistent()
                    .set(&DataKey::Alive(core.session_id, target.clone()), &false);
                let lost = Self::gold_of(env, core.session_id, &target);
                Self::set_gold(env, core.session_id, &target, 0);
                dungeon.loot_gold += lost;
                PlayerDied { session_id: core.session_id, agent: target, gold_forfeit: lost }
                    .publish(env);
                LootPoolUpdated {
                    dungeon_id: core.dungeon_id,
                    loot_pool: dungeon.loot_pool,
                    loot_gold: dungeon.loot_gold,
                }
                .publish(env);
                if Self::count_living_party(env, core.session_id, rt) == 0 {
                    Self::fail_session(
                        env,
                        core,
                        rt,
                        dungeon,
                        String::from_str(env, "The whole party has fallen"),
                    );
                }
                Ok(())
            }
            DmActionKind::Complete | DmActionKind::Fail => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Internals: terminal settlement
    // ------------------------------------------------------------------

    /// Splits the gold pool into DM fee, dungeon-owner royalty and the
    /// players' share (pro-rata by accrued session gold among living party
    /// members; integer division, dust retained). Idempotent: a repeat on a
    /// resolved session is a silent no-op.
    fn complete_session(
        env: &Env,
        core: &SessionCore,
        rt: &mut SessionRuntime,
        dungeon: &mut Dungeon,
        recap: String,
    ) {
        if rt.state != SessionState::Active && rt.state != SessionState::WaitingDm {
            return;
        }
        rt.state = SessionState::Completed;
        rt.current_actor = None;
        Self::bump_active_sessions(env, -1);

        let pool = rt.gold_pool;
        let fee_pct: u32 = env
            .storage()
            .persistent()
            .get(&DataKey::EpochDmFee(core.epoch_id))
            .unwrap_or(DEFAULT_DM_FEE_PCT);
        let dm_fee = pool * fee_pct as i128 / 100;
        let royalty = pool * ROYALTY_BPS / BPS_DENOM;
        let players_share = pool - dm_fee - royalty;

        if royalty > 0 {
            Self::credit_royalty(env, &dungeon.owner, royalty);
        }

        let mut living_gold: i128 = 0;
        for p in rt.party.iter() {
            if Self::alive_of(env, core.session_id, &p) {
                living_gold += Self::gold_of(env, core.session_id, &p);
            }
        }

        let minter = GoldMinterClient::new(env, &Self::read_address(env, DataKey::GoldToken));
        let mut total_minted: i128 = 0;
        let dm = rt.dm.clone().unwrap();
        if dm_fee > 0 {
            let mut stats = Self::load_stats(env, &dm);
            stats.total_gold_earned += dm_fee;
            Self::store_stats(env, &dm, &stats);
            minter.mint(&dm, &dm_fee);
            total_minted += dm_fee;
        }
        if living_gold > 0 && players_share > 0 {
            for p in rt.party.iter() {
                if !Self::alive_of(env, core.session_id, &p) {
                    continue;
                }
                let share = players_share * Self::gold_of(env, core.session_id, &p) / living_gold;
                if share > 0 {
                    let mut stats = Self::load_stats(env, &p);
                    stats.total_gold_earned += share;
                    Self::store_stats(env, &p, &stats);
                    minter.mint(&p, &share);
                    total_minted += share;
                }
            }
        }

        for p in core.all_players.iter() {
            Self::release_bond(env, core.session_id, &p);
            let mut stats = Self::load_stats(env, &p);
            stats.games_played += 1;
            Self::store_stats(env, &p, &stats);
        }
        DungeonCompleted { session_id: core.session_id, total_minted, royalty, recap }
            .publish(env);
    }

    /// Forfeits every held bond to the dungeon's native loot pool and every
    /// party member's accrued gold to its token loot pool. Idempotent like
    /// `complete_session`.
    fn fail_session(
        env: &Env,
        core: &SessionCore,
        rt: &mut SessionRuntime,
        dungeon: &mut Dungeon,
        recap: String,
    ) {
        if rt.state != SessionState::Active && rt.state != SessionState::WaitingDm {
            return;
        }
        rt.state = SessionState::Failed;
        rt.current_actor = None;
        Self::bump_active_sessions(env, -1);

        let mut gold_forfeit: i128 = 0;
        for p in rt.party.iter() {
            let gold = Self::gold_of(env, core.session_id, &p);
            if gold > 0 {
                Self::set_gold(env, core.session_id, &p, 0);
                gold_forfeit += gold;
            }
        }
        dungeon.loot_gold += gold_forfeit;

        for p in core.all_players.iter() {
            Self::forfeit_bond(env, core.session_id, &p, dungeon);
            let mut stats = Self::load_stats(env, &p);
            stats.games_played += 1;
            Self::store_stats(env, &p, &stats);
        }
        LootPoolUpdated {
            dungeon_id: core.dungeon_id,
            loot_pool: dungeon.loot_pool,
            loot_gold: dungeon.loot_gold,
        }
        .publish(env);
        DungeonFailed { session_id: core.session_id, gold_forfeit, recap }.publish(env);
    }

    // ------------------------------------------------------------------
    // Internals: escrow
    // ------------------------------------------------------------------

    fn release_bond(env: &Env, session_id: u32, participant: &Address) {
        let key = DataKey::Bond(session_id, participant.clone());
        let amount: i128 = env.storage().persistent().get(&key).unwrap_or(0);
        if amount == 0 {
            return;
        }
        env.storage().persistent().remove(&key);
        let wkey = DataKey::Withdrawable(participant.clone());
        let held: i128 = env.storage().persistent().get(&wkey).unwrap_or(0);
        env.storage().persistent().set(&wkey, &(held + amount));
    }

    fn forfeit_bond(env: &Env, session_id: u32, participant: &Address, dungeon: &mut Dungeon) {
        let key = DataKey::Bond(session_id, participant.clone());
        let amount: i128 = env.storage().persistent().get(&key).unwrap_or(0);
        if amount == 0 {
            return;
        }
        env.storage().persistent().remove(&key);
        dungeon.loot_pool += amount;
        BondForfeited { session_id, participant: participant.clone(), amount }.publish(env);
    }

    fn credit_royalty(env: &Env, owner: &Address, amount: i128) {
        let key = DataKey::Royalties(owner.clone());
        let held: i128 = env.storage().persistent().get(&key).unwrap_or(0);
        env.storage().persistent().set(&key, &(held + amount));
    }

    // ------------------------------------------------------------------
    // Internals: storage helpers
    // ------------------------------------------------------------------

    fn require_admin(env: &Env) {
        let admin: Address = env.storage().instance().get(&DataKey::Admin).unwrap();
        admin.require_auth();
    }

    fn require_runner(env: &Env) {
        let runner: Address = env.storage().instance().get(&DataKey::Runner).unwrap();
        runner.require_auth();
    }

    fn require_not_paused(env: &Env) -> Result<(), Error> {
        let paused: bool = env.storage().instance().get(&DataKey::Paused).unwrap();
        if paused {
            return Err(Error::ContractPaused);
        }
        Ok(())
    }

    fn epoch_state_raw(env: &Env) -> EpochState {
        env.storage().instance().get(&DataKey::EpochState).unwrap()
    }

    /// Close of the current grace edit window, for `Skill.locked_until`.
    fn edit_window_close(env: &Env) -> u64 {
        match Self::epoch_state_raw(env) {
            EpochState::Grace => {
                let grace_start: u64 = env.storage().instance().get(&DataKey::GraceStart).unwrap();
                grace_start + MAX_GRACE_PERIOD
            }
            EpochState::Active => env.ledger().timestamp(),
        }
    }

    /// Concatenation of all surviving skill contents in append order.
    fn compute_skill_hash(env: &Env) -> BytesN<32> {
        let count = Self::read_u32(env, DataKey::SkillCount);
        let mut blob = Bytes::new(env);
        for id in 0..count {
            let skill: Option<Skill> = env.storage().persistent().get(&DataKey::Skill(id));
            if let Some(skill) = skill {
                blob.append(&skill.content);
            }
        }
        env.crypto().keccak256(&blob).into()
    }

    /// The dungeon's current session, when it is still assembling a party.
    fn joinable_session(
        env: &Env,
        dungeon: &Dungeon,
    ) -> Result<Option<(SessionCore, SessionRuntime)>, Error> {
        if dungeon.current_session_id == 0 {
            return Ok(None);
        }
        let rt = Self::load_runtime(env, dungeon.current_session_id)?;
        match rt.state {
            SessionState::Waiting => {
                let core = Self::load_core(env, dungeon.current_session_id)?;
                Ok(Some((core, rt)))
            }
            // The slot is occupied by a running session.
            SessionState::WaitingDm | SessionState::Active => Err(Error::PartyFull),
            _ => Ok(None),
        }
    }

    fn count_living_party(env: &Env, session_id: u32, rt: &SessionRuntime) -> u32 {
        let mut living = 0;
        for p in rt.party.iter() {
            if Self::alive_of(env, session_id, &p) {
                living += 1;
            }
        }
        living
    }

    fn is_terminal(state: SessionState) -> bool {
        matches!(
            state,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Cancelled
                | SessionState::TimedOut
        )
    }

    fn bump_active_sessions(env: &Env, delta: i32) {
        let count = Self::read_u32(env, DataKey::ActiveSessionCount);
        let next = if delta >= 0 {
            count + delta as u32
        } else {
            count.saturating_sub((-delta) as u32)
        };
        env.storage().instance().set(&DataKey::ActiveSessionCount, &next);
    }

    fn native_token(env: &Env) -> token::TokenClient<'_> {
        token::TokenClient::new(env, &Self::read_address(env, DataKey::NativeToken))
    }

    fn read_address(env: &Env, key: DataKey) -> Address {
        env.storage().instance().get(&key).unwrap()
    }

    fn read_u32(env: &Env, key: DataKey) -> u32 {
        env.storage().instance().get(&key).unwrap()
    }

    fn load_stats(env: &Env, agent: &Address) -> AgentStats {
        env.storage()
            .persistent()
            .get(&DataKey::Agent(agent.clone()))
            .unwrap_or(AgentStats {
                registered: false,
                xp: 0,
                total_gold_earned: 0,
                games_played: 0,
            })
    }

    fn store_stats(env: &Env, agent: &Address, stats: &AgentStats) {
        env.storage().persistent().set(&DataKey::Agent(agent.clone()), stats);
    }

    fn load_dungeon(env: &Env, dungeon_id: u32) -> Result<Dungeon, Error> {
        env.storage()
            .persistent()
            .get(&DataKey::Dungeon(dungeon_id))
            .ok_or(Error::DungeonNotFound)
    }

    fn store_dungeon(env: &Env, dungeon_id: u32, dungeon: &Dungeon) {
        env.storage().persistent().set(&DataKey::Dungeon(dungeon_id), dungeon);
    }

    fn load_core(env: &Env, session_id: u32) -> Result<SessionCore, Error> {
        env.storage()
            .persistent()
            .get(&DataKey::SessionCore(session_id))
            .ok_or(Error::SessionNotFound)
    }

    fn store_core(env: &Env, session_id: u32, core: &SessionCore) {
        env.storage().persistent().set(&DataKey::SessionCore(session_id), core);
    }

    fn load_runtime(env: &Env, session_id: u32) -> Result<SessionRuntime, Error> {
        env.storage()
            .persistent()
            .get(&DataKey::SessionRuntime(session_id))
            .ok_or(Error::SessionNotFound)
    }

    fn store_runtime(env: &Env, session_id: u32, rt: &SessionRuntime) {
        env.storage().persistent().set(&DataKey::SessionRuntime(session_id), rt);
    }

    fn alive_of(env: &Env, session_id: u32, participant: &Address) -> bool {
        env.storage()
            .persistent()
            .get(&DataKey::Alive(session_id, participant.clone()))
            .unwrap_or(false)
    }

    fn gold_of(env: &Env, session_id: u32, participant: &Address) -> i128 {
        env.storage()
            .persistent()
            .get(&DataKey::SessionGold(session_id, participant.clone()))
            .unwrap_or(0)
    }

    fn set_gold(env: &Env, session_id: u32, participant: &Address, amount: i128) {
        env.storage()
            .persistent()
            .set(&DataKey::SessionGold(session_id, participant.clone()), &amount);
    }

    fn add_gold(env: &Env, session_id: u32, participant: &Address, amount: i128) {
        let held = Self::gold_of(env, session_id, participant);
        Self::set_gold(env, session_id, participant, held + amount);
    }

    fn action_submitted_flag(env: &Env, session_id: u32, turn: u32) -> bool {
        env.storage()
            .persistent()
            .get(&DataKey::ActionSubmitted(session_id, turn))
            .unwrap_or(false)
    }
}
