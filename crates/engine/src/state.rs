//! Consensus engine state machine.

use crate::vote_set::{AddVote, VoteSet};
use concord_core::{Action, ConsensusConfig, NodeError, TimeoutStep, TimerId};
use concord_messages::{ConsensusPayload, PeerMessage};
use concord_types::{
    Block, BlockBody, BlockHeader, Commit, CommitVote, Hash, KeyPair, Proposal, Transaction,
    TransactionList, ValidatorSet, Vote, VoteType,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// Where the engine is within the current `(height, round)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    /// Waiting for sync/executor gates and the pacing interval.
    NewHeight,
    /// Waiting for a proposal.
    Propose,
    /// Prevoted; collecting prevotes.
    Prevote,
    /// Precommitted; collecting precommits.
    Precommit,
    /// Commit issued; waiting for the store write to land.
    Commit,
}

/// Own votes loaded from storage at startup.
///
/// A restarted validator must never sign a conflicting vote for a slot it
/// already voted in; recovered values override fresh decisions.
#[derive(Debug, Default, Clone)]
pub struct RecoveredVotes {
    votes: HashMap<(u64, u32, VoteType), Option<Hash>>,
}

impl RecoveredVotes {
    pub fn insert(&mut self, height: u64, round: u32, step: VoteType, value: Option<Hash>) {
        self.votes.insert((height, round, step), value);
    }

    fn get(&self, height: u64, round: u32, step: VoteType) -> Option<Option<Hash>> {
        self.votes.get(&(height, round, step)).copied()
    }
}

/// BFT consensus state machine.
///
/// Runs one height at a time; on commit it advances the height and resets
/// the round to 0. All I/O is delegated to the runner via actions.
pub struct EngineState {
    config: ConsensusConfig,
    key: KeyPair,

    // ── Height context ───────────────────────────────────────────────────
    /// Height being decided: store tip + 1.
    height: u64,
    round: u32,
    step: Step,
    /// Set voting at this height.
    validators: ValidatorSet,
    /// Set that voted on the parent (validates proposal `last_commit`s).
    parent_voting_set: ValidatorSet,
    /// Our index in `validators`; `None` for observer nodes.
    our_index: Option<u32>,
    parent_hash: Hash,
    parent_timestamp: u64,
    /// Certificate proving the parent; embedded in our proposals.
    parent_commit: Commit,
    /// App state after executing the parent.
    app_state_hash: Hash,
    executed_height: u64,

    // ── Round state ──────────────────────────────────────────────────────
    /// Verified proposals by round.
    proposals: HashMap<u32, Proposal>,
    /// Proposed blocks by hash, across rounds.
    blocks: HashMap<Hash, Arc<Block>>,
    prevotes: BTreeMap<u32, VoteSet>,
    precommits: BTreeMap<u32, VoteSet>,
    /// Rounds whose prevote-convergence timeout is armed.
    prevote_timer_armed: HashSet<u32>,
    /// The safety lock: `(round, block)` we precommitted.
    locked: Option<(u32, Arc<Block>)>,

    // ── In-flight delegated work ─────────────────────────────────────────
    pending_votes: HashSet<(u32, u32, VoteType)>,
    pending_proposals: HashSet<u32>,
    awaiting_selection: Option<u32>,
    /// Block hash handed to `CommitBlock`, until the store confirms.
    committing: Option<Hash>,

    // ── Records ──────────────────────────────────────────────────────────
    /// Conflicting vote pairs, retained for the slashing layer.
    equivocations: Vec<(Vote, Vote)>,
    recovered: RecoveredVotes,
    voted_this_height: bool,

    // ── Gates ────────────────────────────────────────────────────────────
    started: bool,
    sync_idle: bool,
    height_begun: bool,

    now: Duration,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("height", &self.height)
            .field("round", &self.round)
            .field("step", &self.step)
            .field("our_index", &self.our_index)
            .field("locked", &self.locked.as_ref().map(|(r, b)| (*r, b.hash())))
            .finish_non_exhaustive()
    }
}

impl EngineState {
    /// Create an engine resuming from the committed tip.
    pub fn new(
        config: ConsensusConfig,
        key: KeyPair,
        tip: &Block,
        parent_commit: Commit,
        executed_height: u64,
        app_state_hash: Hash,
        recovered: RecoveredVotes,
    ) -> Self {
        let validators = tip.body.next_validator_set.clone();
        let our_index = validators.index_of(&key.public_key());
        Self {
            config,
            key,
            height: tip.header.height + 1,
            round: 0,
            step: Step::NewHeight,
            parent_voting_set: validators.clone(),
            validators,
            our_index,
            parent_hash: tip.hash(),
            parent_timestamp: tip.header.timestamp,
            parent_commit,
            app_state_hash,
            executed_height,
            proposals: HashMap::new(),
            blocks: HashMap::new(),
            prevotes: BTreeMap::new(),
            precommits: BTreeMap::new(),
            prevote_timer_armed: HashSet::new(),
            locked: None,
            pending_votes: HashSet::new(),
            pending_proposals: HashSet::new(),
            awaiting_selection: None,
            committing: None,
            equivocations: Vec::new(),
            recovered,
            voted_this_height: false,
            started: false,
            sync_idle: true,
            height_begun: false,
            now: Duration::ZERO,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn is_validator(&self) -> bool {
        self.our_index.is_some()
    }

    pub fn locked_round(&self) -> Option<u32> {
        self.locked.as_ref().map(|(r, _)| *r)
    }

    /// Conflicting vote pairs observed so far.
    pub fn equivocations(&self) -> &[(Vote, Vote)] {
        &self.equivocations
    }

    /// True once we have signed any vote at the current height. The
    /// synchronizer is gated off the store while this holds.
    pub fn has_voted_current_height(&self) -> bool {
        self.voted_this_height
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    /// Begin consensus. Returns the initial pacing timer once the gates
    /// (sync idle, parent executed) allow.
    pub fn start(&mut self) -> Vec<Action> {
        self.started = true;
        self.try_begin_height()
    }

    /// Synchronizer idleness, maintained by the coordinator.
    pub fn set_sync_idle(&mut self, idle: bool) -> Vec<Action> {
        self.sync_idle = idle;
        if idle {
            self.try_begin_height()
        } else {
            vec![]
        }
    }

    // ── Height lifecycle ─────────────────────────────────────────────────

    /// Arm the height's pacing timer once every gate is open.
    fn try_begin_height(&mut self) -> Vec<Action> {
        if !self.started
            || self.height_begun
            || !self.sync_idle
            || self.executed_height + 1 != self.height
        {
            return vec![];
        }
        self.height_begun = true;
        debug!(height = self.height, "Beginning height");
        vec![Action::SetTimer {
            id: TimerId::Consensus {
                height: self.height,
                round: 0,
                step: TimeoutStep::NewHeight,
            },
            duration: self.config.block_interval,
        }]
    }

    fn enter_round(&mut self, round: u32) -> Vec<Action> {
        self.round = round;
        self.step = Step::Propose;
        self.awaiting_selection = None;

        let proposer = self.validators.proposer_index(self.height, round);
        info!(
            height = self.height,
            round,
            proposer,
            we_propose = self.our_index == Some(proposer),
            "Entering round"
        );

        let mut actions = vec![Action::SetTimer {
            id: TimerId::Consensus {
                height: self.height,
                round,
                step: TimeoutStep::Propose,
            },
            duration: self.config.propose_timeout_at(round),
        }];

        if self.our_index == Some(proposer) {
            if let Some((locked_round, block)) = self.locked.clone() {
                // A locked proposer must re-propose its locked block.
                actions.extend(self.propose_block(block, Some(locked_round)));
            } else {
                self.awaiting_selection = Some(round);
                actions.push(Action::SelectTransactions {
                    height: self.height,
                    round,
                    // Filled in by the coordinator from the pool.
                    candidates: vec![],
                    max: self.config.max_block_transactions,
                });
            }
        } else if let Some(proposal) = self.proposals.get(&round).cloned() {
            // A verified proposal for this round arrived early.
            actions.extend(self.decide_prevote(&proposal));
        }

        actions
    }

    // ── Timeouts ─────────────────────────────────────────────────────────

    pub fn on_timeout(&mut self, height: u64, round: u32, step: TimeoutStep) -> Vec<Action> {
        if height != self.height {
            return vec![];
        }
        match step {
            TimeoutStep::NewHeight if self.step == Step::NewHeight && round == 0 => {
                if !self.sync_idle {
                    // Sync became active while the pacing timer ran; the
                    // height re-arms once we have caught up.
                    self.height_begun = false;
                    return vec![];
                }
                self.enter_round(0)
            }
            TimeoutStep::Propose if round == self.round && self.step == Step::Propose => {
                debug!(height, round, "Propose timeout, prevoting nil");
                self.do_vote(VoteType::Prevote, None)
            }
            TimeoutStep::Prevote if round == self.round && self.step == Step::Prevote => {
                debug!(height, round, "Prevote timeout, precommitting nil");
                self.do_vote(VoteType::Precommit, None)
            }
            TimeoutStep::Precommit if round == self.round && self.step == Step::Precommit => {
                debug!(height, round, "Precommit timeout, starting next round");
                self.enter_round(round + 1)
            }
            _ => vec![],
        }
    }

    // ── Proposals ────────────────────────────────────────────────────────

    /// A proposal arrived from the network.
    #[instrument(skip(self, proposal), fields(
        height = proposal.height,
        round = proposal.round,
        proposer = proposal.validator_index
    ))]
    pub fn on_proposal(&mut self, proposal: Box<Proposal>) -> Vec<Action> {
        if proposal.height != self.height {
            trace!(
                height = proposal.height,
                current = self.height,
                "Proposal outside current height dropped"
            );
            return vec![];
        }

        let expected = self.validators.proposer_index(self.height, proposal.round);
        if proposal.validator_index != expected {
            return vec![Action::EmitError {
                error: NodeError::InvalidProposal {
                    reason: format!(
                        "wrong proposer {} for round {} (expected {})",
                        proposal.validator_index, proposal.round, expected
                    ),
                },
            }];
        }

        if self.proposals.contains_key(&proposal.round)
            || !self.pending_proposals.insert(proposal.round)
        {
            return vec![];
        }

        let public_key = match self.validators.get(expected) {
            Some(entry) => entry.public_key,
            None => return vec![],
        };
        vec![Action::VerifyProposalSignature {
            proposal,
            public_key,
        }]
    }

    /// Callback: proposal signature checked.
    pub fn on_proposal_verified(&mut self, proposal: Box<Proposal>, valid: bool) -> Vec<Action> {
        self.pending_proposals.remove(&proposal.round);
        if proposal.height != self.height {
            return vec![];
        }

        if !valid {
            return vec![Action::EmitError {
                error: NodeError::InvalidProposal {
                    reason: "bad proposal signature".into(),
                },
            }];
        }

        if let Err(reason) = self.validate_proposal_block(&proposal) {
            warn!(
                height = self.height,
                round = proposal.round,
                %reason,
                "Invalid proposal"
            );
            let mut actions = vec![Action::EmitError {
                error: NodeError::InvalidProposal { reason },
            }];
            // An invalid proposal from the legitimate proposer settles the
            // round for us: prevote nil rather than waiting out the timer.
            if proposal.round == self.round && self.step == Step::Propose {
                actions.extend(self.do_vote(VoteType::Prevote, None));
            }
            return actions;
        }

        let block = Arc::new(proposal.block.clone());
        let hash = block.hash();
        debug!(
            height = self.height,
            round = proposal.round,
            block = %hash,
            txs = block.body.transactions.len(),
            "Proposal accepted"
        );
        self.blocks.insert(hash, block);
        self.proposals.insert(proposal.round, (*proposal).clone());

        let mut actions = vec![];
        if proposal.round == self.round && self.step == Step::Propose {
            actions.extend(self.decide_prevote(&proposal));
        }
        // A late proposal can complete a precommit quorum that was waiting
        // for its block.
        actions.extend(self.try_commit_any_round());
        actions
    }

    /// Structural and chain validation of a proposal's block.
    fn validate_proposal_block(&self, proposal: &Proposal) -> Result<(), String> {
        let block = &proposal.block;
        if block.header.height != self.height {
            return Err(format!(
                "block height {} does not match consensus height {}",
                block.header.height, self.height
            ));
        }
        block.verify_internal().map_err(|e| e.to_string())?;
        if block.header.last_block_hash != self.parent_hash {
            return Err("block does not extend the committed tip".into());
        }
        if block.header.timestamp < self.parent_timestamp {
            return Err("block timestamp regresses".into());
        }
        if block.body.next_validator_set.hash() != self.validators.hash() {
            return Err("unexpected validator set".into());
        }
        if block.header.app_state_hash != self.app_state_hash {
            return Err("app state hash does not match executed state".into());
        }
        block
            .body
            .last_commit
            .verify(self.parent_hash, self.height - 1, &self.parent_voting_set)
            .map_err(|e| format!("last commit: {e}"))?;

        // Lock compatibility: a proposal only counts for us if we are not
        // locked, or it re-proposes our locked block. Decided at prevote
        // time; nothing to verify here beyond the declared locked_round
        // being a past round.
        if let Some(locked_round) = proposal.locked_round {
            if locked_round >= proposal.round {
                return Err("locked_round is not earlier than proposal round".into());
            }
        }
        Ok(())
    }

    /// Build, sign and broadcast a proposal, then prevote it.
    fn propose_block(&mut self, block: Arc<Block>, locked_round: Option<u32>) -> Vec<Action> {
        let Some(index) = self.our_index else {
            return vec![];
        };
        let hash = block.hash();
        let proposal = Proposal::sign(
            self.height,
            self.round,
            (*block).clone(),
            locked_round,
            index,
            &self.key,
        );

        info!(
            height = self.height,
            round = self.round,
            block = %hash,
            txs = block.body.transactions.len(),
            locked_round,
            "Proposing block"
        );

        self.blocks.insert(hash, block);
        self.proposals.insert(self.round, proposal.clone());

        let mut actions = vec![Action::Broadcast {
            message: PeerMessage::NewConsensusMessage {
                message: ConsensusPayload::Proposal(Box::new(proposal.clone())),
            },
        }];
        actions.extend(self.decide_prevote(&proposal));
        actions
    }

    /// Callback: the dapp ordered our candidate transactions.
    pub fn on_transactions_selected(
        &mut self,
        height: u64,
        round: u32,
        transactions: Vec<Transaction>,
    ) -> Vec<Action> {
        if height != self.height
            || round != self.round
            || self.step != Step::Propose
            || self.awaiting_selection != Some(round)
        {
            return vec![];
        }
        self.awaiting_selection = None;

        let mut transactions = transactions;
        transactions.truncate(self.config.max_block_transactions);
        let transactions = TransactionList::new(transactions);

        let timestamp = (self.now.as_millis() as u64).max(self.parent_timestamp);
        let body = BlockBody {
            transactions,
            last_commit: self.parent_commit.clone(),
            next_validator_set: self.validators.clone(),
        };
        let header = BlockHeader {
            height: self.height,
            timestamp,
            last_block_hash: self.parent_hash,
            transaction_root: body.transactions.root(),
            last_commit_root: body.last_commit.hash(),
            next_validator_set_root: body.next_validator_set.hash(),
            app_state_hash: self.app_state_hash,
        };
        self.propose_block(Arc::new(Block { header, body }), None)
    }

    /// Prevote a proposal's block, or nil if it conflicts with our lock.
    fn decide_prevote(&mut self, proposal: &Proposal) -> Vec<Action> {
        let hash = proposal.block.header.hash();
        let value = match &self.locked {
            None => Some(hash),
            Some((_, locked_block)) if locked_block.hash() == hash => Some(hash),
            Some((locked_round, _)) => {
                debug!(
                    height = self.height,
                    round = self.round,
                    locked_round,
                    "Proposal conflicts with lock, prevoting nil"
                );
                None
            }
        };
        self.do_vote(VoteType::Prevote, value)
    }

    // ── Voting ───────────────────────────────────────────────────────────

    /// Sign, persist, broadcast and count our own vote; observers only
    /// advance their step.
    fn do_vote(&mut self, vote_type: VoteType, value: Option<Hash>) -> Vec<Action> {
        self.step = match vote_type {
            VoteType::Prevote => Step::Prevote,
            VoteType::Precommit => Step::Precommit,
        };

        let mut actions = vec![];
        if vote_type == VoteType::Precommit {
            actions.push(Action::SetTimer {
                id: TimerId::Consensus {
                    height: self.height,
                    round: self.round,
                    step: TimeoutStep::Precommit,
                },
                duration: self.config.precommit_timeout_at(self.round),
            });
        }

        let Some(index) = self.our_index else {
            return actions;
        };

        // Crash safety: a slot we already voted in keeps its value, even
        // across restarts (signing is deterministic, so the wire sees the
        // identical vote again).
        let value = self
            .recovered
            .get(self.height, self.round, vote_type)
            .unwrap_or(value);
        self.recovered
            .insert(self.height, self.round, vote_type, value);

        let vote = Vote::sign(vote_type, self.height, self.round, value, index, &self.key);
        self.voted_this_height = true;
        trace!(
            height = self.height,
            round = self.round,
            ?vote_type,
            value = ?value,
            "Casting vote"
        );

        actions.push(Action::PersistOwnVote {
            height: self.height,
            round: self.round,
            step: vote_type,
            block_hash: value,
        });
        actions.push(Action::Broadcast {
            message: PeerMessage::NewConsensusMessage {
                message: ConsensusPayload::Vote(vote.clone()),
            },
        });
        actions.extend(self.add_verified_vote(vote));
        actions
    }

    /// A vote arrived from the network.
    pub fn on_vote(&mut self, vote: Vote) -> Vec<Action> {
        // The engine always decides `local height + 1`, so this one check
        // covers the whole window rule: future heights dropped, past
        // heights ignored.
        if vote.height != self.height {
            trace!(
                height = vote.height,
                current = self.height,
                "Vote outside current height dropped"
            );
            return vec![];
        }

        let Some(entry) = self.validators.get(vote.validator_index) else {
            return vec![Action::EmitError {
                error: NodeError::InvalidVote {
                    reason: format!("unknown validator index {}", vote.validator_index),
                },
            }];
        };

        // Dedup by (validator, round, type): identical repeats are dropped
        // here; conflicting votes proceed so the equivocation is recorded.
        let set = match vote.vote_type {
            VoteType::Prevote => self.prevotes.get(&vote.round),
            VoteType::Precommit => self.precommits.get(&vote.round),
        };
        if let Some(existing) = set.and_then(|s| s.get(vote.validator_index)) {
            if existing.block_hash == vote.block_hash {
                return vec![];
            }
        }
        if !self
            .pending_votes
            .insert((vote.validator_index, vote.round, vote.vote_type))
        {
            return vec![];
        }

        let public_key = entry.public_key;
        vec![Action::VerifyVoteSignature { vote, public_key }]
    }

    /// Callback: vote signature checked.
    pub fn on_vote_verified(&mut self, vote: Vote, valid: bool) -> Vec<Action> {
        self.pending_votes
            .remove(&(vote.validator_index, vote.round, vote.vote_type));
        if vote.height != self.height {
            return vec![];
        }
        if !valid {
            return vec![Action::EmitError {
                error: NodeError::InvalidVote {
                    reason: format!("bad signature from validator {}", vote.validator_index),
                },
            }];
        }
        self.add_verified_vote(vote)
    }

    /// Count a signature-verified vote and check for progress.
    fn add_verified_vote(&mut self, vote: Vote) -> Vec<Action> {
        let power = self
            .validators
            .get(vote.validator_index)
            .map(|e| e.voting_power)
            .unwrap_or(0);
        let round = vote.round;
        let vote_type = vote.vote_type;

        let set = match vote_type {
            VoteType::Prevote => self.prevotes.entry(round).or_default(),
            VoteType::Precommit => self.precommits.entry(round).or_default(),
        };
        match set.add(vote.clone(), power) {
            AddVote::Duplicate => return vec![],
            AddVote::Equivocation { existing } => {
                warn!(
                    height = self.height,
                    round,
                    validator = vote.validator_index,
                    ?vote_type,
                    "Equivocation detected; retaining both votes"
                );
                self.equivocations.push((existing, vote));
                return vec![];
            }
            AddVote::Added => {}
        }

        match vote_type {
            VoteType::Prevote => self.check_prevotes(round),
            VoteType::Precommit => self.check_precommits(round),
        }
    }

    fn check_prevotes(&mut self, round: u32) -> Vec<Action> {
        let Some(set) = self.prevotes.get(&round) else {
            return vec![];
        };
        let quorum = set.quorum_value(&self.validators);
        let two_thirds_any = set.two_thirds_any(&self.validators);

        let Some(value) = quorum else {
            // Mixed prevotes past the threshold: give the round a bounded
            // window to converge, then precommit nil.
            if round == self.round
                && self.step == Step::Prevote
                && two_thirds_any
                && self.prevote_timer_armed.insert(round)
            {
                return vec![Action::SetTimer {
                    id: TimerId::Consensus {
                        height: self.height,
                        round,
                        step: TimeoutStep::Prevote,
                    },
                    duration: self.config.prevote_timeout_at(round),
                }];
            }
            return vec![];
        };

        // Lock release: `> 2/3` prevotes in a newer round for some other
        // value frees the validator to move on.
        if let Some((locked_round, locked_block)) = &self.locked {
            if round > *locked_round && value != Some(locked_block.hash()) {
                info!(
                    height = self.height,
                    locked_round,
                    release_round = round,
                    "Releasing lock"
                );
                self.locked = None;
            }
        }

        if round != self.round || self.step != Step::Prevote {
            return vec![];
        }

        match value {
            Some(hash) => match self.blocks.get(&hash).cloned() {
                Some(block) => {
                    info!(
                        height = self.height,
                        round,
                        block = %hash,
                        "Prevote quorum, locking and precommitting"
                    );
                    self.locked = Some((round, block));
                    self.do_vote(VoteType::Precommit, Some(hash))
                }
                None => {
                    // Quorum for a block we never received; we cannot lock
                    // what we cannot validate.
                    debug!(height = self.height, round, block = %hash, "Prevote quorum without block");
                    self.do_vote(VoteType::Precommit, None)
                }
            },
            None => self.do_vote(VoteType::Precommit, None),
        }
    }

    fn check_precommits(&mut self, round: u32) -> Vec<Action> {
        let Some(set) = self.precommits.get(&round) else {
            return vec![];
        };
        match set.quorum_value(&self.validators) {
            Some(Some(hash)) => self.try_commit(round, hash),
            Some(None) => {
                // Nil precommit quorum: the round is dead, move on now.
                if round == self.round && self.step != Step::Commit {
                    debug!(height = self.height, round, "Nil precommit quorum, next round");
                    self.enter_round(round + 1)
                } else {
                    vec![]
                }
            }
            None => vec![],
        }
    }

    // ── Commit ───────────────────────────────────────────────────────────

    /// Commit `hash` at `round` if we hold the block.
    fn try_commit(&mut self, round: u32, hash: Hash) -> Vec<Action> {
        if self.step == Step::Commit {
            return vec![];
        }
        let Some(block) = self.blocks.get(&hash).cloned() else {
            debug!(height = self.height, round, block = %hash, "Precommit quorum without block");
            return vec![];
        };

        let votes = self
            .precommits
            .get(&round)
            .map(|set| {
                set.votes_for(&Some(hash))
                    .into_iter()
                    .map(|v| CommitVote {
                        validator_index: v.validator_index,
                        block_hash: hash,
                        signature: v.signature,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let commit = Commit { round, votes };

        info!(
            height = self.height,
            round,
            block = %hash,
            precommits = commit.votes.len(),
            "Committing block"
        );
        self.step = Step::Commit;
        self.committing = Some(hash);
        vec![Action::CommitBlock { block, commit }]
    }

    /// Re-check every round's precommits; used when a missing block shows
    /// up late.
    fn try_commit_any_round(&mut self) -> Vec<Action> {
        if self.step == Step::Commit {
            return vec![];
        }
        let ready: Option<(u32, Hash)> = self.precommits.iter().find_map(|(round, set)| {
            match set.quorum_value(&self.validators) {
                Some(Some(hash)) if self.blocks.contains_key(&hash) => Some((*round, hash)),
                _ => None,
            }
        });
        match ready {
            Some((round, hash)) => self.try_commit(round, hash),
            None => vec![],
        }
    }

    /// The store confirmed a new tip (our commit or a synced block).
    pub fn on_block_committed(&mut self, block: &Arc<Block>, commit: &Commit) -> Vec<Action> {
        let height = block.header.height;
        if height != self.height {
            // Stale confirmation (e.g. replay at startup).
            if height < self.height {
                return vec![];
            }
            warn!(
                height,
                expected = self.height,
                "Store tip jumped ahead of consensus"
            );
        }

        let hash = block.hash();
        let ours = self.committing == Some(hash);
        let mut actions = vec![];
        if ours {
            actions.push(Action::Broadcast {
                message: PeerMessage::NewBlock {
                    block: Box::new((**block).clone()),
                },
            });
            actions.push(Action::Broadcast {
                message: PeerMessage::NewBlockHeight { height },
            });
        }

        // Adopt the committed block as parent and reset for the next height.
        self.height = height + 1;
        self.parent_hash = hash;
        self.parent_timestamp = block.header.timestamp;
        self.parent_voting_set = block.body.next_validator_set.clone();
        self.validators = block.body.next_validator_set.clone();
        self.our_index = self.validators.index_of(&self.key.public_key());
        self.parent_commit = commit.clone();

        self.round = 0;
        self.step = Step::NewHeight;
        self.height_begun = false;
        self.voted_this_height = false;
        self.proposals.clear();
        self.blocks.clear();
        self.prevotes.clear();
        self.precommits.clear();
        self.prevote_timer_armed.clear();
        self.pending_votes.clear();
        self.pending_proposals.clear();
        self.locked = None;
        self.committing = None;
        self.awaiting_selection = None;
        // Equivocation records survive height changes; the slashing layer
        // drains them out of band.

        actions.extend(self.try_begin_height());
        actions
    }

    /// The executor caught up to `height`.
    pub fn on_block_executed(&mut self, height: u64, app_state_hash: Hash) -> Vec<Action> {
        if height > self.executed_height {
            self.executed_height = height;
            self.app_state_hash = app_state_hash;
        }
        self.try_begin_height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{GenesisConfig, ValidatorEntry};
    use std::collections::VecDeque;

    fn keys() -> Vec<KeyPair> {
        (0..4).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn genesis(keys: &[KeyPair]) -> Block {
        GenesisConfig {
            validators: keys
                .iter()
                .map(|k| ValidatorEntry {
                    public_key: k.public_key(),
                    voting_power: 1,
                })
                .collect(),
            timestamp: 0,
            app_state_hash: Hash::of(b"app"),
        }
        .genesis_block()
    }

    /// Engine for validator `index`, started at height 1 on the genesis tip.
    fn engine_for(keys: &[KeyPair], index: usize) -> (EngineState, Block) {
        let tip = genesis(keys);
        let mut engine = EngineState::new(
            ConsensusConfig::default(),
            keys[index].clone(),
            &tip,
            Commit::empty(),
            0,
            tip.header.app_state_hash,
            RecoveredVotes::default(),
        );
        engine.start();
        (engine, tip)
    }

    /// Build a valid height-1 block on the genesis tip.
    fn block_on(tip: &Block, payload_marker: u64) -> Block {
        let transactions = TransactionList::default();
        let body = BlockBody {
            transactions,
            last_commit: Commit::empty(),
            next_validator_set: tip.body.next_validator_set.clone(),
        };
        let header = BlockHeader {
            height: 1,
            // Distinct timestamps give distinct block hashes.
            timestamp: tip.header.timestamp + payload_marker,
            last_block_hash: tip.hash(),
            transaction_root: body.transactions.root(),
            last_commit_root: body.last_commit.hash(),
            next_validator_set_root: body.next_validator_set.hash(),
            app_state_hash: tip.header.app_state_hash,
        };
        Block { header, body }
    }

    fn proposal_from(
        keys: &[KeyPair],
        index: u32,
        round: u32,
        block: Block,
        locked_round: Option<u32>,
    ) -> Box<Proposal> {
        Box::new(Proposal::sign(
            1,
            round,
            block,
            locked_round,
            index,
            &keys[index as usize],
        ))
    }

    fn vote_from(
        keys: &[KeyPair],
        index: u32,
        vote_type: VoteType,
        round: u32,
        value: Option<Hash>,
    ) -> Vote {
        Vote::sign(vote_type, 1, round, value, index, &keys[index as usize])
    }

    /// Resolve delegated verification actions inline, like the simulation
    /// runner does, and return everything else.
    fn drive(engine: &mut EngineState, initial: Vec<Action>) -> Vec<Action> {
        let mut queue: VecDeque<Action> = initial.into();
        let mut out = vec![];
        while let Some(action) = queue.pop_front() {
            match action {
                Action::VerifyVoteSignature { vote, public_key } => {
                    let valid = vote.verify(&public_key);
                    queue.extend(engine.on_vote_verified(vote, valid));
                }
                Action::VerifyProposalSignature {
                    proposal,
                    public_key,
                } => {
                    let valid = proposal.verify(&public_key);
                    queue.extend(engine.on_proposal_verified(proposal, valid));
                }
                other => out.push(other),
            }
        }
        out
    }

    fn broadcast_votes(actions: &[Action]) -> Vec<&Vote> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast {
                    message:
                        PeerMessage::NewConsensusMessage {
                            message: ConsensusPayload::Vote(vote),
                        },
                } => Some(vote),
                _ => None,
            })
            .collect()
    }

    fn feed_vote(engine: &mut EngineState, vote: Vote) -> Vec<Action> {
        let actions = engine.on_vote(vote);
        drive(engine, actions)
    }

    fn feed_proposal(engine: &mut EngineState, proposal: Box<Proposal>) -> Vec<Action> {
        let actions = engine.on_proposal(proposal);
        drive(engine, actions)
    }

    #[test]
    fn proposer_builds_and_prevotes_own_block() {
        let keys = keys();
        // Validator 1 proposes (height 1, round 0).
        let (mut engine, _tip) = engine_for(&keys, 1);

        let actions = engine.on_timeout(1, 0, TimeoutStep::NewHeight);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SelectTransactions { height: 1, round: 0, .. })));

        let selected = engine.on_transactions_selected(1, 0, vec![]);
        let actions = drive(&mut engine, selected);
        let has_proposal = actions.iter().any(|a| {
            matches!(
                a,
                Action::Broadcast {
                    message: PeerMessage::NewConsensusMessage {
                        message: ConsensusPayload::Proposal(_)
                    }
                }
            )
        });
        assert!(has_proposal, "Proposer should broadcast its proposal");

        let votes = broadcast_votes(&actions);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote_type, VoteType::Prevote);
        assert!(votes[0].block_hash.is_some());
        assert_eq!(engine.step(), Step::Prevote);
    }

    #[test]
    fn non_proposer_prevotes_valid_proposal() {
        let keys = keys();
        let (mut engine, tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let block = block_on(&tip, 1);
        let hash = block.hash();
        let actions = feed_proposal(&mut engine, proposal_from(&keys, 1, 0, block, None));

        let votes = broadcast_votes(&actions);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].block_hash, Some(hash));
        assert!(engine.has_voted_current_height());
    }

    #[test]
    fn propose_timeout_prevotes_nil() {
        let keys = keys();
        let (mut engine, _tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let timed_out = engine.on_timeout(1, 0, TimeoutStep::Propose);
        let actions = drive(&mut engine, timed_out);
        let votes = broadcast_votes(&actions);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].block_hash, None);
        assert_eq!(engine.step(), Step::Prevote);
    }

    #[test]
    fn stale_timeouts_are_ignored() {
        let keys = keys();
        let (mut engine, _tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        assert!(engine.on_timeout(1, 3, TimeoutStep::Propose).is_empty());
        assert!(engine.on_timeout(9, 0, TimeoutStep::Propose).is_empty());
        // Prevote timeout before we prevoted is stale too.
        assert!(engine.on_timeout(1, 0, TimeoutStep::Prevote).is_empty());
    }

    #[test]
    fn wrong_proposer_is_rejected() {
        let keys = keys();
        let (mut engine, tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let block = block_on(&tip, 1);
        let actions = engine.on_proposal(proposal_from(&keys, 2, 0, block, None));
        assert!(matches!(
            &actions[0],
            Action::EmitError {
                error: NodeError::InvalidProposal { .. }
            }
        ));
    }

    #[test]
    fn prevote_quorum_locks_and_precommits() {
        let keys = keys();
        let (mut engine, tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let block = block_on(&tip, 1);
        let hash = block.hash();
        feed_proposal(&mut engine, proposal_from(&keys, 1, 0, block, None));

        // Own prevote + validators 1 and 2 = 3 of 4 powers.
        feed_vote(&mut engine, vote_from(&keys, 1, VoteType::Prevote, 0, Some(hash)));
        let actions = feed_vote(&mut engine, vote_from(&keys, 2, VoteType::Prevote, 0, Some(hash)));

        assert_eq!(engine.locked_round(), Some(0));
        assert_eq!(engine.step(), Step::Precommit);
        let votes = broadcast_votes(&actions);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote_type, VoteType::Precommit);
        assert_eq!(votes[0].block_hash, Some(hash));
    }

    #[test]
    fn precommit_quorum_commits_with_certificate() {
        let keys = keys();
        let (mut engine, tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let block = block_on(&tip, 1);
        let hash = block.hash();
        feed_proposal(&mut engine, proposal_from(&keys, 1, 0, block, None));
        for i in [1, 2] {
            feed_vote(&mut engine, vote_from(&keys, i, VoteType::Prevote, 0, Some(hash)));
        }
        feed_vote(&mut engine, vote_from(&keys, 1, VoteType::Precommit, 0, Some(hash)));
        let actions = feed_vote(
            &mut engine,
            vote_from(&keys, 2, VoteType::Precommit, 0, Some(hash)),
        );

        let (committed, commit) = actions
            .iter()
            .find_map(|a| match a {
                Action::CommitBlock { block, commit } => Some((Arc::clone(block), commit.clone())),
                _ => None,
            })
            .expect("Quorum should commit");
        assert_eq!(committed.hash(), hash);
        assert_eq!(commit.round, 0);
        assert_eq!(commit.votes.len(), 3);
        assert_eq!(engine.step(), Step::Commit);

        // The commit certificate must verify on its own.
        assert_eq!(
            commit.verify(hash, 1, &committed.body.next_validator_set),
            Ok(())
        );

        // Store confirmation advances the height and announces the block.
        let actions = engine.on_block_committed(&committed, &commit);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: PeerMessage::NewBlock { .. } })));
        assert!(actions.iter().any(
            |a| matches!(a, Action::Broadcast { message: PeerMessage::NewBlockHeight { height: 1 } })
        ));
        assert_eq!(engine.height(), 2);
        assert_eq!(engine.step(), Step::NewHeight);

        // The next height begins only after execution catches up.
        let actions = engine.on_block_executed(1, Hash::of(b"s1"));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Consensus {
                    height: 2,
                    round: 0,
                    step: TimeoutStep::NewHeight
                },
                ..
            }
        )));
    }

    #[test]
    fn equivocating_prevotes_are_retained_and_do_not_block_commit() {
        let keys = keys();
        let (mut engine, tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let block = block_on(&tip, 1);
        let other = block_on(&tip, 2);
        let hash = block.hash();
        feed_proposal(&mut engine, proposal_from(&keys, 1, 0, block, None));

        // Validator 3 equivocates: one prevote for the block, one for
        // another value.
        feed_vote(&mut engine, vote_from(&keys, 3, VoteType::Prevote, 0, Some(hash)));
        feed_vote(
            &mut engine,
            vote_from(&keys, 3, VoteType::Prevote, 0, Some(other.hash())),
        );
        assert_eq!(engine.equivocations().len(), 1);

        // Honest power still reaches quorum: own vote + 1 + 3(first).
        let actions = feed_vote(&mut engine, vote_from(&keys, 1, VoteType::Prevote, 0, Some(hash)));
        assert_eq!(engine.locked_round(), Some(0));
        let votes = broadcast_votes(&actions);
        assert_eq!(votes[0].vote_type, VoteType::Precommit);
    }

    #[test]
    fn lock_is_released_by_newer_round_quorum() {
        let keys = keys();
        let (mut engine, tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        // Lock on block A at round 0.
        let block_a = block_on(&tip, 1);
        let hash_a = block_a.hash();
        feed_proposal(&mut engine, proposal_from(&keys, 1, 0, block_a, None));
        for i in [1, 2] {
            feed_vote(&mut engine, vote_from(&keys, i, VoteType::Prevote, 0, Some(hash_a)));
        }
        assert_eq!(engine.locked_round(), Some(0));

        // Round 0 dies (nil precommits), move to round 1.
        for i in [1, 2, 3] {
            feed_vote(&mut engine, vote_from(&keys, i, VoteType::Precommit, 0, None));
        }
        assert_eq!(engine.round(), 1);

        // Round 1 proposer (validator 2) proposes B; we are locked on A so
        // we prevote nil.
        let block_b = block_on(&tip, 7);
        let hash_b = block_b.hash();
        let actions = feed_proposal(&mut engine, proposal_from(&keys, 2, 1, block_b, None));
        let votes = broadcast_votes(&actions);
        assert_eq!(votes[0].block_hash, None, "Locked validator prevotes nil");

        // A newer-round prevote quorum for B releases the lock and relocks
        // on B.
        for i in [1, 2, 3] {
            feed_vote(&mut engine, vote_from(&keys, i, VoteType::Prevote, 1, Some(hash_b)));
        }
        assert_eq!(engine.locked_round(), Some(1));
    }

    #[test]
    fn locked_proposer_reproposes_locked_block() {
        let keys = keys();
        // Validator 2 proposes at (height 1, round 1).
        let (mut engine, tip) = engine_for(&keys, 2);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        // Lock on A at round 0 (proposal from validator 1).
        let block_a = block_on(&tip, 1);
        let hash_a = block_a.hash();
        feed_proposal(&mut engine, proposal_from(&keys, 1, 0, block_a, None));
        for i in [0, 1] {
            feed_vote(&mut engine, vote_from(&keys, i, VoteType::Prevote, 0, Some(hash_a)));
        }
        assert_eq!(engine.locked_round(), Some(0));

        // Round 0 fails; as round-1 proposer we must re-propose A with
        // locked_round set.
        for i in [0, 1, 3] {
            feed_vote(&mut engine, vote_from(&keys, i, VoteType::Precommit, 0, None));
        }
        assert_eq!(engine.round(), 1);

        let reproposal = engine
            .proposals
            .get(&1)
            .expect("Locked proposer should propose in round 1");
        assert_eq!(reproposal.block.hash(), hash_a);
        assert_eq!(reproposal.locked_round, Some(0));
    }

    #[test]
    fn votes_for_other_heights_are_dropped() {
        let keys = keys();
        let (mut engine, _tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        let future = Vote::sign(VoteType::Prevote, 5, 0, None, 1, &keys[1]);
        assert!(engine.on_vote(future).is_empty());
        let past = Vote::sign(VoteType::Prevote, 0, 0, None, 1, &keys[1]);
        assert!(engine.on_vote(past).is_empty());
    }

    #[test]
    fn forged_vote_signature_is_rejected() {
        let keys = keys();
        let (mut engine, _tip) = engine_for(&keys, 0);
        engine.on_timeout(1, 0, TimeoutStep::NewHeight);

        // Vote claims validator 1 but is signed by validator 3.
        let forged = Vote::sign(VoteType::Prevote, 1, 0, None, 1, &keys[3]);
        let received = engine.on_vote(forged);
        let actions = drive(&mut engine, received);
        assert!(matches!(
            &actions[0],
            Action::EmitError {
                error: NodeError::InvalidVote { .. }
            }
        ));
    }
}
