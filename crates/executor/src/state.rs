//! Executor state.

use concord_core::Action;
use concord_types::{Block, Hash};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Executor state machine.
///
/// Committed blocks queue here until their turn; execution is strictly
/// sequential and never skips a height.
pub struct ExecutorState {
    /// Height up to which the dapp has executed every transaction.
    executed_height: u64,

    /// App state hash reported after `executed_height`.
    app_state_hash: Hash,

    /// Committed blocks awaiting execution, keyed by height.
    queue: BTreeMap<u64, Arc<Block>>,

    /// One block is with the runner right now.
    in_flight: bool,

    /// Execution loop enabled. Disabled during shutdown.
    running: bool,
}

impl ExecutorState {
    /// Resume from the persisted frontier.
    pub fn new(executed_height: u64, app_state_hash: Hash) -> Self {
        Self {
            executed_height,
            app_state_hash,
            queue: BTreeMap::new(),
            in_flight: false,
            running: false,
        }
    }

    pub fn executed_height(&self) -> u64 {
        self.executed_height
    }

    pub fn app_state_hash(&self) -> Hash {
        self.app_state_hash
    }

    /// Enable the loop and dispatch any queued work.
    pub fn start(&mut self) -> Vec<Action> {
        self.running = true;
        self.dispatch()
    }

    /// Disable the loop. In-flight work completes; nothing new dispatches.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// A block reached the store (consensus commit or sync apply).
    #[instrument(skip(self, block), fields(
        height = block.header.height,
        txs = block.body.transactions.len()
    ))]
    pub fn on_block_committed(&mut self, block: Arc<Block>) -> Vec<Action> {
        let height = block.header.height;
        if height <= self.executed_height {
            trace!(height, "Ignoring already-executed block");
            return vec![];
        }
        self.queue.insert(height, block);
        self.dispatch()
    }

    /// The runner finished executing a block through the dapp.
    pub fn on_block_executed(&mut self, height: u64, app_state_hash: Hash) -> Vec<Action> {
        if height != self.executed_height + 1 {
            warn!(
                height,
                frontier = self.executed_height,
                "Out-of-order execution report"
            );
            return vec![];
        }
        self.executed_height = height;
        self.app_state_hash = app_state_hash;
        self.in_flight = false;
        self.queue.remove(&height);
        debug!(height, app_state = %app_state_hash, "Execution frontier advanced");
        self.dispatch()
    }

    /// Dispatch the next block if it is the frontier's successor.
    fn dispatch(&mut self) -> Vec<Action> {
        if !self.running || self.in_flight {
            return vec![];
        }
        let next = self.executed_height + 1;
        let Some(block) = self.queue.get(&next) else {
            return vec![];
        };
        self.in_flight = true;
        vec![Action::ExecuteBlock {
            block: Arc::clone(block),
        }]
    }
}
