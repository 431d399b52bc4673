//! State shared by every connection handler.
//!
//! The bet store and the settlement barrier sit behind a single mutex so that
//! the winners query sees readiness and the stored bets as one consistent
//! state. Critical sections are synchronous and never span an `.await`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::bet::{AgencyId, BetRecord};
use crate::settlement::{DrawRule, SettlementBarrier, SettlementError};
use crate::store::{BetStore, StoreError};

pub struct Central {
    ledger: Mutex<Ledger>,
    rule: Box<dyn DrawRule>,
}

struct Ledger {
    store: BetStore,
    barrier: SettlementBarrier,
}

impl Central {
    pub fn new<R>(store: BetStore, total_agencies: AgencyId, rule: R) -> Self
    where
        R: DrawRule + 'static,
    {
        Self {
            ledger: Mutex::new(Ledger {
                store,
                barrier: SettlementBarrier::new(total_agencies),
            }),
            rule: Box::new(rule),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a batch of bets. Returns the total number of stored bets.
    pub fn record_bets(&self, bets: &[BetRecord]) -> Result<usize, StoreError> {
        let mut ledger = self.ledger();
        ledger.store.append(bets)?;
        Ok(ledger.store.len())
    }

    /// Marks `agency` as done submitting. Returns whether the draw is now settled.
    pub fn mark_finished(&self, agency: AgencyId) -> Result<bool, SettlementError> {
        let mut ledger = self.ledger();
        if ledger.barrier.mark_finished(agency)? {
            info!(
                agency,
                finished = ledger.barrier.finished_count(),
                total = ledger.barrier.total_agencies(),
                "agency finished submitting"
            );
            if ledger.barrier.is_ready() {
                info!(bets = ledger.store.len(), "all agencies finished, draw settled");
            }
        }
        Ok(ledger.barrier.is_ready())
    }

    /// Winning bets of `agency`, or `None` while some agency is still submitting.
    pub fn winners(&self, agency: AgencyId) -> Option<usize> {
        let ledger = self.ledger();
        ledger
            .barrier
            .ready_winner_count(agency, ledger.store.snapshot(), self.rule.as_ref())
    }

    pub fn is_ready(&self) -> bool {
        self.ledger().barrier.is_ready()
    }

    pub fn snapshot(&self) -> Vec<BetRecord> {
        self.ledger().store.snapshot().to_vec()
    }
}
