//! Completion barrier and winner counting.
//!
//! The draw can only be settled once every configured agency has declared
//! that it finished submitting bets. [`SettlementBarrier`] is the only place
//! that knows how many agencies are expected.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::bet::{AgencyId, BetRecord};

/// Decides whether a bet wins the draw.
pub trait DrawRule: Send + Sync {
    fn wins(&self, bet: &BetRecord) -> bool;
}

/// The rule used by the central: a bet wins when it picked the drawn number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinningNumber(pub u64);

impl WinningNumber {
    pub const DEFAULT: WinningNumber = WinningNumber(7574);
}

impl DrawRule for WinningNumber {
    fn wins(&self, bet: &BetRecord) -> bool {
        bet.number == self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("agency {agency} is outside the configured range 1..={total}")]
    UnknownAgency { agency: AgencyId, total: AgencyId },
}

#[derive(Debug)]
pub struct SettlementBarrier {
    total_agencies: AgencyId,
    finished: BTreeSet<AgencyId>,
}

impl SettlementBarrier {
    pub fn new(total_agencies: AgencyId) -> Self {
        Self {
            total_agencies,
            finished: BTreeSet::new(),
        }
    }

    pub fn total_agencies(&self) -> AgencyId {
        self.total_agencies
    }

    /// Records that `agency` finished submitting. Repeating it is a no-op.
    ///
    /// Returns `true` when this call was the first for `agency`.
    pub fn mark_finished(&mut self, agency: AgencyId) -> Result<bool, SettlementError> {
        if agency == 0 || agency > self.total_agencies {
            return Err(SettlementError::UnknownAgency {
                agency,
                total: self.total_agencies,
            });
        }
        Ok(self.finished.insert(agency))
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn is_ready(&self) -> bool {
        self.finished.len() == self.total_agencies as usize
    }

    /// Counts the winning bets of `agency`, or `None` while the barrier is open.
    pub fn ready_winner_count<'a, I>(
        &self,
        agency: AgencyId,
        bets: I,
        rule: &dyn DrawRule,
    ) -> Option<usize>
    where
        I: IntoIterator<Item = &'a BetRecord>,
    {
        if !self.is_ready() {
            return None;
        }
        Some(
            bets.into_iter()
                .filter(|bet| bet.agency == agency && rule.wins(bet))
                .count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bet::sample;

    #[test]
    fn mark_finished_is_idempotent() {
        let mut barrier = SettlementBarrier::new(3);
        assert_eq!(barrier.mark_finished(2), Ok(true));
        assert_eq!(barrier.mark_finished(2), Ok(false));
        assert_eq!(barrier.finished_count(), 1);
        assert!(!barrier.is_ready());
    }

    #[test]
    fn agencies_outside_range_are_refused() {
        let mut barrier = SettlementBarrier::new(2);
        assert_eq!(
            barrier.mark_finished(3),
            Err(SettlementError::UnknownAgency {
                agency: 3,
                total: 2
            })
        );
        assert!(barrier.mark_finished(0).is_err());
        assert_eq!(barrier.finished_count(), 0);
    }

    #[test]
    fn counts_only_after_every_agency_finished() {
        let bets = vec![sample(1, 7), sample(1, 13), sample(2, 7), sample(1, 7)];
        let rule = WinningNumber(7);
        let mut barrier = SettlementBarrier::new(2);

        barrier.mark_finished(1).expect("agency 1");
        assert_eq!(barrier.ready_winner_count(1, &bets, &rule), None);

        barrier.mark_finished(2).expect("agency 2");
        assert!(barrier.is_ready());
        assert_eq!(barrier.ready_winner_count(1, &bets, &rule), Some(2));
        assert_eq!(barrier.ready_winner_count(2, &bets, &rule), Some(1));
    }

    #[test]
    fn default_winning_number() {
        assert!(WinningNumber::DEFAULT.wins(&sample(4, 7574)));
        assert!(!WinningNumber::DEFAULT.wins(&sample(4, 7575)));
    }
}
