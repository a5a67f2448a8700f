//! Log-length negotiation
//!
//! When the leader's proposed `(prev_log_index, prev_log_term)` does not
//! match our log, we binary search for the highest index where both logs
//! agree. Each round shows the leader a window `[min, max]` and a midpoint;
//! the leader answers with its own term at the midpoint. Log matching makes
//! "terms agree at i" true for every i up to the answer and false after it,
//! so the search converges in O(log(range)) rounds.

use super::protocol::LogLengthNegotiation;
use super::{Index, Term};
use crate::{Error, Result};

/// Search window shown to the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationWindow {
    /// Lower bound (inclusive)
    pub min_index: Index,
    /// Upper bound (inclusive)
    pub max_index: Index,
    /// Position shown to the leader
    pub midpoint_index: Index,
    /// Our term at the midpoint
    pub midpoint_term: Term,
}

impl NegotiationWindow {
    fn new<F>(min_index: Index, max_index: Index, local_term: &F) -> Result<Self>
    where
        F: Fn(Index) -> Result<Option<Term>>,
    {
        let mut window = Self {
            min_index,
            max_index,
            midpoint_index: 0,
            midpoint_term: 0,
        };
        window.recompute(local_term)?;
        Ok(window)
    }

    /// Still more than one candidate
    pub fn is_open(&self) -> bool {
        self.min_index < self.max_index
    }

    fn narrow<F>(&mut self, matched: bool, local_term: &F) -> Result<()>
    where
        F: Fn(Index) -> Result<Option<Term>>,
    {
        if matched {
            self.min_index = self.midpoint_index + 1;
        } else {
            self.max_index = self.midpoint_index - 1;
        }
        if self.min_index <= self.max_index {
            self.recompute(local_term)?;
        }
        Ok(())
    }

    fn recompute<F>(&mut self, local_term: &F) -> Result<()>
    where
        F: Fn(Index) -> Result<Option<Term>>,
    {
        self.midpoint_index = self.min_index + (self.max_index - self.min_index) / 2;
        self.midpoint_term = local_term(self.midpoint_index)?.ok_or_else(|| {
            Error::consensus(format!(
                "No term for index {} inside the local log window [{}, {}]",
                self.midpoint_index, self.min_index, self.max_index
            ))
        })?;
        Ok(())
    }
}

/// Result of a negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationOutcome {
    /// Highest index both logs agree on
    pub last_log_index: Index,
    /// Round trips with the leader
    pub rounds: u32,
}

/// Find the highest index where our log agrees with the leader's, given
/// that they disagree at `prev_log_index`.
///
/// `first_index`/`last_index` bound our log (`first_index == 0` when it is
/// empty). `local_term` looks up our term at an index. `exchange` sends the
/// window to the leader and returns its counter-proposal.
///
/// Bisection takes at most `ceil(log2(range))` round trips over the
/// candidate range. When it settles on an index the leader has not yet
/// confirmed, one more exchange confirms it, so the total can reach
/// `ceil(log2(range)) + 1`.
pub fn negotiate<F, X>(
    first_index: Index,
    last_index: Index,
    prev_log_index: Index,
    local_term: F,
    mut exchange: X,
) -> Result<NegotiationOutcome>
where
    F: Fn(Index) -> Result<Option<Term>>,
    X: FnMut(&NegotiationWindow) -> Result<LogLengthNegotiation>,
{
    if first_index == 0 {
        return Ok(NegotiationOutcome {
            last_log_index: 0,
            rounds: 0,
        });
    }

    let max_index = last_index.min(prev_log_index);
    if max_index < first_index {
        // Everything below our first entry is committed
        return Ok(NegotiationOutcome {
            last_log_index: max_index,
            rounds: 0,
        });
    }

    let mut rounds = 0;
    let mut ask = |window: &NegotiationWindow, rounds: &mut u32| -> Result<bool> {
        debug_assert!(window.min_index <= window.midpoint_index);
        debug_assert!(window.midpoint_index <= window.max_index);
        let proposal = exchange(window)?;
        *rounds += 1;
        Ok(local_term(proposal.prev_log_index)? == Some(proposal.prev_log_term))
    };

    let mut window = NegotiationWindow::new(first_index, max_index, &local_term)?;
    while window.is_open() {
        let matched = ask(&window, &mut rounds)?;
        window.narrow(matched, &local_term)?;
    }

    if window.min_index > window.max_index {
        return Ok(NegotiationOutcome {
            last_log_index: window.max_index,
            rounds,
        });
    }

    // Converged on a midpoint the leader has not confirmed yet
    let candidate = window.midpoint_index;
    let confirmed = candidate != prev_log_index && ask(&window, &mut rounds)?;
    Ok(NegotiationOutcome {
        last_log_index: if confirmed { candidate } else { candidate - 1 },
        rounds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;

    /// Local log `first..=last`, term 1 everywhere. The leader agrees up to
    /// `agreed` and uses term 2 afterwards.
    fn run(first: Index, last: Index, agreed: Index, prev_log_index: Index) -> (NegotiationOutcome, Vec<NegotiationWindow>) {
        let local = move |index: Index| -> Result<Option<Term>> {
            Ok((index >= first && index <= last).then_some(1))
        };
        let leader_term = move |index: Index| if index <= agreed { 1 } else { 2 };
        let windows = RefCell::new(Vec::new());

        let outcome = negotiate(first, last, prev_log_index, local, |window| {
            windows.borrow_mut().push(*window);
            Ok(LogLengthNegotiation {
                term: 2,
                prev_log_index: window.midpoint_index,
                prev_log_term: leader_term(window.midpoint_index),
            })
        })
        .unwrap();
        (outcome, windows.into_inner())
    }

    #[test]
    fn test_empty_log_replicates_from_start() {
        let outcome = negotiate(0, 0, 50, |_| Ok(None), |_| unreachable!()).unwrap();
        assert_eq!(outcome.last_log_index, 0);
        assert_eq!(outcome.rounds, 0);
    }

    #[test]
    fn test_diverged_suffix() {
        // Entries 1..=100 locally, leader agrees through 80
        let (outcome, windows) = run(1, 100, 80, 100);
        assert_eq!(outcome.last_log_index, 80);
        assert!(outcome.rounds <= 8);
        assert_eq!(windows[0].min_index, 1);
        assert_eq!(windows[0].max_index, 100);
        assert_eq!(windows[0].midpoint_index, 50);
    }

    #[test]
    fn test_nothing_in_common() {
        let (outcome, _) = run(1, 10, 0, 10);
        assert_eq!(outcome.last_log_index, 0);
    }

    #[test]
    fn test_leader_behind_truncation_point() {
        // Our log starts at 20; the leader proposes 15
        let (outcome, windows) = run(20, 40, 15, 15);
        assert_eq!(outcome.last_log_index, 15);
        assert!(windows.is_empty());
    }

    #[test]
    fn test_single_candidate_is_confirmed() {
        let (outcome, windows) = run(5, 5, 5, 9);
        assert_eq!(outcome.last_log_index, 5);
        assert_eq!(windows.len(), 1);

        let (outcome, _) = run(5, 5, 4, 9);
        assert_eq!(outcome.last_log_index, 4);
    }

    proptest! {
        #[test]
        fn prop_converges_to_highest_agreement(
            first in 1u64..50,
            len in 0u64..200,
            extra in 1u64..50,
            agreed_offset in 0u64..250,
        ) {
            let last = first + len;
            // Agreement lies in [first - 1, last]; the leader disagrees at prev
            let agreed = (first - 1) + agreed_offset % (len + 2);
            let prev_log_index = agreed.max(first) + extra;

            let (outcome, windows) = run(first, last, agreed, prev_log_index);
            prop_assert_eq!(outcome.last_log_index, agreed.min(prev_log_index));

            let range = last.min(prev_log_index).saturating_sub(first) + 1;
            // Bisection plus the confirmation round
            let bound = 64 - (range - 1).leading_zeros() + 1;
            prop_assert!(outcome.rounds <= bound, "{} rounds for range {}", outcome.rounds, range);

            let mut previous: Option<NegotiationWindow> = None;
            for window in windows {
                prop_assert!(window.min_index <= window.midpoint_index);
                prop_assert!(window.midpoint_index <= window.max_index);
                if let Some(prev) = previous {
                    if prev.min_index < prev.max_index {
                        prop_assert!(window.max_index - window.min_index < prev.max_index - prev.min_index);
                    }
                }
                previous = Some(window);
            }
        }
    }
}
