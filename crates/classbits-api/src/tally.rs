//! Majority voting over a fixed electorate.

use classbits_types::api::VotingProgress;
use classbits_types::models::{Vote, VoteChoice};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub yes: usize,
    pub no: usize,
    pub eligible: usize,
    pub threshold: usize,
    pub decision: Decision,
}

impl Tally {
    pub fn progress(&self) -> VotingProgress {
        VotingProgress {
            yes_votes: self.yes,
            no_votes: self.no,
            total_votes: self.yes + self.no,
            total_eligible_voters: self.eligible,
            majority_threshold: self.threshold,
            needs_more_votes: self.decision == Decision::Pending,
        }
    }
}

/// Count `votes` cast by members of `eligible`; anything else is ignored.
///
/// The threshold is `ceil(eligible / 2)`. A no majority is checked first, so
/// a tie on an even electorate rejects. With nobody eligible the decision
/// stays pending.
pub fn tally(eligible: &[Uuid], votes: &[Vote]) -> Tally {
    let (mut yes, mut no) = (0, 0);
    for vote in votes.iter().filter(|v| eligible.contains(&v.voter)) {
        match vote.choice {
            VoteChoice::Yes => yes += 1,
            VoteChoice::No => no += 1,
        }
    }

    let threshold = eligible.len().div_ceil(2);
    let decision = if eligible.is_empty() {
        Decision::Pending
    } else if no >= threshold {
        Decision::Reject
    } else if yes >= threshold {
        Decision::Approve
    } else {
        Decision::Pending
    };

    Tally {
        yes,
        no,
        eligible: eligible.len(),
        threshold,
        decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(voter: Uuid, choice: VoteChoice) -> Vote {
        Vote { voter, choice }
    }

    fn voters(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn four_voters_need_two() {
        let v = voters(4);
        let t = tally(&v, &[ballot(v[0], VoteChoice::Yes)]);
        assert_eq!(t.threshold, 2);
        assert_eq!(t.decision, Decision::Pending);

        let t = tally(&v, &[ballot(v[0], VoteChoice::Yes), ballot(v[1], VoteChoice::Yes)]);
        assert_eq!(t.decision, Decision::Approve);
        assert!(!t.progress().needs_more_votes);
    }

    #[test]
    fn odd_electorate_rounds_up() {
        let v = voters(3);
        assert_eq!(tally(&v, &[]).threshold, 2);
        let t = tally(&v, &[ballot(v[0], VoteChoice::No), ballot(v[1], VoteChoice::No)]);
        assert_eq!(t.decision, Decision::Reject);
    }

    #[test]
    fn no_majority_wins_a_tie() {
        let v = voters(2);
        let t = tally(&v, &[ballot(v[0], VoteChoice::Yes), ballot(v[1], VoteChoice::No)]);
        assert_eq!(t.decision, Decision::Reject);
    }

    #[test]
    fn outsiders_are_not_counted() {
        let v = voters(3);
        let outsider = Uuid::new_v4();
        let t = tally(
            &v,
            &[
                ballot(outsider, VoteChoice::Yes),
                ballot(v[0], VoteChoice::Yes),
            ],
        );
        assert_eq!(t.yes, 1);
        assert_eq!(t.decision, Decision::Pending);
        assert_eq!(t.progress().total_votes, 1);
    }

    #[test]
    fn empty_electorate_never_decides() {
        let t = tally(&[], &[ballot(Uuid::new_v4(), VoteChoice::Yes)]);
        assert_eq!(t.threshold, 0);
        assert_eq!(t.decision, Decision::Pending);
        assert!(t.progress().needs_more_votes);
    }

    #[test]
    fn adding_a_yes_never_flips_an_approval() {
        let v = voters(5);
        let mut votes = vec![
            ballot(v[0], VoteChoice::Yes),
            ballot(v[1], VoteChoice::Yes),
            ballot(v[2], VoteChoice::Yes),
        ];
        assert_eq!(tally(&v, &votes).decision, Decision::Approve);
        votes.push(ballot(v[3], VoteChoice::Yes));
        assert_eq!(tally(&v, &votes).decision, Decision::Approve);
    }
}
