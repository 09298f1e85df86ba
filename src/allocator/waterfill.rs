//! Tiered Water-Filling
//!
//! Distributes `amount` units across participants that join in tiers. Every active
//! participant takes units in lockstep; taking a unit moves its level up by one, so
//! once the active group reaches the level of the next tier, that tier joins in.
//! A participant leaves when its capacity is used up.
//!
//! Each round either retires exhausted participants or applies one uniform step
//! `alpha = min(smallest remaining capacity, amount / active, distance to next tier)`
//! through `PriorityAccumulator::add_to_all`, giving O(n log n) total work instead
//! of a unit-by-unit simulation. When fewer units remain than active participants,
//! one unit each goes to the participants with the least remaining capacity.

use super::accumulator::PriorityAccumulator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    /// Starting level. Lower levels are served first.
    pub level: u64,
    /// Most units this participant can take.
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillOutcome {
    /// Units taken per participant, in processing order.
    pub taken: Vec<(String, u64)>,
    /// Units nobody could take.
    pub leftover: u64,
}

/// Runs the water-filling pass. Participants with equal level keep their relative
/// order.
pub fn water_fill(mut participants: Vec<Participant>, mut amount: u64) -> FillOutcome {
    participants.sort_by_key(|p| p.level);
    // Remaining capacity lives in an i64 heap.
    for p in &mut participants {
        p.capacity = p.capacity.min(i64::MAX as u64);
    }

    let n = participants.len();
    let mut taken = vec![0u64; n];
    let mut heap: PriorityAccumulator<usize> = PriorityAccumulator::new();
    let mut next = 0;
    let mut level = participants.first().map(|p| p.level).unwrap_or(0);

    while amount > 0 {
        while next < n && participants[next].level <= level {
            heap.push(next, participants[next].capacity as i64);
            next += 1;
        }

        while heap.min_val() == Some(0) {
            if let Some((idx, _)) = heap.pop() {
                taken[idx] = participants[idx].capacity;
            }
        }

        let Some(min_remaining) = heap.min_val() else {
            if next == n {
                break;
            }
            level = participants[next].level;
            continue;
        };

        let active = heap.size() as u64;
        let distance = if next < n {
            participants[next].level - level
        } else {
            u64::MAX
        };
        let alpha = (min_remaining as u64).min(amount / active).min(distance);

        if alpha == 0 {
            // amount < active here: hand out the tail one unit at a time
            for _ in 0..amount {
                if let Some((idx, remaining)) = heap.pop() {
                    taken[idx] = participants[idx].capacity - remaining as u64 + 1;
                }
            }
            amount = 0;
            break;
        }

        heap.add_to_all(-(alpha as i64));
        amount -= alpha * active;
        level = level.saturating_add(alpha);
    }

    for (idx, remaining) in heap.drain() {
        taken[idx] = participants[idx].capacity - remaining as u64;
    }

    FillOutcome {
        taken: participants
            .into_iter()
            .zip(taken)
            .map(|(p, units)| (p.id, units))
            .collect(),
        leftover: amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str, level: u64, capacity: u64) -> Participant {
        Participant {
            id: id.to_string(),
            level,
            capacity,
        }
    }

    fn units(outcome: &FillOutcome, id: &str) -> u64 {
        outcome
            .taken
            .iter()
            .find(|(pid, _)| pid == id)
            .map(|(_, units)| *units)
            .unwrap_or(0)
    }

    #[test]
    fn test_single_tier_splits_evenly() {
        let outcome = water_fill(
            vec![
                participant("a", 0, 10),
                participant("b", 0, 10),
                participant("c", 0, 10),
            ],
            9,
        );
        assert_eq!(outcome.leftover, 0);
        for id in ["a", "b", "c"] {
            assert_eq!(units(&outcome, id), 3);
        }
    }

    #[test]
    fn test_small_capacity_frees_surplus_for_others() {
        let outcome = water_fill(
            vec![
                participant("a", 0, 1),
                participant("b", 0, 10),
                participant("c", 0, 10),
            ],
            9,
        );
        assert_eq!(units(&outcome, "a"), 1);
        assert_eq!(units(&outcome, "b"), 4);
        assert_eq!(units(&outcome, "c"), 4);
    }

    #[test]
    fn test_lower_tier_levels_up_before_next_tier_joins() {
        let outcome = water_fill(
            vec![participant("low", 0, 10), participant("high", 3, 10)],
            5,
        );
        // low takes 3 alone, then both share the last 2
        assert_eq!(units(&outcome, "low"), 4);
        assert_eq!(units(&outcome, "high"), 1);
    }

    #[test]
    fn test_leftover_when_capacity_runs_out() {
        let outcome = water_fill(
            vec![participant("a", 0, 2), participant("b", 7, 3)],
            10,
        );
        assert_eq!(units(&outcome, "a"), 2);
        assert_eq!(units(&outcome, "b"), 3);
        assert_eq!(outcome.leftover, 5);
    }

    #[test]
    fn test_zero_amount_and_empty_input() {
        let outcome = water_fill(vec![participant("a", 0, 5)], 0);
        assert_eq!(units(&outcome, "a"), 0);

        let outcome = water_fill(vec![], 4);
        assert!(outcome.taken.is_empty());
        assert_eq!(outcome.leftover, 4);
    }

    #[test]
    fn test_huge_capacity_is_not_wrapped() {
        let outcome = water_fill(
            vec![participant("a", 0, u64::MAX), participant("b", 0, u64::MAX / 2 + 10)],
            7,
        );
        assert_eq!(units(&outcome, "a") + units(&outcome, "b"), 7);
        assert!(units(&outcome, "a") >= 3);
        assert!(units(&outcome, "b") >= 3);
        assert_eq!(outcome.leftover, 0);
    }

    #[test]
    fn test_top_level_tier_does_not_overflow() {
        let outcome = water_fill(
            vec![participant("a", 1, 2), participant("pool", u64::MAX, 100)],
            50,
        );
        assert_eq!(units(&outcome, "a"), 2);
        assert_eq!(units(&outcome, "pool"), 48);
        assert_eq!(outcome.leftover, 0);
    }
}
