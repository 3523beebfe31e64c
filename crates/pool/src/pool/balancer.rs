//! Worker selection policies

use rand::seq::SliceRandom;

use crate::config::LoadBalancing;

/// An idle worker that can take a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    /// Position in the worker table
    pub slot: usize,
    pub tasks_completed: u64,
}

/// Picks the idle worker for the next task
#[derive(Debug)]
pub(crate) struct LoadBalancer {
    policy: LoadBalancing,
    cursor: usize,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancing) -> Self {
        Self { policy, cursor: 0 }
    }

    /// Select a slot among `candidates`, which are in table order
    pub fn select(&mut self, candidates: &[Candidate]) -> Option<usize> {
        match self.policy {
            LoadBalancing::LeastBusy => candidates
                .iter()
                .min_by_key(|c| c.tasks_completed)
                .map(|c| c.slot),
            LoadBalancing::Random => candidates
                .choose(&mut rand::thread_rng())
                .map(|c| c.slot),
            LoadBalancing::RoundRobin => {
                let picked = candidates
                    .iter()
                    .find(|c| c.slot >= self.cursor)
                    .or_else(|| candidates.first())?;
                self.cursor = picked.slot + 1;
                Some(picked.slot)
            }
        }
    }

    /// Keep the rotation stable when the worker at `slot` leaves the table
    pub fn slot_removed(&mut self, slot: usize) {
        if slot < self.cursor {
            self.cursor -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(completed: &[(usize, u64)]) -> Vec<Candidate> {
        completed
            .iter()
            .map(|&(slot, tasks_completed)| Candidate {
                slot,
                tasks_completed,
            })
            .collect()
    }

    #[test]
    fn test_least_busy_ties_go_to_first() {
        let mut lb = LoadBalancer::new(LoadBalancing::LeastBusy);
        assert_eq!(lb.select(&candidates(&[(0, 3), (1, 1), (2, 1)])), Some(1));
        assert_eq!(lb.select(&candidates(&[(0, 0), (1, 0)])), Some(0));
        assert_eq!(lb.select(&[]), None);
    }

    #[test]
    fn test_round_robin_rotates() {
        let mut lb = LoadBalancer::new(LoadBalancing::RoundRobin);
        let all = candidates(&[(0, 0), (1, 0), (2, 0)]);
        let picks: Vec<usize> = (0..5).filter_map(|_| lb.select(&all)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_round_robin_skips_busy_slots() {
        let mut lb = LoadBalancer::new(LoadBalancing::RoundRobin);
        assert_eq!(lb.select(&candidates(&[(0, 0), (2, 0)])), Some(0));
        assert_eq!(lb.select(&candidates(&[(0, 0), (2, 0)])), Some(2));
        assert_eq!(lb.select(&candidates(&[(0, 0), (1, 0)])), Some(0));
    }

    #[test]
    fn test_round_robin_after_removal() {
        let mut lb = LoadBalancer::new(LoadBalancing::RoundRobin);
        let all = candidates(&[(0, 0), (1, 0), (2, 0)]);
        assert_eq!(lb.select(&all), Some(0));
        assert_eq!(lb.select(&all), Some(1));
        lb.slot_removed(0);
        // old slot 2 is now slot 1
        assert_eq!(lb.select(&candidates(&[(0, 0), (1, 0)])), Some(1));
    }

    #[test]
    fn test_random_picks_a_candidate() {
        let mut lb = LoadBalancer::new(LoadBalancing::Random);
        let all = candidates(&[(3, 0), (5, 0)]);
        for _ in 0..20 {
            let slot = lb.select(&all).unwrap();
            assert!(slot == 3 || slot == 5);
        }
    }
}
