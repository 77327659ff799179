//! Candidate ranking
//!
//! `score = w_d * distance + w_r * rating + w_a * acceptance`, each component
//! normalized to [0, 1]. Ties are broken by driver id.

use std::cmp::Ordering;

use common::{DriverId, Location};
use config::ScoringWeights;
use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::clients::location::NearbyDriver;

const MAX_RATING: f64 = 5.0;

/// A driver that passed filtering, with the inputs needed for ranking
#[derive(Debug, Clone)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub location: Location,
    pub distance_meters: f64,
    pub rating: f64,
    pub acceptance_rate: f64,
}

impl Candidate {
    pub fn from_nearby(driver: &NearbyDriver, pickup: &Location, acceptance_rate: f64) -> Self {
        Self {
            driver_id: driver.driver_id,
            location: driver.location.clone(),
            distance_meters: driver.location.distance_meters_to(pickup),
            rating: driver.rating,
            acceptance_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub driver_id: DriverId,
    pub location: Location,
    pub distance_meters: f64,
    pub rating: f64,
    pub acceptance_rate: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoringWeights,
    max_radius_meters: f64,
}

impl Scorer {
    pub fn new(weights: ScoringWeights, max_radius_meters: f64) -> Self {
        Self {
            weights,
            max_radius_meters,
        }
    }

    pub fn max_radius_meters(&self) -> f64 {
        self.max_radius_meters
    }

    /// 1.0 at the pickup, 0.0 at or beyond the search radius
    pub fn distance_score(&self, distance_meters: f64) -> f64 {
        if self.max_radius_meters <= 0.0 {
            return 0.0;
        }
        (1.0 - distance_meters / self.max_radius_meters).clamp(0.0, 1.0)
    }

    pub fn rating_score(&self, rating: f64) -> f64 {
        (rating / MAX_RATING).clamp(0.0, 1.0)
    }

    pub fn acceptance_score(&self, acceptance_rate: f64) -> f64 {
        acceptance_rate.clamp(0.0, 1.0)
    }

    pub fn score(&self, candidate: &Candidate) -> f64 {
        self.weights.distance * self.distance_score(candidate.distance_meters)
            + self.weights.rating * self.rating_score(candidate.rating)
            + self.weights.acceptance * self.acceptance_score(candidate.acceptance_rate)
    }

    /// Highest score first, then lowest driver id; at most `limit` entries
    pub fn rank(&self, candidates: Vec<Candidate>, limit: usize) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|c| {
                let score = self.score(&c);
                ScoredCandidate {
                    driver_id: c.driver_id,
                    location: c.location,
                    distance_meters: c.distance_meters,
                    rating: c.rating,
                    acceptance_rate: c.acceptance_rate,
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| match OrderedFloat(b.score).cmp(&OrderedFloat(a.score)) {
            Ordering::Equal => a.driver_id.cmp(&b.driver_id),
            other => other,
        });
        scored.truncate(limit);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn scorer() -> Scorer {
        Scorer::new(ScoringWeights::default(), 5000.0)
    }

    fn candidate(distance: f64, rating: f64, acceptance: f64) -> Candidate {
        Candidate {
            driver_id: DriverId::new(),
            location: testing::pickup(),
            distance_meters: distance,
            rating,
            acceptance_rate: acceptance,
        }
    }

    #[test]
    fn test_closer_driver_outranks_better_acceptance() {
        let d1 = candidate(500.0, 4.9, 0.8);
        let d2 = candidate(2500.0, 4.5, 0.95);
        let (id1, id2) = (d1.driver_id, d2.driver_id);

        let ranked = scorer().rank(vec![d2, d1], 5);
        assert_eq!(ranked[0].driver_id, id1);
        assert_eq!(ranked[1].driver_id, id2);
        assert!((ranked[0].score - 0.906).abs() < 1e-9);
        assert!((ranked[1].score - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_components_are_clamped() {
        let s = scorer();
        assert_eq!(s.distance_score(0.0), 1.0);
        assert_eq!(s.distance_score(7000.0), 0.0);
        assert_eq!(s.rating_score(6.0), 1.0);
        assert_eq!(s.acceptance_score(-0.2), 0.0);

        let perfect = candidate(0.0, 5.0, 1.0);
        assert!((s.score(&perfect) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ties_break_on_driver_id() {
        let a = candidate(1000.0, 4.0, 0.5);
        let b = Candidate {
            driver_id: DriverId::new(),
            ..a.clone()
        };
        let mut expected = vec![a.driver_id, b.driver_id];
        expected.sort();

        let ranked = scorer().rank(vec![b, a], 5);
        let got: Vec<_> = ranked.iter().map(|c| c.driver_id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_rank_truncates() {
        let ranked = scorer().rank((0..8).map(|i| candidate(i as f64 * 100.0, 4.5, 0.9)).collect(), 3);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].distance_meters, 0.0);
    }
}
