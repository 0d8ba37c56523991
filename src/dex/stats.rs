//! Venue reliability ranking
//!
//! Per (network, venue) success/fail counts, updated atomically on swap
//! outcomes and quote failures. Score = success / (success + fail + 1);
//! the +1 keeps unproven venues below proven ones.

use dashmap::DashMap;

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    success: u64,
    fail: u64,
}

#[derive(Default)]
pub struct VenueStats {
    counts: DashMap<(String, String), Counts>,
}

impl VenueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, network: &str, venue: &str) {
        self.counts
            .entry((network.to_string(), venue.to_string()))
            .or_default()
            .success += 1;
    }

    pub fn record_fail(&self, network: &str, venue: &str) {
        self.counts
            .entry((network.to_string(), venue.to_string()))
            .or_default()
            .fail += 1;
    }

    pub fn score(&self, network: &str, venue: &str) -> f64 {
        let c = self
            .counts
            .get(&(network.to_string(), venue.to_string()))
            .map(|r| *r.value())
            .unwrap_or_default();
        c.success as f64 / (c.success + c.fail + 1) as f64
    }

    /// Order venue names by score descending, name ascending for equal
    /// scores so the result is deterministic.
    pub fn ranked(&self, network: &str, venues: &[String]) -> Vec<String> {
        let mut out: Vec<(String, f64)> = venues
            .iter()
            .map(|v| (v.clone(), self.score(network, v)))
            .collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out.into_iter().map(|(v, _)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_starts_at_zero() {
        let stats = VenueStats::new();
        assert_eq!(stats.score("TON", "dedust"), 0.0);
    }

    #[test]
    fn test_score_rises_with_successes() {
        let stats = VenueStats::new();
        stats.record_success("TON", "dedust");
        stats.record_success("TON", "dedust");
        stats.record_fail("TON", "dedust");
        // 2 / (2 + 1 + 1)
        assert_eq!(stats.score("TON", "dedust"), 0.5);
    }

    #[test]
    fn test_ranked_orders_by_score_then_name() {
        let stats = VenueStats::new();
        stats.record_success("TON", "ston.fi");
        let venues = vec![
            "dedust".to_string(),
            "ston.fi".to_string(),
            "aqua".to_string(),
        ];
        let ranked = stats.ranked("TON", &venues);
        // ston.fi has a success; dedust/aqua tie at 0 and fall back to name
        assert_eq!(ranked, vec!["ston.fi", "aqua", "dedust"]);
    }

    #[test]
    fn test_stats_are_per_network() {
        let stats = VenueStats::new();
        stats.record_success("TON", "ston.fi");
        assert_eq!(stats.score("SOLANA", "ston.fi"), 0.0);
    }
}
