//! In-memory price index.
//!
//! Rebuilt from the price table inside every report transaction; the table
//! is small and rebuilding keeps the index trivially consistent with the
//! transaction's snapshot.

use crate::storage::PriceRow;

/// The distinguished row pricing one fully used CPU core per minute.
pub const CPU_CORE_MODEL: &str = "CPU_CORE";

/// Resource-model -> per-minute price with exact and fuzzy lookup.
#[derive(Debug, Default)]
pub struct PriceIndex {
    rows: Vec<PriceRow>,
}

impl PriceIndex {
    pub fn new(rows: Vec<PriceRow>) -> Self {
        Self { rows }
    }

    /// Price for a resource model.
    ///
    /// An exact case-insensitive match wins; otherwise the longest
    /// case-insensitive substring match (either direction); otherwise no hit.
    pub fn price_of(&self, model: &str) -> Option<f64> {
        let needle = model.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        if let Some(row) = self
            .rows
            .iter()
            .find(|row| row.gpu_model.trim().to_lowercase() == needle)
        {
            return Some(row.price_per_minute);
        }

        // Fuzzy fallback: "A100" should match "NVIDIA A100-SXM4-80GB" and
        // vice versa. Longest stored model wins to prefer the most specific
        // entry.
        self.rows
            .iter()
            .filter(|row| {
                let stored = row.gpu_model.trim().to_lowercase();
                !stored.is_empty() && (needle.contains(&stored) || stored.contains(&needle))
            })
            .max_by_key(|row| row.gpu_model.trim().len())
            .map(|row| row.price_per_minute)
    }

    /// The CPU_CORE price, or the configured fallback when the row is absent.
    pub fn cpu_core_price(&self, fallback: f64) -> f64 {
        self.price_of(CPU_CORE_MODEL).unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> PriceIndex {
        PriceIndex::new(vec![
            PriceRow { gpu_model: "A100".into(), price_per_minute: 2.0 },
            PriceRow { gpu_model: "NVIDIA A100-SXM4-80GB".into(), price_per_minute: 3.0 },
            PriceRow { gpu_model: "RTX 4090".into(), price_per_minute: 1.0 },
            PriceRow { gpu_model: CPU_CORE_MODEL.into(), price_per_minute: 0.2 },
        ])
    }

    #[test]
    fn exact_match_wins_over_fuzzy() {
        assert_eq!(index().price_of("a100"), Some(2.0));
    }

    #[test]
    fn fuzzy_prefers_longest_stored_model() {
        // Both A100 rows substring-match; the more specific one is chosen.
        assert_eq!(index().price_of("NVIDIA A100-SXM4-80GB foo"), Some(3.0));
    }

    #[test]
    fn fuzzy_matches_in_either_direction() {
        assert_eq!(index().price_of("RTX 4090 Founders Edition"), Some(1.0));
    }

    #[test]
    fn unknown_model_misses() {
        assert_eq!(index().price_of("H200"), None);
        assert_eq!(index().price_of(""), None);
    }

    #[test]
    fn cpu_core_falls_back_when_absent() {
        let empty = PriceIndex::new(Vec::new());
        assert_eq!(empty.cpu_core_price(0.05), 0.05);
        assert_eq!(index().cpu_core_price(0.05), 0.2);
    }
}
