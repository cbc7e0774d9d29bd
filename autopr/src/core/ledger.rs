//! Cost and token accounting.
//!
//! A ledger is a plain value owned by whoever is accumulating: each cycle owns
//! one, and the session total is built by absorbing finished cycle ledgers.
//! Concurrent workers therefore never share a counter.

use serde::{Deserialize, Serialize};

use crate::core::types::Usage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub runs: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost_usd: f64,
}

impl CostLedger {
    /// Fold one agent run's usage into the ledger.
    pub fn record(&mut self, usage: &Usage) {
        self.runs = self.runs.saturating_add(1);
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(usage.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(usage.cache_write_tokens);
        self.cost_usd += usage.cost_usd.max(0.0);
    }

    /// Add another ledger's totals into this one.
    pub fn absorb(&mut self, other: &CostLedger) {
        self.runs = self.runs.saturating_add(other.runs);
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(other.cache_write_tokens);
        self.cost_usd += other.cost_usd;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, cost: f64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cost_usd: cost,
            ..Usage::default()
        }
    }

    #[test]
    fn record_accumulates_runs_and_cost() {
        let mut ledger = CostLedger::default();
        ledger.record(&usage(100, 20, 0.25));
        ledger.record(&usage(50, 5, 0.5));
        assert_eq!(ledger.runs, 2);
        assert_eq!(ledger.input_tokens, 150);
        assert_eq!(ledger.output_tokens, 25);
        assert!((ledger.cost_usd - 0.75).abs() < 1e-9);
        assert_eq!(ledger.total_tokens(), 175);
    }

    #[test]
    fn negative_cost_is_ignored() {
        let mut ledger = CostLedger::default();
        ledger.record(&usage(1, 1, -3.0));
        assert_eq!(ledger.cost_usd, 0.0);
        assert_eq!(ledger.runs, 1);
    }

    #[test]
    fn absorb_keeps_ledgers_independent() {
        let mut a = CostLedger::default();
        a.record(&usage(10, 1, 0.1));
        let mut b = CostLedger::default();
        b.record(&usage(20, 2, 0.2));

        let mut total = CostLedger::default();
        total.absorb(&a);
        total.absorb(&b);
        assert_eq!(total.runs, 2);
        assert_eq!(total.input_tokens, 30);
        assert_eq!(a.runs, 1);
        assert_eq!(b.input_tokens, 20);
    }
}
