use rand::Rng;
use shardgate_common::{Credential, UsageCounts};

/// An eligible credential with its usage counters, presented to the selection strategy.
pub struct Candidate<'a> {
    pub credential: &'a Credential,
    pub usage: UsageCounts,
}

/// Trait for pluggable selection strategies.
/// The Pool filters candidates (status, busy flag, spacing, quota, endpoint)
/// and picks the tier, then delegates the choice inside that tier.
pub trait SelectionStrategy: Send + Sync {
    /// Select one candidate from the list. Returns the index into `candidates`.
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;

    /// Human-readable name for logging / metrics.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// RandomPick: uniform choice (default)
// ---------------------------------------------------------------------------

pub struct RandomPick;

impl SelectionStrategy for RandomPick {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// LeastUsed: lowest total usage, first seen wins ties
// ---------------------------------------------------------------------------

pub struct LeastUsed;

impl SelectionStrategy for LeastUsed {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        let mut best_idx: Option<usize> = None;
        let mut best_total = u64::MAX;

        for (i, c) in candidates.iter().enumerate() {
            if c.usage.total < best_total {
                best_total = c.usage.total;
                best_idx = Some(i);
            }
        }

        best_idx
    }

    fn name(&self) -> &'static str {
        "least_used"
    }
}

/// Parse a strategy name string into a boxed strategy.
pub fn parse_strategy(name: &str) -> Result<Box<dyn SelectionStrategy>, String> {
    match name {
        "random" => Ok(Box::new(RandomPick)),
        "least_used" => Ok(Box::new(LeastUsed)),
        other => Err(format!(
            "unknown selection strategy '{}', available: random, least_used",
            other
        )),
    }
}
