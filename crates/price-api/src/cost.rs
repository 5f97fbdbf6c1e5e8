use std::sync::atomic::{AtomicU64, Ordering};

/// CostMeter accrues the cost of calls made against the vendor API.
///
/// The meter is owned by whoever assembles the service and is injected
/// into each collaborator which spends against it. Cost is tracked in
/// integer cents so accrual stays exact, and is rendered as decimal
/// dollars only at the edge.
pub struct CostMeter {
    cents: AtomicU64,
}

impl CostMeter {
    pub fn new() -> Self {
        Self {
            cents: AtomicU64::new(0),
        }
    }

    /// Record an accrued charge.
    pub fn charge_cents(&self, cents: u64) {
        self.cents.fetch_add(cents, Ordering::Relaxed);
    }

    /// Total accrued cost in cents.
    pub fn total_cents(&self) -> u64 {
        self.cents.load(Ordering::Relaxed)
    }

    /// Total accrued cost as a two-decimal dollar string, like "0.03".
    pub fn total_dollars(&self) -> String {
        let cents = self.total_cents();
        format!("{}.{:02}", cents / 100, cents % 100)
    }

    /// Reset accrued cost to zero.
    pub fn clear(&self) {
        self.cents.store(0, Ordering::Relaxed);
    }
}

impl Default for CostMeter {
    fn default() -> Self {
        Self::new()
    }
}
