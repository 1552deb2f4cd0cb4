//! Pressure policies decide when fast-tier pages migrate out

/// Tier occupancy at the moment a migration decision is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureSnapshot {
    /// Bytes currently resident in the fast tier
    pub fast_used: usize,
    /// Fast-tier budget
    pub fast_capacity: usize,
    /// Bytes about to enter the fast tier
    pub incoming: usize,
    /// Bytes held by the slow tier
    pub slow_used: usize,
    /// Slow-tier capacity
    pub slow_capacity: usize,
    /// Whether this relief pass has already migrated a page
    pub in_progress: bool,
}

impl PressureSnapshot {
    /// Fast-tier bytes once the incoming allocation lands
    pub fn projected(&self) -> usize {
        self.fast_used.saturating_add(self.incoming)
    }
}

/// Decides whether one more unpinned page should leave the fast tier
pub trait PressurePolicy: Send + Sync + std::fmt::Debug {
    /// Called repeatedly during a relief pass until it returns `false`
    fn should_migrate(&self, snapshot: &PressureSnapshot) -> bool;
}

/// Migrate only as much as the incoming bytes need
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityPolicy;

impl PressurePolicy for CapacityPolicy {
    fn should_migrate(&self, snapshot: &PressureSnapshot) -> bool {
        snapshot.projected() > snapshot.fast_capacity
    }
}

/// Hysteresis between two fractions of the fast-tier budget.
///
/// A pass starts once projected usage exceeds `high` and continues until it
/// is at or below `low`.
#[derive(Debug, Clone, Copy)]
pub struct WatermarkPolicy {
    high: f64,
    low: f64,
}

impl WatermarkPolicy {
    /// Creates a policy; `low` is clamped to at most `high`
    pub fn new(high: f64, low: f64) -> Self {
        Self { high, low: low.min(high) }
    }
}

impl PressurePolicy for WatermarkPolicy {
    fn should_migrate(&self, snapshot: &PressureSnapshot) -> bool {
        let fraction = if snapshot.in_progress { self.low } else { self.high };
        let threshold = (snapshot.fast_capacity as f64 * fraction) as usize;
        snapshot.projected() > threshold
    }
}

/// Never migrates; registrations beyond the budget go straight to the slow tier
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverMigrate;

impl PressurePolicy for NeverMigrate {
    fn should_migrate(&self, _snapshot: &PressureSnapshot) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(fast_used: usize, incoming: usize, in_progress: bool) -> PressureSnapshot {
        PressureSnapshot {
            fast_used,
            fast_capacity: 1000,
            incoming,
            slow_used: 0,
            slow_capacity: 10_000,
            in_progress,
        }
    }

    #[test]
    fn test_capacity_policy() {
        assert!(!CapacityPolicy.should_migrate(&snapshot(600, 400, false)));
        assert!(CapacityPolicy.should_migrate(&snapshot(601, 400, false)));
    }

    #[test]
    fn test_watermark_hysteresis() {
        let policy = WatermarkPolicy::new(0.9, 0.5);
        assert!(!policy.should_migrate(&snapshot(800, 0, false)));
        assert!(policy.should_migrate(&snapshot(950, 0, false)));
        // Once started, keep going below the high mark
        assert!(policy.should_migrate(&snapshot(800, 0, true)));
        assert!(!policy.should_migrate(&snapshot(500, 0, true)));
    }

    #[test]
    fn test_never_migrate() {
        assert!(!NeverMigrate.should_migrate(&snapshot(5000, 5000, true)));
    }
}
