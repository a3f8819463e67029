//! Resource usage accounting
//!
//! Tracks limit, current, and maximum for each of the three sandboxed
//! resources. The tracker is passive: it reports whether a charge fits, and
//! the caller decides how to fail (refusing an allocation, raising a guest
//! error, rejecting further output).

/// The resources a sandbox meters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageType {
    /// Bytes allocated by the engine
    Memory,
    /// Bytecode instructions executed since the last reset
    Instructions,
    /// Bytes committed to the output buffer
    Output,
}

/// The statistics kept per resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStat {
    /// Configured ceiling (0 = unbounded)
    Limit,
    /// Usage right now
    Current,
    /// High-water mark over the sandbox lifetime
    Maximum,
}

/// Fixed 3x3 matrix of usage counters
#[derive(Debug, Default)]
pub struct UsageTracker {
    usage: [[u64; 3]; 3],
}

impl UsageTracker {
    pub fn new() -> Self {
        UsageTracker::default()
    }

    /// Set the ceiling for a resource. 0 disables the check.
    pub fn set_limit(&mut self, utype: UsageType, limit: u64) {
        self.usage[utype as usize][UsageStat::Limit as usize] = limit;
    }

    /// Read a single counter.
    pub fn get(&self, utype: UsageType, stat: UsageStat) -> u64 {
        self.usage[utype as usize][stat as usize]
    }

    /// Overwrite the current value, folding it into the high-water mark.
    pub fn set_current(&mut self, utype: UsageType, value: u64) {
        let row = &mut self.usage[utype as usize];
        row[UsageStat::Current as usize] = value;
        if value > row[UsageStat::Maximum as usize] {
            row[UsageStat::Maximum as usize] = value;
        }
    }

    /// Apply a signed delta to the current value. Returns false when the
    /// charge would push usage past a nonzero limit; counters are untouched
    /// in that case.
    pub fn charge(&mut self, utype: UsageType, delta: i64) -> bool {
        let row = &mut self.usage[utype as usize];
        let current = row[UsageStat::Current as usize];
        let projected = if delta < 0 {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta as u64)
        };
        let limit = row[UsageStat::Limit as usize];
        if limit != 0 && projected > limit {
            return false;
        }
        row[UsageStat::Current as usize] = projected;
        if projected > row[UsageStat::Maximum as usize] {
            row[UsageStat::Maximum as usize] = projected;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_within_limit() {
        let mut tracker = UsageTracker::new();
        tracker.set_limit(UsageType::Memory, 1000);

        assert!(tracker.charge(UsageType::Memory, 500));
        assert!(tracker.charge(UsageType::Memory, 400));
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Current), 900);

        // Would exceed the limit; counters unchanged
        assert!(!tracker.charge(UsageType::Memory, 200));
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Current), 900);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let mut tracker = UsageTracker::new();
        assert!(tracker.charge(UsageType::Output, i64::MAX / 2));
    }

    #[test]
    fn test_maximum_is_monotone() {
        let mut tracker = UsageTracker::new();
        tracker.set_current(UsageType::Memory, 800);
        tracker.set_current(UsageType::Memory, 100);
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Current), 100);
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Maximum), 800);

        tracker.set_current(UsageType::Memory, 0);
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Maximum), 800);
    }

    #[test]
    fn test_negative_charge_releases() {
        let mut tracker = UsageTracker::new();
        tracker.set_limit(UsageType::Memory, 100);
        assert!(tracker.charge(UsageType::Memory, 80));
        assert!(tracker.charge(UsageType::Memory, -30));
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Current), 50);
        assert_eq!(tracker.get(UsageType::Memory, UsageStat::Maximum), 80);
    }
}
