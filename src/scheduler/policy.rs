/*
 * Scheduling Policy Selection
 */

/// Selection discipline the scheduler runs under. Fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    /// First-come first-served among ready threads, preempted on a fixed
    /// time slice.
    #[default]
    RoundRobin,
    /// Multi-level feedback queue. The flag is accepted and recorded and
    /// its per-thread knobs (niceness, recent CPU, load average) are
    /// readable, but the accounting behind them is not implemented and
    /// selection still follows the round-robin order.
    Mlfqs,
}

impl SchedPolicy {
    pub fn is_mlfqs(self) -> bool {
        matches!(self, SchedPolicy::Mlfqs)
    }
}
