use serde::Deserialize;

/// Resource ceilings for one container. A zero field leaves the kernel
/// default in place. Values are immutable once constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitSpec {
    memory_bytes: u64,
    cpu_shares: u64,
    cpu_quota_us: u64,
    pids_max: u64,
}

impl LimitSpec {
    pub fn new(memory_bytes: u64, cpu_shares: u64, cpu_quota_us: u64, pids_max: u64) -> Self {
        Self {
            memory_bytes,
            cpu_shares,
            cpu_quota_us,
            pids_max,
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn cpu_shares(&self) -> u64 {
        self.cpu_shares
    }

    /// CPU runtime budget in microseconds per 100 ms period.
    pub fn cpu_quota_us(&self) -> u64 {
        self.cpu_quota_us
    }

    pub fn pids_max(&self) -> u64 {
        self.pids_max
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }
}
