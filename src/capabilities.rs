use anyhow::{Context, Result};
use caps::{CapSet, CapsHashSet};

/// Reads, logs and drops the capability sets of the calling thread.
#[derive(Debug, Default)]
pub(crate) struct CapabilityManager;

impl CapabilityManager {
    /// Cleared in this order: a set may only shrink while it still covers the ones after it.
    const CLEARED_SETS: [CapSet; 4] = [
        CapSet::Ambient,
        CapSet::Effective,
        CapSet::Inheritable,
        CapSet::Permitted,
    ];

    /// Get the current snapshot of all capability sets
    pub fn current() -> Result<CapabilitySnapshot> {
        Ok(CapabilitySnapshot {
            effective: Self::read_capability_set(CapSet::Effective)
                .context("Failed to read effective capabilities")?,
            permitted: Self::read_capability_set(CapSet::Permitted)
                .context("Failed to read permitted capabilities")?,
            inheritable: Self::read_capability_set(CapSet::Inheritable)
                .context("Failed to read inheritable capabilities")?,
            bounding: Self::read_capability_set(CapSet::Bounding)
                .context("Failed to read bounding capabilities")?,
            ambient: Self::read_capability_set(CapSet::Ambient)
                .context("Failed to read ambient capabilities")?,
        })
    }

    /// Leaves the thread with no capabilities at all, bounding set included.
    ///
    /// The bounding set goes first because shrinking it needs `CAP_SETPCAP`
    /// in the effective set.
    pub fn drop_all(&self) -> Result<()> {
        self.drop_all_bounding_capabilities()?;

        for cap_set in Self::CLEARED_SETS {
            caps::clear(None, cap_set)
                .with_context(|| format!("Failed to clear {:?} capability set", cap_set))?;
        }

        Ok(())
    }

    /// Drop all capabilities from the bounding set
    pub fn drop_all_bounding_capabilities(&self) -> Result<()> {
        let bounding_caps = Self::read_capability_set(CapSet::Bounding)?;

        for capability in bounding_caps {
            caps::drop(None, CapSet::Bounding, capability).with_context(|| {
                format!("Failed to drop bounding capability: {}", capability)
            })?;
        }

        Ok(())
    }

    fn read_capability_set(cap_set: CapSet) -> Result<CapsHashSet> {
        caps::read(None, cap_set).context(format!("Failed to read {:?} capability set", cap_set))
    }
}

/// Represents the current state of process capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub effective: CapsHashSet,
    pub permitted: CapsHashSet,
    pub inheritable: CapsHashSet,
    pub bounding: CapsHashSet,
    pub ambient: CapsHashSet,
}

impl CapabilitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.effective.is_empty()
            && self.permitted.is_empty()
            && self.inheritable.is_empty()
            && self.bounding.is_empty()
            && self.ambient.is_empty()
    }
}

impl std::fmt::Display for CapabilitySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capabilities - ")?;
        write!(f, "Effective: {}, ", self.effective.len())?;
        write!(f, "Permitted: {}, ", self.permitted.len())?;
        write!(f, "Inheritable: {}, ", self.inheritable.len())?;
        write!(f, "Bounding: {}, ", self.bounding.len())?;
        write!(f, "Ambient: {}", self.ambient.len())
    }
}

#[macro_export]
macro_rules! log_capability_snapshot {
    ($label:literal) => {{
        match $crate::capabilities::CapabilityManager::current() {
            Ok(snapshot) => tracing::debug!(%snapshot, $label),
            Err(error) => tracing::debug!(%error, "capability snapshot unavailable"),
        }
    }};
}

pub(crate) fn has_any_permitted_capabilities() -> Result<bool> {
    let capabilities = CapabilityManager::read_capability_set(CapSet::Permitted)?;
    Ok(!capabilities.is_empty())
}
