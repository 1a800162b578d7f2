//! CPU placement for the driver's three agent threads.
//!
//! Receiver and Sender sit on the data path and get their own physical cores
//! first. The Conductor polls a handful of queues per cycle and backs off when
//! idle, so it is pinned only when a third physical core is free.

use core_affinity::CoreId;

/// The agent a thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Conductor,
    Sender,
    Receiver,
}

impl AgentRole {
    /// Thread name used when the agent is spawned.
    #[must_use]
    pub const fn thread_name(self) -> &'static str {
        match self {
            Self::Conductor => "tern-conductor",
            Self::Sender => "tern-sender",
            Self::Receiver => "tern-receiver",
        }
    }
}

/// Cores visible to this process.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    pub logical_cores: usize,
    pub physical_cores: usize,
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            available_cores,
        }
    }

    #[must_use]
    pub const fn has_smt(&self) -> bool {
        self.logical_cores > self.physical_cores
    }

    /// Picks cores assuming low ids enumerate distinct physical cores first.
    #[must_use]
    pub fn select_placement(&self) -> ThreadPlacement {
        let core = |i: usize| self.available_cores.get(i).copied();
        match self.physical_cores {
            n if n >= 3 => ThreadPlacement {
                receiver: core(0),
                sender: core(1),
                conductor: core(2),
                strategy: PlacementStrategy::Dedicated,
            },
            2 => ThreadPlacement {
                receiver: core(0),
                sender: core(1),
                conductor: None,
                strategy: PlacementStrategy::FloatingConductor,
            },
            1 if self.has_smt() => ThreadPlacement {
                receiver: core(0),
                sender: core(1),
                conductor: None,
                strategy: PlacementStrategy::FloatingConductor,
            },
            _ => ThreadPlacement::unpinned(),
        }
    }
}

/// Core assignment per agent; `None` leaves the thread to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPlacement {
    pub receiver: Option<usize>,
    pub sender: Option<usize>,
    pub conductor: Option<usize>,
    pub strategy: PlacementStrategy,
}

impl ThreadPlacement {
    #[must_use]
    pub const fn unpinned() -> Self {
        Self {
            receiver: None,
            sender: None,
            conductor: None,
            strategy: PlacementStrategy::NoPin,
        }
    }

    #[must_use]
    pub const fn core_for(&self, role: AgentRole) -> Option<usize> {
        match role {
            AgentRole::Conductor => self.conductor,
            AgentRole::Sender => self.sender,
            AgentRole::Receiver => self.receiver,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Each agent on its own physical core.
    Dedicated,
    /// Receiver and Sender pinned, Conductor left to the scheduler.
    FloatingConductor,
    NoPin,
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Dedicated => "dedicated",
            Self::FloatingConductor => "floating-conductor",
            Self::NoPin => "no-pin",
            Self::Manual => "manual",
        })
    }
}

/// How agent threads are pinned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CpuConfig {
    #[default]
    Auto,
    Manual {
        receiver: Option<usize>,
        sender: Option<usize>,
        conductor: Option<usize>,
    },
    Disabled,
}

impl CpuConfig {
    #[must_use]
    pub fn resolve(&self) -> ThreadPlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(),
            Self::Manual {
                receiver,
                sender,
                conductor,
            } => ThreadPlacement {
                receiver: *receiver,
                sender: *sender,
                conductor: *conductor,
                strategy: PlacementStrategy::Manual,
            },
            Self::Disabled => ThreadPlacement::unpinned(),
        }
    }
}

/// Pins the calling thread. `false` if the OS refused or the id is invalid.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_returns_sane_counts() {
        let topo = CpuTopology::detect();
        assert!(topo.logical_cores > 0);
        assert!(topo.physical_cores > 0);
        assert!(topo.logical_cores >= topo.physical_cores);
        assert!(!topo.available_cores.is_empty());
    }

    #[test]
    fn placement_uses_available_cores() {
        let topo = CpuTopology::detect();
        let placement = topo.select_placement();
        for role in [AgentRole::Conductor, AgentRole::Sender, AgentRole::Receiver] {
            if let Some(core) = placement.core_for(role) {
                assert!(topo.available_cores.contains(&core), "{role:?} on {core}");
            }
        }
    }

    #[test]
    fn three_physical_cores_dedicate_each_agent() {
        let topo = CpuTopology {
            logical_cores: 4,
            physical_cores: 4,
            available_cores: vec![0, 1, 2, 3],
        };
        let placement = topo.select_placement();
        assert_eq!(placement.strategy, PlacementStrategy::Dedicated);
        assert_eq!(placement.core_for(AgentRole::Receiver), Some(0));
        assert_eq!(placement.core_for(AgentRole::Sender), Some(1));
        assert_eq!(placement.core_for(AgentRole::Conductor), Some(2));
    }

    #[test]
    fn single_core_without_smt_is_unpinned() {
        let topo = CpuTopology {
            logical_cores: 1,
            physical_cores: 1,
            available_cores: vec![0],
        };
        assert_eq!(topo.select_placement(), ThreadPlacement::unpinned());
    }

    #[test]
    fn manual_and_disabled_configs() {
        let manual = CpuConfig::Manual {
            receiver: Some(5),
            sender: None,
            conductor: Some(7),
        }
        .resolve();
        assert_eq!(manual.strategy, PlacementStrategy::Manual);
        assert_eq!(manual.receiver, Some(5));
        assert_eq!(manual.conductor, Some(7));

        assert_eq!(CpuConfig::Disabled.resolve(), ThreadPlacement::unpinned());
    }
}
