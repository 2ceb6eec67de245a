//! CPU placement and real-time scheduling for the worker thread.
//!
//! The worker busy-waits between timeslices, so it should own a core the
//! control thread and the OS are not using. Before entering its loop it
//! resolves a [`CpuConfig`] to a core, pins itself there and raises its
//! scheduling class according to a [`RealtimePolicy`].
//!
//! # Placement Strategy
//!
//! - With two or more physical cores the worker takes the first logical
//!   core of the last physical core, leaving core 0 (where the control
//!   thread and most OS housekeeping run) alone.
//! - With a single SMT-enabled physical core the worker takes the last
//!   logical core and shares the physical core with the control thread.
//! - With a single logical core nothing is pinned.
//!
//! # Detection
//!
//! Core counts come from `num_cpus`, the affinity mask and pinning from
//! `core_affinity`. The selection assumes the common enumeration where the
//! first N core IDs are distinct physical cores and SMT siblings follow.
//!
//! Every step is best-effort: failures (missing privileges, unsupported
//! platform, too few cores) are logged and reported, never fatal.

use std::fmt;
use std::io;

use core_affinity::CoreId;

use crate::trace::{info, warn};

/// Core counts and the affinity mask of this process.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Hardware threads, SMT siblings included.
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// More hardware threads than physical cores.
    pub has_smt: bool,
    /// Core IDs this process may run on.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Reads the topology of the host.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self::from_counts(logical_cores, physical_cores, available_cores)
    }

    /// Builds a topology from explicit counts.
    #[must_use]
    pub fn from_counts(
        logical_cores: usize,
        physical_cores: usize,
        available_cores: Vec<usize>,
    ) -> Self {
        Self {
            logical_cores,
            physical_cores,
            has_smt: logical_cores > physical_cores,
            available_cores,
        }
    }

    /// Selects the worker's core based on the detected topology.
    #[must_use]
    pub fn select_placement(&self) -> Placement {
        let available = &self.available_cores;

        if self.logical_cores < 2 || available.len() < 2 {
            return Placement::unpinned();
        }

        if self.physical_cores >= 2 {
            let index = (self.physical_cores - 1).min(available.len() - 1);
            return Placement {
                core: available.get(index).copied(),
                strategy: PlacementStrategy::DedicatedCore,
            };
        }

        Placement {
            core: available.last().copied(),
            strategy: PlacementStrategy::SmtSibling,
        }
    }
}

/// Placement decision for the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Core ID to pin to (None = unpinned).
    pub core: Option<usize>,
    /// How `core` was chosen.
    pub strategy: PlacementStrategy,
}

impl Placement {
    /// Leaves the worker to the OS scheduler.
    #[must_use]
    pub const fn unpinned() -> Self {
        Self {
            core: None,
            strategy: PlacementStrategy::NoPin,
        }
    }
}

/// How the worker core was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// 2+ physical cores: worker alone on the last physical core.
    DedicatedCore,
    /// 1 physical core + SMT: worker on the second hardware thread.
    SmtSibling,
    /// No pinning (fallback or disabled).
    NoPin,
    /// Core named in the configuration.
    Manual,
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DedicatedCore => write!(f, "dedicated-core"),
            Self::SmtSibling => write!(f, "smt-sibling"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Where the worker thread should run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpuConfig {
    /// Auto-detect topology and choose a dedicated core.
    #[default]
    Auto,
    /// User-specified core.
    Manual {
        /// Core ID to pin the worker to.
        core: usize,
    },
    /// Leave placement to the OS.
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete placement.
    #[must_use]
    pub fn resolve(&self) -> Placement {
        self.resolve_with(&CpuTopology::detect())
    }

    /// Resolves the config against an already detected topology.
    #[must_use]
    pub fn resolve_with(&self, topology: &CpuTopology) -> Placement {
        match self {
            Self::Auto => topology.select_placement(),
            Self::Manual { core } => Placement {
                core: Some(*core),
                strategy: PlacementStrategy::Manual,
            },
            Self::Disabled => Placement::unpinned(),
        }
    }
}

/// OS scheduling class requested for the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimePolicy {
    /// Keep the default (time-sharing) scheduler.
    Disabled,
    /// `SCHED_FIFO` at the given priority (1..=99).
    Fifo {
        /// Static priority.
        priority: u8,
    },
    /// `SCHED_RR` at the given priority (1..=99).
    RoundRobin {
        /// Static priority.
        priority: u8,
    },
}

impl RealtimePolicy {
    /// Priority used by [`Default`].
    pub const DEFAULT_PRIORITY: u8 = 50;

    /// Returns the requested priority, if any.
    #[must_use]
    pub const fn priority(&self) -> Option<u8> {
        match self {
            Self::Disabled => None,
            Self::Fifo { priority } | Self::RoundRobin { priority } => Some(*priority),
        }
    }
}

impl Default for RealtimePolicy {
    fn default() -> Self {
        Self::Fifo {
            priority: Self::DEFAULT_PRIORITY,
        }
    }
}

impl fmt::Display for RealtimePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "default"),
            Self::Fifo { priority } => write!(f, "fifo/{priority}"),
            Self::RoundRobin { priority } => write!(f, "rr/{priority}"),
        }
    }
}

/// What actually took effect when configuring the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingReport {
    /// Placement that was attempted.
    pub placement: Placement,
    /// Whether the thread is pinned to `placement.core`.
    pub pinned: bool,
    /// Whether the real-time policy was applied.
    pub realtime: bool,
}

/// Pins the calling thread to `core_id`.
///
/// Returns `false` if the core does not exist, lies outside the affinity
/// mask, or the OS refuses.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

/// Applies `policy` to the calling thread.
///
/// # Errors
///
/// Returns the OS error if the scheduler rejects the request (typically
/// `EPERM` without `CAP_SYS_NICE` or an rtprio limit), or `Unsupported` on
/// platforms without POSIX real-time scheduling.
pub fn apply_realtime(policy: RealtimePolicy) -> io::Result<()> {
    match policy {
        RealtimePolicy::Disabled => Ok(()),
        RealtimePolicy::Fifo { priority } => sys::set_current_thread_policy(sys::FIFO, priority),
        RealtimePolicy::RoundRobin { priority } => {
            sys::set_current_thread_policy(sys::ROUND_ROBIN, priority)
        }
    }
}

/// Pins and prioritises the calling thread, logging every failure.
pub fn configure_current_thread(cpu: CpuConfig, policy: RealtimePolicy) -> SchedulingReport {
    configure_with(&CpuTopology::detect(), cpu, policy)
}

/// [`configure_current_thread`] against a given topology.
///
/// Real-time scheduling is skipped when the process may run on fewer than
/// two cores; the worker then shares its core with the control thread.
pub fn configure_with(
    topology: &CpuTopology,
    cpu: CpuConfig,
    policy: RealtimePolicy,
) -> SchedulingReport {
    let placement = cpu.resolve_with(topology);

    let pinned = match placement.core {
        Some(core) => {
            let pinned = pin_to_core(core);
            if pinned {
                info!(core, strategy = %placement.strategy, "worker pinned");
            } else {
                warn!(core, strategy = %placement.strategy, "failed to pin worker; running unpinned");
            }
            pinned
        }
        None => {
            info!(strategy = %placement.strategy, "worker left unpinned");
            false
        }
    };

    let realtime = if policy == RealtimePolicy::Disabled {
        false
    } else if topology.logical_cores < 2 || topology.available_cores.len() < 2 {
        warn!(
            policy = %policy,
            logical_cores = topology.logical_cores,
            available_cores = topology.available_cores.len(),
            "fewer than two cores; using default scheduler"
        );
        false
    } else {
        match apply_realtime(policy) {
            Ok(()) => {
                info!(policy = %policy, "real-time scheduling enabled");
                true
            }
            Err(_error) => {
                warn!(policy = %policy, error = %_error, "real-time scheduling unavailable; using default scheduler");
                false
            }
        }
    };

    SchedulingReport {
        placement,
        pinned,
        realtime,
    }
}

#[cfg(unix)]
mod sys {
    use std::io;

    pub(super) const FIFO: libc::c_int = libc::SCHED_FIFO;
    pub(super) const ROUND_ROBIN: libc::c_int = libc::SCHED_RR;

    pub(super) fn set_current_thread_policy(policy: libc::c_int, priority: u8) -> io::Result<()> {
        // SAFETY: `sched_param` is plain old data; all-zero is a valid value
        // on every platform (extra opaque fields included).
        let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
        param.sched_priority = libc::c_int::from(priority);

        // SAFETY: `pthread_self` always names the calling thread and `param`
        // outlives the call.
        let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(rc))
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;

    pub(super) const FIFO: i32 = 1;
    pub(super) const ROUND_ROBIN: i32 = 2;

    pub(super) fn set_current_thread_policy(_policy: i32, _priority: u8) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "real-time scheduling requires POSIX threads",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(topo.physical_cores > 0, "should have at least 1 physical core");
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn detected_placement_uses_available_core() {
        let topo = CpuTopology::detect();
        let placement = topo.select_placement();

        if let Some(core) = placement.core {
            assert!(
                topo.available_cores.contains(&core),
                "worker core should be in available set"
            );
        }
    }

    #[test]
    fn single_core_is_never_pinned() {
        let topo = CpuTopology::from_counts(1, 1, vec![0]);

        assert_eq!(topo.select_placement(), Placement::unpinned());
    }

    #[test]
    fn multi_core_avoids_core_zero() {
        let topo = CpuTopology::from_counts(8, 4, (0..8).collect());
        let placement = topo.select_placement();

        assert_eq!(placement.core, Some(3), "first hardware thread of last physical core");
        assert_eq!(placement.strategy, PlacementStrategy::DedicatedCore);
    }

    #[test]
    fn restricted_affinity_mask_is_respected() {
        // Four physical cores, but the process may only run on 2 and 5.
        let topo = CpuTopology::from_counts(4, 4, vec![2, 5]);

        assert_eq!(topo.select_placement().core, Some(5));
    }

    #[test]
    fn single_physical_core_with_smt_uses_sibling() {
        let topo = CpuTopology::from_counts(2, 1, vec![0, 1]);
        let placement = topo.select_placement();

        assert!(topo.has_smt);
        assert_eq!(placement.core, Some(1));
        assert_eq!(placement.strategy, PlacementStrategy::SmtSibling);
    }

    #[test]
    fn cpu_config_disabled_returns_unpinned() {
        let placement = CpuConfig::Disabled.resolve();

        assert!(placement.core.is_none());
        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
    }

    #[test]
    fn cpu_config_manual_uses_specified_core() {
        let placement = CpuConfig::Manual { core: 6 }.resolve();

        assert_eq!(placement.core, Some(6));
        assert_eq!(placement.strategy, PlacementStrategy::Manual);
    }

    #[test]
    fn disabled_realtime_is_a_no_op() {
        assert!(apply_realtime(RealtimePolicy::Disabled).is_ok());
    }

    #[test]
    fn configuration_failures_are_not_fatal() {
        // Run on a scratch thread so a successful priority change does not
        // leak into the test harness thread.
        let report = std::thread::spawn(|| {
            configure_current_thread(
                CpuConfig::Manual { core: 1023 },
                RealtimePolicy::Fifo { priority: 99 },
            )
        })
        .join()
        .unwrap();

        assert!(!report.pinned, "test hosts do not expose core 1023");
        assert_eq!(report.placement.strategy, PlacementStrategy::Manual);
    }

    #[test]
    fn single_core_host_keeps_default_scheduler() {
        let report = std::thread::spawn(|| {
            configure_with(
                &CpuTopology::from_counts(1, 1, vec![0]),
                CpuConfig::Auto,
                RealtimePolicy::Fifo { priority: 50 },
            )
        })
        .join()
        .unwrap();

        assert_eq!(report.placement, Placement::unpinned());
        assert!(!report.pinned);
        assert!(!report.realtime, "real-time worker would starve the control thread");
    }

    #[test]
    fn single_core_affinity_mask_keeps_default_scheduler() {
        // Plenty of cores on the host, but the process may only use one.
        let report = std::thread::spawn(|| {
            configure_with(
                &CpuTopology::from_counts(8, 4, vec![3]),
                CpuConfig::Disabled,
                RealtimePolicy::RoundRobin { priority: 10 },
            )
        })
        .join()
        .unwrap();

        assert!(!report.realtime);
    }

    #[test]
    fn disabled_policy_reports_no_realtime() {
        let topology = CpuTopology::from_counts(4, 4, vec![0, 1, 2, 3]);
        let report = configure_with(&topology, CpuConfig::Disabled, RealtimePolicy::Disabled);

        assert!(!report.realtime);
        assert!(!report.pinned);
    }

    #[test]
    fn policy_priority_and_display() {
        assert_eq!(RealtimePolicy::Disabled.priority(), None);
        assert_eq!(RealtimePolicy::RoundRobin { priority: 7 }.priority(), Some(7));
        assert_eq!(RealtimePolicy::default().to_string(), "fifo/50");
    }
}
