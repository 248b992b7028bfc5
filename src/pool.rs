//! Worker pool model and placement selection
//!
//! The host-pool backend spreads instances across a statically configured
//! list of Docker workers. Probing the pool is backend work (it needs live
//! daemon connections); choosing from the probe results is pure and lives
//! here so the policy is testable without a daemon.
//!
//! Selection policy: probe every worker, tolerate individual probe failures,
//! consider only the reachable ones, and pick the lowest load. Ties go to
//! the worker listed first in the settings, which keeps placement
//! deterministic for operators comparing runs. Load counts all running
//! containers on the worker, managed or not, so externally busy hosts are
//! avoided too.

use serde::Deserialize;

use crate::{Error, Result};

/// One Docker worker in the configured pool.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Worker {
    /// Stable operator-facing name, also recorded on placed containers
    pub name: String,
    /// Daemon address, `unix://` or `tcp://`
    pub address: String,
}

/// Result of probing one worker at selection time.
///
/// Probes are a snapshot taken per placement call, never cached; a pool's
/// load changes under it constantly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerProbe {
    /// Name of the probed worker
    pub name: String,
    /// Running-container count, or `None` when the probe failed
    pub load: Option<usize>,
}

impl WorkerProbe {
    /// Probe result for a reachable worker
    pub fn reachable(name: impl Into<String>, load: usize) -> Self {
        Self {
            name: name.into(),
            load: Some(load),
        }
    }

    /// Probe result for a worker that did not answer
    pub fn unreachable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            load: None,
        }
    }
}

/// Pick the least-loaded reachable worker from a probe snapshot.
///
/// Returns [`Error::NoReachableWorker`] when the reachable set is empty.
/// That error is fatal for the call; no retry happens here.
pub fn select_worker(probes: &[WorkerProbe]) -> Result<&WorkerProbe> {
    let mut best: Option<(&WorkerProbe, usize)> = None;
    for probe in probes {
        let Some(load) = probe.load else {
            continue;
        };
        match best {
            // Strict improvement only, so ties keep the first-listed worker
            Some((_, best_load)) if best_load <= load => {}
            _ => best = Some((probe, load)),
        }
    }
    best.map(|(probe, _)| probe).ok_or(Error::NoReachableWorker)
}
