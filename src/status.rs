//! Instance status model and derivation
//!
//! Both backends report the same externally visible shape: does the bundle
//! exist, is it running, and what are its runtime units doing. Backends
//! translate their native objects (pods, containers) into [`RuntimeUnit`]s;
//! the aggregation into an [`InstanceStatus`] is pure and lives here.

use serde::Serialize;
use std::fmt;

/// Phase of one runtime unit, normalized across backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RuntimePhase {
    /// Unit is up
    Running,
    /// Unit is being scheduled, pulled, or restarted
    Pending,
    /// Unit exited or crashed
    Failed,
    /// Backend reported a state this model does not classify
    Unknown,
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimePhase::Running => "Running",
            RuntimePhase::Pending => "Pending",
            RuntimePhase::Failed => "Failed",
            RuntimePhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One runtime unit backing an instance: a pod on the cluster backend, a
/// container on the host pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeUnit {
    /// Backend-native unit name
    pub name: String,
    /// Normalized phase
    pub phase: RuntimePhase,
    /// Health verdict. Units without a configured health check count as
    /// healthy; only a failing check clears this.
    pub healthy: bool,
    /// Where the unit landed: node name or pool worker name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Externally visible status of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    /// Whether the bundle exists at all
    pub exists: bool,
    /// Whether every unit is running and healthy
    pub running: bool,
    /// Aggregate phase; absent instances have none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RuntimePhase>,
    /// The units backing the instance
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<RuntimeUnit>,
    /// Where the workload runs: node name or pool worker name, when the
    /// backend reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Stable address callers reach the agent gateway on, when resolvable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl InstanceStatus {
    /// Status of an instance whose bundle does not exist.
    ///
    /// Absence is a complete answer; callers must not follow it with more
    /// backend calls.
    pub fn absent() -> Self {
        Self {
            exists: false,
            running: false,
            phase: None,
            units: Vec::new(),
            worker: None,
            endpoint: None,
        }
    }

    /// Status of an instance that exists but whose units could not be read,
    /// used by bulk listing to isolate per-instance failures.
    pub fn unknown() -> Self {
        Self {
            exists: true,
            running: false,
            phase: Some(RuntimePhase::Unknown),
            units: Vec::new(),
            worker: None,
            endpoint: None,
        }
    }
}

/// One row of a tenant-wide status listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListStatusEntry {
    /// Owning tenant
    pub tenant_id: String,
    /// Instance within the tenant
    pub instance_id: String,
    /// The instance's derived status
    pub status: InstanceStatus,
}

/// Aggregate unit phases with the precedence Failed > Pending > Unknown >
/// Running. An empty unit list is Unknown: the bundle exists but nothing is
/// backing it yet (or anymore).
pub fn aggregate_phase(units: &[RuntimeUnit]) -> RuntimePhase {
    if units.is_empty() {
        return RuntimePhase::Unknown;
    }
    let mut aggregate = RuntimePhase::Running;
    for unit in units {
        aggregate = match (aggregate, unit.phase) {
            (_, RuntimePhase::Failed) | (RuntimePhase::Failed, _) => RuntimePhase::Failed,
            (_, RuntimePhase::Pending) | (RuntimePhase::Pending, _) => RuntimePhase::Pending,
            (_, RuntimePhase::Unknown) | (RuntimePhase::Unknown, _) => RuntimePhase::Unknown,
            (RuntimePhase::Running, RuntimePhase::Running) => RuntimePhase::Running,
        };
    }
    aggregate
}

/// Derive the status of an existing bundle from its units and resolved
/// endpoint. `running` requires every unit to be in phase Running and
/// healthy.
pub fn derive_status(units: Vec<RuntimeUnit>, endpoint: Option<String>) -> InstanceStatus {
    let phase = aggregate_phase(&units);
    let running =
        phase == RuntimePhase::Running && units.iter().all(|unit| unit.healthy);
    let worker = units.iter().find_map(|unit| unit.worker.clone());
    InstanceStatus {
        exists: true,
        running,
        phase: Some(phase),
        units,
        worker,
        endpoint,
    }
}
