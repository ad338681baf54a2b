use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Addresses that mean "run on this machine" and are never probed.
const LOCAL_ADDRESSES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Stable host identifier (the ledger's row id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostId(pub i64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Host {
    pub id: HostId,
    pub address: String,
    pub weight: i64,
}

impl Host {
    /// Local entries run the local fallback binary and are recorded against
    /// the local fallback target, not this host's id. Their own id therefore
    /// never accrues `active` events or load, so a local entry always looks
    /// `idle` and wins whenever it is the first idle candidate.
    pub fn is_local(&self) -> bool {
        is_local_address(&self.address)
    }
}

pub fn is_local_address(address: &str) -> bool {
    LOCAL_ADDRESSES
        .iter()
        .any(|local| address.eq_ignore_ascii_case(local))
}

/// Health observation for a host. The current state of a host is its most
/// recent event, or `Idle` when it has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    #[default]
    Idle,
    Active,
    Bad,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Idle => "idle",
            HostState::Active => "active",
            HostState::Bad => "bad",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown host state '{}'", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for HostState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(HostState::Idle),
            "active" => Ok(HostState::Active),
            "bad" => Ok(HostState::Bad),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub seq: i64,
    pub host_id: HostId,
    pub process_id: u32,
    pub state: HostState,
    pub recorded_at: i64,
}

/// Where a job runs, as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Target {
    Host(HostId),
    /// Local fallback; shown as host 0.
    Local,
}

impl Target {
    pub fn host_id(&self) -> Option<HostId> {
        match self {
            Target::Host(id) => Some(*id),
            Target::Local => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host(id) => write!(f, "{}", id),
            Target::Local => f.write_str("0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub target: Target,
    pub process_id: u32,
    pub command: String,
}

/// Rows removed by an operator reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Cleared {
    pub processes: usize,
    pub states: usize,
}

/// Consistent view of the ledger read inside one transaction.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub hosts: Vec<Host>,
    pub processes: Vec<ProcessRecord>,
    /// Current state per host, parallel to `hosts`.
    pub states: Vec<HostState>,
}

impl LedgerSnapshot {
    pub fn running_on(&self, id: HostId) -> usize {
        self.processes
            .iter()
            .filter(|p| p.target == Target::Host(id))
            .count()
    }

    pub fn running_local(&self) -> usize {
        self.processes
            .iter()
            .filter(|p| p.target == Target::Local)
            .count()
    }

    pub fn hosts_with_state(&self) -> impl Iterator<Item = (&Host, HostState)> {
        self.hosts.iter().zip(self.states.iter().copied())
    }
}
