//! Host selection.
//!
//! Picks the target for a new job from a ledger snapshot:
//! 1. Hosts whose current state is `bad` are skipped without a probe. They
//!    stay out of rotation until an operator clears their state history.
//! 2. Every other non-local host is probed; a failed probe records a `bad`
//!    event and drops the host from this round.
//! 3. Local hosts are never probed and always eligible.
//! 4. The first `idle` survivor (insertion order) wins outright.
//! 5. Otherwise the survivor with the lowest `running / weight` (floor) wins,
//!    first one on ties.
//!
//! No survivor means the caller falls back to local execution.

use std::future::Future;

use crate::error::Result;
use crate::ledger::{Host, HostState, Ledger};

/// Liveness check for a remote host.
pub trait HostProbe {
    fn probe(&self, host: &Host) -> impl Future<Output = bool> + Send;
}

/// A host that survived filtering and probing.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub host: Host,
    pub state: HostState,
    pub running: usize,
}

impl Candidate {
    pub fn load(&self) -> usize {
        self.running / self.host.weight.max(1) as usize
    }
}

/// Index of the winning candidate, if any.
pub fn choose(candidates: &[Candidate]) -> Option<usize> {
    if let Some(idx) = candidates.iter().position(|c| c.state == HostState::Idle) {
        return Some(idx);
    }

    // min_by_key keeps the last minimum; fold keeps the first.
    candidates
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, usize)>, (idx, c)| {
            let load = c.load();
            match best {
                Some((_, best_load)) if best_load <= load => best,
                _ => Some((idx, load)),
            }
        })
        .map(|(idx, _)| idx)
}

pub struct HostSelector<'a, P> {
    ledger: &'a Ledger,
    probe: &'a P,
    pid: u32,
}

impl<'a, P: HostProbe> HostSelector<'a, P> {
    /// `pid` is recorded as the reporter of any `bad` markings.
    pub fn new(ledger: &'a Ledger, probe: &'a P, pid: u32) -> Self {
        Self { ledger, probe, pid }
    }

    /// Pick a target host, or `None` for local fallback.
    pub async fn select_target(&self) -> Result<Option<Host>> {
        let snapshot = self.ledger.snapshot()?;
        let mut candidates = Vec::with_capacity(snapshot.hosts.len());

        for (host, state) in snapshot.hosts_with_state() {
            if state == HostState::Bad {
                tracing::debug!(host_id = %host.id, address = %host.address, "Skipping bad host");
                continue;
            }

            if !host.is_local() && !self.probe.probe(host).await {
                self.mark_bad(host);
                continue;
            }

            candidates.push(Candidate {
                host: host.clone(),
                state,
                running: snapshot.running_on(host.id),
            });
        }

        let chosen = choose(&candidates).map(|idx| candidates.swap_remove(idx));
        match &chosen {
            Some(c) => tracing::info!(
                host_id = %c.host.id,
                address = %c.host.address,
                state = %c.state,
                running = c.running,
                weight = c.host.weight,
                "Selected target host"
            ),
            None => tracing::info!("No eligible host, falling back to local execution"),
        }
        Ok(chosen.map(|c| c.host))
    }

    fn mark_bad(&self, host: &Host) {
        tracing::warn!(host_id = %host.id, address = %host.address, "Marking host bad");
        if let Err(e) = self.ledger.record_state(host.id, self.pid, HostState::Bad) {
            // The host is still excluded from this round.
            tracing::error!(host_id = %host.id, error = %e, "Failed to record bad state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::HostId;

    fn candidate(id: i64, weight: i64, state: HostState, running: usize) -> Candidate {
        Candidate {
            host: Host {
                id: HostId(id),
                address: format!("host{}", id),
                weight,
            },
            state,
            running,
        }
    }

    #[test]
    fn no_candidates() {
        assert_eq!(choose(&[]), None);
    }

    #[test]
    fn first_idle_wins() {
        let c = [
            candidate(1, 1, HostState::Active, 0),
            candidate(2, 1, HostState::Idle, 5),
            candidate(3, 1, HostState::Idle, 0),
        ];
        assert_eq!(choose(&c), Some(1));
    }

    #[test]
    fn least_loaded_wins() {
        let c = [
            candidate(1, 1, HostState::Active, 3),
            candidate(2, 1, HostState::Active, 1),
            candidate(3, 1, HostState::Active, 2),
        ];
        assert_eq!(choose(&c), Some(1));
    }

    #[test]
    fn weight_divides_load() {
        let c = [
            candidate(1, 1, HostState::Active, 2),
            candidate(2, 2, HostState::Active, 2),
        ];
        assert_eq!(choose(&c), Some(1));
    }

    #[test]
    fn ties_keep_first() {
        let c = [
            candidate(1, 1, HostState::Active, 2),
            candidate(2, 1, HostState::Active, 2),
        ];
        assert_eq!(choose(&c), Some(0));

        // 3/2 and 2/2 both floor to 1
        let c = [
            candidate(1, 2, HostState::Active, 3),
            candidate(2, 2, HostState::Active, 2),
        ];
        assert_eq!(choose(&c), Some(0));
    }
}
