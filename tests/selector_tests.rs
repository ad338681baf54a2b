mod test_harness;

use std::collections::HashSet;
use std::sync::Mutex;

use test_harness::TestEnv;
use transcode_relay::ledger::{Host, HostRef, HostState, Target};
use transcode_relay::selector::{HostProbe, HostSelector};

const SELECTOR_PID: u32 = 9000;

/// Probe that fails for a fixed set of addresses and records every call.
#[derive(Default)]
struct FakeProbe {
    unreachable: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeProbe {
    fn failing(addresses: &[&str]) -> Self {
        Self {
            unreachable: addresses.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl HostProbe for FakeProbe {
    async fn probe(&self, host: &Host) -> bool {
        self.calls.lock().unwrap().push(host.address.clone());
        !self.unreachable.contains(&host.address)
    }
}

/// Simulate `count` running jobs on a host, as real dispatchers would
/// leave them: a process row plus an `active` state event each.
fn occupy(env: &TestEnv, host: &Host, first_pid: u32, count: u32) {
    let ledger = env.ledger();
    for pid in first_pid..first_pid + count {
        ledger
            .register_process(Target::Host(host.id), pid, "ffmpeg")
            .unwrap();
        ledger.record_state(host.id, pid, HostState::Active).unwrap();
    }
}

fn add_hosts(env: &TestEnv, hosts: &[(&str, i64)]) -> Vec<Host> {
    let ledger = env.ledger();
    for (address, weight) in hosts {
        ledger.add_host(address, *weight).unwrap();
    }
    ledger.list_hosts().unwrap()
}

#[tokio::test]
async fn test_empty_pool_falls_back() {
    let env = TestEnv::new();
    let ledger = env.ledger();
    let probe = FakeProbe::default();

    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap();
    assert!(selected.is_none());
}

#[tokio::test]
async fn test_first_idle_host_wins() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("gpu1.lan", 1), ("gpu2.lan", 1), ("gpu3.lan", 1)]);
    occupy(&env, &hosts[0], 100, 1);

    let ledger = env.ledger();
    let probe = FakeProbe::default();
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.address, "gpu2.lan");
    assert_eq!(probe.calls(), vec!["gpu1.lan", "gpu2.lan", "gpu3.lan"]);
}

#[tokio::test]
async fn test_least_loaded_host_wins() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("gpu1.lan", 1), ("gpu2.lan", 1), ("gpu3.lan", 1)]);
    occupy(&env, &hosts[0], 100, 3);
    occupy(&env, &hosts[1], 200, 1);
    occupy(&env, &hosts[2], 300, 2);

    let ledger = env.ledger();
    let probe = FakeProbe::default();
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.id, hosts[1].id);
}

#[tokio::test]
async fn test_weight_divides_load() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("small.lan", 1), ("big.lan", 2)]);
    occupy(&env, &hosts[0], 100, 2);
    occupy(&env, &hosts[1], 200, 2);

    let ledger = env.ledger();
    let probe = FakeProbe::default();
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.address, "big.lan");
}

#[tokio::test]
async fn test_equal_load_keeps_insertion_order() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("gpu1.lan", 1), ("gpu2.lan", 1)]);
    occupy(&env, &hosts[0], 100, 2);
    occupy(&env, &hosts[1], 200, 2);

    let ledger = env.ledger();
    let probe = FakeProbe::default();
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.address, "gpu1.lan");
}

#[tokio::test]
async fn test_failed_probe_marks_host_bad() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("down.lan", 1), ("up.lan", 1)]);

    let ledger = env.ledger();
    let probe = FakeProbe::failing(&["down.lan"]);
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.address, "up.lan");

    assert_eq!(ledger.latest_state(hosts[0].id).unwrap(), HostState::Bad);
    let history = ledger.state_history(hosts[0].id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].process_id, SELECTOR_PID);
}

#[tokio::test]
async fn test_bad_host_is_skipped_until_reset() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("flaky.lan", 1)]);
    let ledger = env.ledger();

    // First round: probe fails, host marked bad
    let probe = FakeProbe::failing(&["flaky.lan"]);
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap();
    assert!(selected.is_none());

    // The host is reachable again, but stays out without even being probed
    let probe = FakeProbe::default();
    for pid in 1..=3 {
        let selected = HostSelector::new(&ledger, &probe, pid)
            .select_target()
            .await
            .unwrap();
        assert!(selected.is_none());
    }
    assert!(probe.calls().is_empty());

    // The marking outlives the process that reported it
    ledger.clear_process(SELECTOR_PID).unwrap();
    assert_eq!(ledger.latest_state(hosts[0].id).unwrap(), HostState::Bad);

    // An operator reset brings it back
    ledger.clear(Some(&HostRef::Id(hosts[0].id))).unwrap();
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.id, hosts[0].id);
}

#[tokio::test]
async fn test_newer_non_bad_event_restores_host() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("gpu1.lan", 1)]);
    let ledger = env.ledger();
    ledger.record_state(hosts[0].id, 1, HostState::Bad).unwrap();
    ledger.record_state(hosts[0].id, 2, HostState::Idle).unwrap();

    let probe = FakeProbe::default();
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap();
    assert_eq!(selected.map(|h| h.id), Some(hosts[0].id));
}

#[tokio::test]
async fn test_local_host_is_never_probed() {
    let env = TestEnv::new();
    add_hosts(&env, &[("down.lan", 1), ("localhost", 1)]);

    let ledger = env.ledger();
    let probe = FakeProbe::failing(&["down.lan", "localhost"]);
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap()
        .unwrap();
    assert!(selected.is_local());
    assert_eq!(probe.calls(), vec!["down.lan"]);
}

#[tokio::test]
async fn test_all_hosts_unreachable() {
    let env = TestEnv::new();
    let hosts = add_hosts(&env, &[("a.lan", 1), ("b.lan", 1)]);

    let ledger = env.ledger();
    let probe = FakeProbe::failing(&["a.lan", "b.lan"]);
    let selected = HostSelector::new(&ledger, &probe, SELECTOR_PID)
        .select_target()
        .await
        .unwrap();
    assert!(selected.is_none());
    for host in &hosts {
        assert_eq!(ledger.latest_state(host.id).unwrap(), HostState::Bad);
    }
}
