use ricart_agrawala_lib::{
    config::{ClusterConfig, PeerTable, Timings},
    message::{Message, ProcessId},
    observer::{LogLine, Observer, StateChange},
    protocol::ProcessState,
    run::Cluster,
    schedule::FixedSchedule,
    transport::{TcpTransport, Transport},
};
use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::net::TcpListener;

/// Fails the run if two processes ever report holding the critical section at once.
#[derive(Default)]
struct ExclusionMonitor {
    holders: Mutex<HashSet<ProcessId>>,
    violated: AtomicBool,
    entries: Mutex<HashMap<ProcessId, usize>>,
    last_clock: Mutex<HashMap<ProcessId, i64>>,
    clock_regressed: AtomicBool,
}

impl ExclusionMonitor {
    fn entries(&self, id: ProcessId) -> usize {
        self.entries.lock().unwrap().get(&id).copied().unwrap_or(0)
    }
}

impl Observer for ExclusionMonitor {
    fn on_state_change(&self, change: StateChange) {
        let mut holders = self.holders.lock().unwrap();
        if change.holds_exclusive_access {
            if holders.iter().any(|id| *id != change.process_id) {
                self.violated.store(true, Ordering::SeqCst);
            }
            holders.insert(change.process_id);
            *self
                .entries
                .lock()
                .unwrap()
                .entry(change.process_id)
                .or_default() += 1;
        } else {
            holders.remove(&change.process_id);
        }
    }

    fn on_log(&self, line: LogLine) {
        // Delivery failures carry the message's own timestamp, which may lag the clock.
        if line.text.starts_with("failed to send") {
            return;
        }
        let mut last = self.last_clock.lock().unwrap();
        if let Some(previous) = last.insert(line.process_id, line.clock) {
            if previous > line.clock {
                self.clock_regressed.store(true, Ordering::SeqCst);
            }
        }
    }
}

fn fast_config(peers: PeerTable) -> ClusterConfig {
    ClusterConfig {
        peers,
        timings: Timings::from_millis((0, 4), (1, 3), 5),
        seed: Some(11),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_cluster_never_grants_twice() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let mut cluster = Cluster::local(
        fast_config(PeerTable::localhost(5).unwrap()),
        monitor.clone(),
    );

    cluster.start();
    tokio::time::sleep(Duration::from_millis(800)).await;
    cluster.shutdown().await;

    assert!(!monitor.violated.load(Ordering::SeqCst));
    assert!(!monitor.clock_regressed.load(Ordering::SeqCst));
    for id in 1..=5 {
        assert!(
            monitor.entries(ProcessId(id)) > 0,
            "P{id} never entered the critical section"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_requests_all_get_through() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let mut cluster = Cluster::local(
        fast_config(PeerTable::localhost(4).unwrap()),
        monitor.clone(),
    );

    // No think time: everybody contends on every cycle.
    cluster.start_with(|_| FixedSchedule {
        think: Duration::ZERO,
        hold: Duration::from_millis(2),
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    cluster.shutdown().await;

    assert!(!monitor.violated.load(Ordering::SeqCst));
    for id in 1..=4 {
        assert!(monitor.entries(ProcessId(id)) > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_process_neither_requests_nor_replies() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let cluster = Cluster::local(
        fast_config(PeerTable::localhost(3).unwrap()),
        monitor.clone(),
    );

    // Crash 3 before anything runs, then let 1 request by hand.
    assert_eq!(cluster.toggle(ProcessId(3)).await, Some(false));
    let one = cluster.process(ProcessId(1)).unwrap();
    one.request_cs().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = one.snapshot().await;
    assert_eq!(snapshot.state, ProcessState::Requesting);
    assert_eq!(snapshot.pending, vec![ProcessId(3)]);

    let three = cluster.process(ProcessId(3)).unwrap().snapshot().await;
    assert_eq!(three.clock, 0);
    assert!(three.deferred.is_empty());
    assert_eq!(monitor.entries(ProcessId(1)), 0);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_keeps_running_around_a_crashed_peer() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let mut cluster = Cluster::local(
        fast_config(PeerTable::localhost(3).unwrap()),
        monitor.clone(),
    );

    cluster.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.toggle(ProcessId(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.toggle(ProcessId(2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.shutdown().await;

    assert!(!monitor.violated.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deferred_request_is_released_on_exit() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let cluster = Cluster::local(
        fast_config(PeerTable::localhost(2).unwrap()),
        monitor.clone(),
    );
    let one = cluster.process(ProcessId(1)).unwrap();
    let two = cluster.process(ProcessId(2)).unwrap();

    one.request_cs().await.unwrap();
    one.await_permission().await.unwrap();

    two.request_cs().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(one.snapshot().await.deferred, vec![ProcessId(2)]);
    assert_eq!(two.snapshot().await.pending, vec![ProcessId(1)]);

    one.exit_cs().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), two.await_permission())
        .await
        .unwrap()
        .unwrap();
    assert!(one.snapshot().await.deferred.is_empty());
    assert_eq!(two.state().await, ProcessState::InCriticalSection);
    assert!(!monitor.violated.load(Ordering::SeqCst));

    cluster.shutdown().await;
}

async fn free_ports(count: u32) -> PeerTable {
    let mut peers = PeerTable::new();
    // Held until every port is picked so the OS hands out distinct ones.
    let mut held = vec![];
    for id in 1..=count {
        let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        peers.insert(ProcessId(id), listener.local_addr().unwrap());
        held.push(listener);
    }
    drop(held);
    peers
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_cluster_never_grants_twice() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let config = fast_config(free_ports(3).await);
    let mut cluster = Cluster::tcp(config, monitor.clone()).await.unwrap();

    cluster.start();
    tokio::time::sleep(Duration::from_millis(800)).await;
    cluster.shutdown().await;

    assert!(!monitor.violated.load(Ordering::SeqCst));
    for id in 1..=3 {
        assert!(monitor.entries(ProcessId(id)) > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_tcp_process_accepts_but_ignores_messages() {
    let monitor = Arc::new(ExclusionMonitor::default());
    let peers = free_ports(3).await;
    let cluster = Cluster::tcp(fast_config(peers.clone()), monitor.clone())
        .await
        .unwrap();
    assert_eq!(cluster.toggle(ProcessId(3)).await, Some(false));

    // The connection is still accepted, so the sender sees a clean delivery.
    let outside = TcpTransport::new(peers);
    outside
        .send(ProcessId(3), Message::request(ProcessId(1), 40))
        .await
        .unwrap();
    outside
        .send(ProcessId(2), Message::request(ProcessId(1), 40))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let three = cluster.process(ProcessId(3)).unwrap().snapshot().await;
    assert!(!three.alive);
    assert_eq!(three.clock, 0);
    assert!(three.deferred.is_empty());
    assert_eq!(three.state, ProcessState::Idle);

    // A live peer observed the same request.
    let two = cluster.process(ProcessId(2)).unwrap().snapshot().await;
    assert_eq!(two.clock, 41);

    cluster.shutdown().await;
}
