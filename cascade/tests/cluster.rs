//! Transport integration tests on a four-node localhost cluster.
//!
//! Every node binds an ephemeral listener up front, so peers can connect
//! before the rx threads run.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=cascade=debug cargo test --test cluster -- --nocapture
//! ```

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Once, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use cascade::chain::{Chain, TerminationRecord};
use cascade::config::TransportConfig;
use cascade::net::{Endpoint, InboundSink, Member, RemoteCodeRegistry, SubmissionCache, Transport};
use cascade::runtime::Outbound;
use cascade::stage::StageError;
use cascade::types::{ChainId, PartitionId, SubmissionId};
use cascade::value::Value;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        cascade::init_tracing();
    });
}

const NODES: usize = 4;
const WAIT: Duration = Duration::from_secs(10);

/// Records everything the transport delivers to one node.
#[derive(Default)]
struct Inbox {
    chains: Mutex<Vec<Chain>>,
    records: Mutex<Vec<TerminationRecord>>,
    terminate_from: Mutex<Vec<PartitionId>>,
    /// Acts like a full process queue while set.
    refuse_chains: AtomicBool,
    offers: AtomicUsize,
}

impl InboundSink for Inbox {
    fn chain_received(&self, chain: Chain) {
        self.chains.lock().unwrap().push(chain);
    }

    fn offer_chain(&self, chain: Chain) -> Result<(), Chain> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if self.refuse_chains.load(Ordering::SeqCst) {
            return Err(chain);
        }
        self.chains.lock().unwrap().push(chain);
        Ok(())
    }

    fn chain_terminated(&self, record: TerminationRecord) {
        self.records.lock().unwrap().push(record);
    }

    fn terminate_requested(&self, from: PartitionId) {
        self.terminate_from.lock().unwrap().push(from);
    }
}

struct Node {
    transport: Arc<Transport>,
    inbox: Arc<Inbox>,
    remote_code: Arc<RemoteCodeRegistry>,
}

struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    fn start() -> Self {
        init_test_tracing();
        let listeners: Vec<TcpListener> = (0..NODES)
            .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind ephemeral"))
            .collect();
        let members: Vec<Member> = listeners
            .iter()
            .enumerate()
            .map(|(i, l)| {
                let addr = l.local_addr().expect("local addr");
                Member::new(format!("node-{i}"), Endpoint::from(addr))
            })
            .collect();

        let nodes = listeners
            .into_iter()
            .enumerate()
            .map(|(i, listener)| {
                let config = TransportConfig {
                    members: members.clone(),
                    local_name: format!("node-{i}"),
                    ..TransportConfig::default()
                };
                let inbox = Arc::new(Inbox::default());
                let remote_code = Arc::new(RemoteCodeRegistry::new());
                let transport = Transport::spawn_on(
                    config,
                    listener,
                    inbox.clone(),
                    Arc::new(SubmissionCache::new()),
                    remote_code.clone(),
                )
                .expect("spawn transport");
                Node {
                    transport,
                    inbox,
                    remote_code,
                }
            })
            .collect();
        Self { nodes }
    }

    fn node(&self, i: usize) -> &Transport {
        &self.nodes[i].transport
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.transport.stop();
        }
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn text(s: &str) -> Value {
    Value::from(s)
}

#[test]
fn partitions_follow_member_names() {
    let cluster = Cluster::start();
    for i in 0..NODES {
        assert_eq!(cluster.node(i).partition(), PartitionId::new(i as u32));
    }
    assert!(cluster.node(0).membership().is_coordinator());
    assert!(!cluster.node(3).membership().is_coordinator());
}

#[test]
fn coordinator_waits_for_every_ready_signal() {
    let cluster = Cluster::start();

    thread::scope(|s| {
        let coordinator = s.spawn(|| cluster.node(0).wait_until_all_ready());
        for i in 1..NODES {
            cluster.node(i).signal_ready().expect("signal ready");
        }
        coordinator.join().expect("coordinator barrier");
    });

    assert_eq!(cluster.node(0).ready_count(), NODES - 1);
    // A no-op on the coordinator itself.
    cluster.node(0).signal_ready().expect("coordinator ready");
    assert_eq!(cluster.node(0).ready_count(), NODES - 1);
}

#[test]
fn broadcast_reaches_every_node() {
    let cluster = Cluster::start();
    let sub = SubmissionId::new(7);

    assert!(
        cluster
            .node(1)
            .broadcast_objects(sub, vec![(text("k"), Value::Int(42))])
    );

    for i in 0..NODES {
        assert_eq!(
            cluster.node(i).cache().get(sub, &text("k")),
            Some(Value::Int(42)),
            "node {i}"
        );
    }
}

#[test]
fn retrieve_collects_one_reply_per_peer() {
    let cluster = Cluster::start();
    let sub = SubmissionId::new(3);
    assert!(
        cluster
            .node(0)
            .broadcast_objects(sub, vec![(text("a"), Value::Int(1))])
    );

    let replies = cluster
        .node(2)
        .retrieve_objects(sub, vec![text("a"), text("missing")])
        .expect("retrieve");

    assert_eq!(replies.len(), NODES - 1);
    for reply in replies {
        assert_eq!(reply, vec![Some(Value::Int(1)), None]);
    }
}

#[test]
fn directed_objects_stay_on_their_node() {
    let cluster = Cluster::start();
    let sub = SubmissionId::new(5);

    assert!(
        cluster
            .node(0)
            .send_object(PartitionId::new(3), sub, vec![(text("x"), Value::Int(9))])
    );

    assert_eq!(cluster.node(3).cache().get(sub, &text("x")), Some(Value::Int(9)));
    assert_eq!(cluster.node(1).cache().get(sub, &text("x")), None);

    let from_three = cluster
        .node(1)
        .retrieve_objects_from(PartitionId::new(3), sub, vec![text("x")])
        .expect("retrieve");
    assert_eq!(from_three, vec![Some(Value::Int(9))]);
}

#[test]
fn remote_code_runs_on_every_peer() {
    let cluster = Cluster::start();
    let runs = Arc::new(AtomicUsize::new(0));
    for node in &cluster.nodes {
        let runs = runs.clone();
        node.remote_code.register("mark", move |_inv| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        node.remote_code
            .register("fail", |_inv| Err(StageError::Failed("refused".into())));
    }
    let sub = SubmissionId::new(1);
    let origin = cluster.node(0).partition();

    assert!(cluster.node(0).execute_remote_code(origin, sub, "mark"));
    assert_eq!(runs.load(Ordering::SeqCst), NODES - 1);

    assert!(!cluster.node(0).execute_remote_code(origin, sub, "fail"));
    assert!(!cluster.node(0).execute_remote_code(origin, sub, "unregistered"));

    assert!(
        cluster
            .node(0)
            .execute_remote_code_on(PartitionId::new(2), origin, sub, "mark")
    );
    assert_eq!(runs.load(Ordering::SeqCst), NODES);
}

#[test]
fn remote_code_may_start_a_collective() {
    let cluster = Cluster::start();
    let handle: Arc<OnceLock<Weak<Transport>>> = Arc::default();
    let _ = handle.set(Arc::downgrade(&cluster.nodes[1].transport));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let code_handle = Arc::clone(&handle);
    let code_seen = Arc::clone(&seen);
    cluster.nodes[1].remote_code.register("next-id", move |_inv| {
        let transport = code_handle
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| StageError::Failed("transport gone".into()))?;
        let value = transport
            .get_counter("remote")
            .map_err(|e| StageError::Failed(e.to_string()))?;
        code_seen.lock().unwrap().push(value);
        Ok(())
    });

    let origin = Arc::clone(&cluster.nodes[0].transport);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let ok = origin.execute_remote_code_on(
            PartitionId::new(1),
            origin.partition(),
            SubmissionId::new(1),
            "next-id",
        );
        let _ = tx.send(ok);
    });

    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    assert_eq!(*seen.lock().unwrap(), vec![0]);
}

#[test]
fn control_replies_flow_while_chains_are_refused() {
    let cluster = Cluster::start();
    let inbox = Arc::clone(&cluster.nodes[0].inbox);
    inbox.refuse_chains.store(true, Ordering::SeqCst);

    let mut chain = Chain::new(ChainId::new(30), SubmissionId::new(9), PartitionId::new(1))
        .with_stage("count", Vec::new())
        .expect("stage");
    chain.set_destination(PartitionId::COORDINATOR);
    cluster.node(1).send_chain(chain.clone());
    assert!(wait_until(|| inbox.offers.load(Ordering::SeqCst) > 0));

    // Node 0 holds the chain; its acks still come in on the control channel.
    let coordinator = Arc::clone(&cluster.nodes[0].transport);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let entries = vec![(text("k"), Value::Int(1))];
        let _ = tx.send(coordinator.broadcast_objects(SubmissionId::new(9), entries));
    });
    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    assert!(inbox.chains.lock().unwrap().is_empty());

    inbox.refuse_chains.store(false, Ordering::SeqCst);
    assert!(wait_until(|| inbox.chains.lock().unwrap().len() == 1));
    assert_eq!(inbox.chains.lock().unwrap()[0], chain);
    assert!(inbox.offers.load(Ordering::SeqCst) >= 2);
}

#[test]
fn sequences_are_cluster_wide() {
    let cluster = Cluster::start();

    let mut values: Vec<u64> = thread::scope(|s| {
        let handles: Vec<_> = (0..NODES)
            .map(|i| {
                let node = cluster.node(i);
                s.spawn(move || {
                    (0..3)
                        .map(|_| node.get_counter("chainID").expect("counter"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("counter thread"))
            .collect()
    });
    values.sort_unstable();

    assert_eq!(values, (0..(3 * NODES) as u64).collect::<Vec<_>>());
    // Independent names have independent sequences.
    assert_eq!(cluster.node(1).get_counter("bucketID").expect("counter"), 0);
}

#[test]
fn chains_reach_their_destination() {
    let cluster = Cluster::start();
    let mut chain = Chain::new(ChainId::new(11), SubmissionId::new(1), PartitionId::new(0))
        .with_stage("count", vec![Value::Int(3)])
        .expect("stage");
    chain.set_destination(PartitionId::new(3));

    cluster.node(1).send_chain(chain.clone());

    let inbox = &cluster.nodes[3].inbox;
    assert!(wait_until(|| !inbox.chains.lock().unwrap().is_empty()));
    assert_eq!(inbox.chains.lock().unwrap()[0], chain);
    assert!(cluster.nodes[2].inbox.chains.lock().unwrap().is_empty());
}

#[test]
fn termination_records_return_to_the_submission_node() {
    let cluster = Cluster::start();
    let mut parent = Chain::new(ChainId::new(20), SubmissionId::new(4), PartitionId::new(0));
    let child = parent.spawn_child(ChainId::new(21));

    cluster.node(2).signal_chain_terminated(&child);
    cluster.node(2).signal_chain_terminated(&parent);

    let inbox = &cluster.nodes[0].inbox;
    assert!(wait_until(|| inbox.records.lock().unwrap().len() == 2));
    let records = inbox.records.lock().unwrap();
    assert_eq!(records[0].chain, ChainId::new(21));
    assert_eq!(records[0].parent, Some(ChainId::new(20)));
    assert_eq!(records[1].chain, ChainId::new(20));
    assert_eq!(records[1].children, 1);
}

#[test]
fn termination_signal_reaches_every_peer() {
    let cluster = Cluster::start();

    cluster.node(0).signal_termination();

    for i in 1..NODES {
        let inbox = &cluster.nodes[i].inbox;
        assert!(wait_until(|| !inbox.terminate_from.lock().unwrap().is_empty()));
        assert_eq!(
            inbox.terminate_from.lock().unwrap().as_slice(),
            &[PartitionId::COORDINATOR]
        );
    }
    assert!(cluster.nodes[0].inbox.terminate_from.lock().unwrap().is_empty());
}

#[test]
fn monitoring_counts_traffic() {
    let cluster = Cluster::start();
    cluster.node(0).broadcast_start_monitoring();
    assert!(wait_until(|| {
        (1..NODES).all(|i| cluster.node(i).metrics().is_monitoring())
    }));

    assert!(
        cluster
            .node(0)
            .broadcast_objects(SubmissionId::new(1), vec![(text("m"), Value::Null)])
    );
    let sent = cluster.node(0).metrics().snapshot();
    assert!(sent.messages_sent >= (NODES - 1) as u64);

    cluster.node(0).broadcast_stop_monitoring();
    assert!(!cluster.node(0).metrics().is_monitoring());
    assert!(wait_until(|| {
        (1..NODES).all(|i| !cluster.node(i).metrics().is_monitoring())
    }));
}

#[test]
fn stop_is_idempotent() {
    let cluster = Cluster::start();
    cluster.node(1).stop();
    cluster.node(1).stop();
}
