//! Multi-node tests over real gRPC servers on localhost.

mod common;

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use buildfarm::checkout::LocalCheckout;
use buildfarm::config::{NodeConfig, PeerConfig};
use buildfarm::election::{ElectionNode, ElectionStrategy, MajorityElection, StaticElection};
use buildfarm::model::BucketStatus;
use buildfarm::node::WorkerNode;
use buildfarm::store::memory::MemoryStore;
use buildfarm::store::EntityStore;
use buildfarm::worker::BuildTool;
use common::{memory_store, shell_project, RecordingNotifier};

/// Node configuration with short timeouts for fast tests
fn test_config(node_id: u64, port: u16, peers: &[(u64, u16)], root: &Path) -> NodeConfig {
    let mut config = NodeConfig::new(node_id, format!("127.0.0.1:{}", port).parse().unwrap())
        .with_build_tool(BuildTool::shell());
    config.peers = peers
        .iter()
        .map(|(id, p)| PeerConfig {
            node_id: *id,
            addr: format!("127.0.0.1:{}", p),
        })
        .collect();
    config.election_timeout_min_ms = 50;
    config.election_timeout_max_ms = 100;
    config.heartbeat_interval_ms = 20;
    config.leader_cycle_interval_ms = 200;
    config.idle_wait_ms = 200;
    config.dispatch_jitter_max_ms = 0;
    config.log_polling_interval_ms = 50;
    config.transient_retry_delay_ms = 10;
    config.checkout_root = root.to_path_buf();
    config
}

fn spawn_node(
    config: NodeConfig,
    store: Arc<MemoryStore>,
    election: Arc<dyn ElectionStrategy>,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let node = Arc::new(WorkerNode::new(
        config.clone(),
        store,
        Arc::new(LocalCheckout::new(&config.checkout_root)),
        Arc::new(RecordingNotifier::default()),
        election,
    ));
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = node.run(shutdown).await {
            panic!("node failed: {}", e);
        }
    })
}

async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_and_follower_share_a_build() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let mut project = shell_project(
        "app",
        &[("one", &["echo one; sleep 1"]), ("two", &["echo two; sleep 1"])],
    );
    project.build_requested = true;
    store.register_project(&project).unwrap();

    let shutdown = CancellationToken::new();
    let leader_uri = "http://127.0.0.1:57411";
    let leader = spawn_node(
        test_config(1, 57411, &[], &root.path().join("leader")),
        store.clone(),
        Arc::new(StaticElection::leader(leader_uri)),
        &shutdown,
    );
    let follower = spawn_node(
        test_config(2, 57412, &[], &root.path().join("follower")),
        store.clone(),
        Arc::new(StaticElection::follower(leader_uri)),
        &shutdown,
    );

    let finished = wait_for(Duration::from_secs(15), || {
        let store = store.clone();
        async move {
            match store.last_build("app").unwrap() {
                Some(build) => store
                    .buckets(build.id)
                    .unwrap()
                    .iter()
                    .all(|b| b.status == BucketStatus::Done),
                None => false,
            }
        }
    })
    .await;
    assert!(finished, "buckets were not processed in time");

    let build = store.last_build("app").unwrap().unwrap();
    let buckets = store.buckets(build.id).unwrap();
    let workers: HashSet<_> = buckets.iter().filter_map(|b| b.worker_uri.clone()).collect();
    assert_eq!(workers.len(), 2, "both nodes should have processed a bucket");
    for bucket in &buckets {
        assert!(bucket.log.contains(&bucket.name));
        assert_eq!(bucket.dispatch_count, 1);
    }

    shutdown.cancel();
    leader.await.unwrap();
    follower.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_agree_on_one_leader() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let ports = [(1, 57421), (2, 57422), (3, 57423)];

    let shutdown = CancellationToken::new();
    let mut elections = Vec::new();
    let mut handles = Vec::new();
    for (id, port) in ports {
        let peers: Vec<_> = ports.iter().copied().filter(|(p, _)| *p != id).collect();
        let config = test_config(id, port, &peers, root.path());
        let election = Arc::new(MajorityElection::new(Arc::new(ElectionNode::new(
            config.clone(),
        ))));
        handles.push(spawn_node(config, store.clone(), election.clone(), &shutdown));
        elections.push(election);
    }

    let agreed = wait_for(Duration::from_secs(10), || {
        let elections = elections.clone();
        async move {
            let mut leaders = Vec::new();
            let mut known = HashSet::new();
            for election in &elections {
                if election.is_leader().await {
                    leaders.push(election.leader_uri().await);
                }
                known.insert(election.leader_uri().await);
            }
            leaders.len() == 1 && known.len() == 1 && known.iter().all(Option::is_some)
        }
    })
    .await;
    assert!(agreed, "no single leader was elected");

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
