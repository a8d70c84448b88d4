use async_trait::async_trait;
use keel_common::error::{KeelError, Result};
use keel_common::types::{ClusterConfig, JournalConfig, NodeAddress, NodeId};
use keel_storage::journal::{FixedGeometry, Journal};
use keel_storage::raft::{
    AppendEntriesRequest, AppendEntriesResponse, Bootstrap, Command, CommandRegistry,
    FileHardStateStorage, NodeRole, RaftNode, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum KvCommand {
    Set(String, String),
    Get(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum KvResponse {
    Value(Option<String>),
    Ack,
}

impl Command for KvCommand {
    const COMMAND_TYPE: &'static str = "kv";
    type Response = KvResponse;
}

type Store = Arc<Mutex<HashMap<String, String>>>;

fn kv_registry(store: Store) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register(move |cmd: KvCommand| {
        let mut data = store.lock();
        Ok(match cmd {
            KvCommand::Set(k, v) => {
                data.insert(k, v);
                KvResponse::Ack
            }
            KvCommand::Get(k) => KvResponse::Value(data.get(&k).cloned()),
        })
    });
    registry
}

/// Delivers RPCs by calling the target node directly.
#[derive(Default)]
struct Router {
    nodes: RwLock<HashMap<NodeId, RaftNode>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl Router {
    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftNode> {
        let isolated = self.isolated.read();
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(KeelError::Transport(format!("{} -> {} partitioned", from, to)));
        }
        self.nodes
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| KeelError::Transport(format!("unknown node {}", to)))
    }
}

struct RouterTransport {
    from: NodeId,
    router: Arc<Router>,
}

#[async_trait]
impl RaftTransport for RouterTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.router.route(self.from, target)?;
        node.request_vote(request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.router.route(self.from, target)?;
        node.append_entries(request).await
    }
}

struct Cluster {
    router: Arc<Router>,
    nodes: Vec<RaftNode>,
    stores: HashMap<NodeId, Store>,
    _dir: tempfile::TempDir,
}

impl Cluster {
    fn start(size: usize) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = tempfile::tempdir().unwrap();
        let router = Arc::new(Router::default());
        let ids: Vec<NodeId> = (0..size).map(|_| NodeId::new_v4()).collect();
        let addresses: Vec<NodeAddress> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| NodeAddress {
                host: "127.0.0.1".into(),
                port: 7100 + i as u16,
                node_id: *id,
            })
            .collect();

        let mut nodes = Vec::new();
        let mut stores = HashMap::new();
        for id in &ids {
            let node_dir = dir.path().join(id.to_string());
            let config = ClusterConfig::new(
                *id,
                addresses.clone(),
                JournalConfig::new(node_dir.join("journal")),
            );
            let journal = Journal::open(config.journal.clone(), &FixedGeometry::default()).unwrap();
            let store = Store::default();
            let node = RaftNode::start(
                config,
                journal,
                Arc::new(FileHardStateStorage::new(node_dir.join("hard_state.bin"))),
                kv_registry(store.clone()),
                Arc::new(RouterTransport {
                    from: *id,
                    router: router.clone(),
                }),
                Bootstrap::Join,
            )
            .unwrap();

            router.nodes.write().insert(*id, node.clone());
            stores.insert(*id, store);
            nodes.push(node);
        }

        Self {
            router,
            nodes,
            stores,
            _dir: dir,
        }
    }

    fn leaders(&self) -> Vec<RaftNode> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader() && !self.router.isolated.read().contains(&n.id()))
            .cloned()
            .collect()
    }

    async fn wait_for_leader(&self) -> RaftNode {
        for _ in 0..500 {
            if let [leader] = self.leaders().as_slice() {
                return leader.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no single leader elected");
    }

    async fn wait_applied(&self, nodes: &[RaftNode], index: u64) {
        for _ in 0..500 {
            if nodes.iter().all(|n| n.last_applied() >= index) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entries up to {} were not applied everywhere", index);
    }

    async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_elect_one_leader() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader().await;
    let term = leader.current_term();
    assert!(term >= 1);

    // followers learn who leads from the first heartbeat
    for _ in 0..500 {
        let settled = cluster
            .nodes
            .iter()
            .filter(|n| n.id() != leader.id())
            .all(|n| n.role() == NodeRole::Follower && n.leader_id() == Some(leader.id()));
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for node in cluster.nodes.iter().filter(|n| n.id() != leader.id()) {
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.leader_id(), Some(leader.id()));
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commands_replicate_to_every_node() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader().await;

    for i in 0..5 {
        let result = leader
            .execute(&KvCommand::Set(format!("key-{}", i), format!("value-{}", i)))
            .await
            .unwrap();
        assert_eq!(result.decode::<KvResponse>().unwrap(), KvResponse::Ack);
    }
    let read = leader.execute(&KvCommand::Get("key-3".into())).await.unwrap();
    assert_eq!(
        read.decode::<KvResponse>().unwrap(),
        KvResponse::Value(Some("value-3".into()))
    );

    let last = leader.last_log_index();
    cluster.wait_applied(&cluster.nodes, last).await;
    for node in &cluster.nodes {
        assert_eq!(node.last_log_index(), last);
        let store = cluster.stores[&node.id()].lock();
        assert_eq!(store.len(), 5);
        assert_eq!(store.get("key-0").map(String::as_str), Some("value-0"));
    }
    assert_eq!(leader.pending_commands(), 0);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_refuses_commands_with_leader_hint() {
    let cluster = Cluster::start(3);
    let leader = cluster.wait_for_leader().await;
    leader
        .execute(&KvCommand::Set("a".into(), "1".into()))
        .await
        .unwrap();

    let follower = cluster
        .nodes
        .iter()
        .find(|n| n.id() != leader.id() && n.leader_id() == Some(leader.id()))
        .cloned()
        .expect("a follower that knows the leader");
    let err = follower
        .execute(&KvCommand::Set("b".into(), "2".into()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KeelError::NotLeader { leader_hint } if leader_hint == Some(leader.id())
    ));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_leader_after_partition() {
    let cluster = Cluster::start(3);
    let old = cluster.wait_for_leader().await;
    old.execute(&KvCommand::Set("before".into(), "1".into()))
        .await
        .unwrap();
    let old_term = old.current_term();

    cluster.router.isolated.write().insert(old.id());
    let new = cluster.wait_for_leader().await;
    assert_ne!(new.id(), old.id());
    assert!(new.current_term() > old_term);

    new.execute(&KvCommand::Set("after".into(), "2".into()))
        .await
        .unwrap();

    // the old leader rejoins and catches up under the new term
    cluster.router.isolated.write().clear();
    let last = new.last_log_index();
    cluster.wait_applied(&cluster.nodes, last).await;
    assert_eq!(old.role(), NodeRole::Follower);
    assert_eq!(old.current_term(), new.current_term());
    assert_eq!(
        cluster.stores[&old.id()].lock().get("after").map(String::as_str),
        Some("2")
    );
    cluster.shutdown().await;
}
