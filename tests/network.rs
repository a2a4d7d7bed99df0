//! Two-node scenarios over loopback TCP

use peerlink_core::content::dag::CHUNK_SIZE;
use peerlink_core::exchange::{
    publish, publish_and_announce, resolve_with, ResolveError, ResolveOptions,
};
use peerlink_core::p2p::{BootstrapConfig, Node, P2PError};
use peerlink_core::repo::{
    ProvisionOptions, RepoError, RepoRoot, Repository, RoutingMode, SwarmKey,
};
use peerlink_core::role::{self, ClientConfig, NetworkMode, NodeRole, Outcome, SeedConfig};
use peerlink_core::{ContentId, NodeConfig, PeerAddress};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn loopback() -> ProvisionOptions {
    ProvisionOptions {
        swarm_addresses: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        ..Default::default()
    }
}

fn config(output_dir: &TempDir) -> NodeConfig {
    NodeConfig {
        enable_mdns: false,
        output_dir: output_dir.path().to_path_buf(),
        ..Default::default()
    }
}

async fn root_with(peers: &[PeerAddress], key: Option<SwarmKey>) -> RepoRoot {
    let root = Repository::provision_with(ProvisionOptions {
        bootstrap_peers: peers.to_vec(),
        ..loopback()
    })
    .await
    .unwrap();

    if let Some(key) = key {
        key.install(root.path()).await.unwrap();
    }
    root
}

async fn query_only_root() -> RepoRoot {
    Repository::provision_with(ProvisionOptions {
        routing: RoutingMode::DhtClient,
        ..loopback()
    })
    .await
    .unwrap()
}

async fn node(ctx: &CancellationToken, root: RepoRoot, out: &TempDir) -> Node {
    Node::build(ctx, root, config(out)).await.unwrap()
}

#[tokio::test]
async fn test_seed_client_round_trip() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();

    let seed = node(&ctx, root_with(&[], None).await, &out).await;
    let _seed_bootstrap = seed.bootstrap(None).await.unwrap();

    let small = b"This is the Data I push into IPFS".to_vec();
    let large: Vec<u8> = (0..CHUNK_SIZE * 2 + 1234).map(|i| (i % 253) as u8).collect();
    let small_cid = publish(&seed, &small).await.unwrap();
    let large_cid = publish(&seed, &large).await.unwrap();

    let seed_info = seed.addr_info();
    let client = node(&ctx, root_with(&[seed_info.clone()], None).await, &out).await;
    let _client_bootstrap = client.bootstrap(Some(seed_info)).await.unwrap();
    assert!(client.connected_peers().contains(&seed.peer_id()));

    let options = ResolveOptions {
        timeout: Duration::from_secs(30),
        output_dir: out.path().to_path_buf(),
    };

    let handle = resolve_with(&client, small_cid, options.clone()).await.unwrap();
    assert_eq!(handle.data, small);

    let handle = resolve_with(&client, large_cid, options).await.unwrap();
    assert_eq!(handle.data, large);
    assert_eq!(tokio::fs::read(&handle.path).await.unwrap(), large);

    // Fetched blocks are kept locally
    assert!(client.blockstore().has(&large_cid).await.unwrap());

    ctx.cancel();
}

#[tokio::test]
async fn test_publish_and_announce_to_connected_peer() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();

    let seed = node(&ctx, root_with(&[], None).await, &out).await;
    let client = node(&ctx, root_with(&[], None).await, &out).await;
    client
        .connect(&seed.addr_info(), Duration::from_secs(10))
        .await
        .unwrap();

    let result = publish_and_announce(&client, b"announced", Duration::from_secs(20)).await;
    assert!(result.is_ok());

    // The seed now lists the client as a provider
    let cid = result.unwrap();
    let providers = seed.find_providers(cid).await.unwrap();
    assert!(providers.contains(&client.peer_id()));

    ctx.cancel();
}

#[tokio::test]
async fn test_resolve_from_unconnected_provider() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();

    let relay = node(&ctx, root_with(&[], None).await, &out).await;
    let relay_info = relay.addr_info();

    // A query-only client is never handed out as a DHT peer, so the holder
    // has no way to dial it
    let client = node(&ctx, query_only_root().await, &out).await;
    client.connect(&relay_info, Duration::from_secs(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let holder = node(&ctx, root_with(&[], None).await, &out).await;
    holder.connect(&relay_info, Duration::from_secs(10)).await.unwrap();

    let payload: Vec<u8> = (0..CHUNK_SIZE + 99).map(|i| (i % 241) as u8).collect();
    let cid = publish_and_announce(&holder, &payload, Duration::from_secs(20))
        .await
        .unwrap();

    // Only the DHT can lead the client to the holder
    assert!(!client.connected_peers().contains(&holder.peer_id()));
    assert!(!client.blockstore().has(&cid).await.unwrap());
    assert!(!relay.blockstore().has(&cid).await.unwrap());

    let handle = resolve_with(
        &client,
        cid,
        ResolveOptions {
            timeout: Duration::from_secs(30),
            output_dir: out.path().to_path_buf(),
        },
    )
    .await
    .unwrap();

    assert_eq!(handle.data, payload);
    assert!(client.blockstore().has(&cid).await.unwrap());

    ctx.cancel();
}

#[tokio::test]
async fn test_missing_content_errors_within_deadline() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();

    let seed = node(&ctx, root_with(&[], None).await, &out).await;
    let seed_info = seed.addr_info();
    let client = node(&ctx, root_with(&[seed_info.clone()], None).await, &out).await;
    let _bootstrap = client.bootstrap(Some(seed_info)).await.unwrap();

    let missing = ContentId::for_block(peerlink_core::content::Codec::Raw, b"never published");
    let deadline = Duration::from_secs(3);

    let started = Instant::now();
    let result = resolve_with(
        &client,
        missing,
        ResolveOptions {
            timeout: deadline,
            output_dir: out.path().to_path_buf(),
        },
    )
    .await;

    assert!(matches!(
        result,
        Err(ResolveError::Timeout { .. }) | Err(ResolveError::NotFound(_))
    ));
    assert!(started.elapsed() < deadline + Duration::from_secs(2));

    ctx.cancel();
}

#[tokio::test]
async fn test_private_network_partition() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();
    let key = SwarmKey::generate();

    let seed = node(&ctx, root_with(&[], Some(key)).await, &out).await;
    let seed_info = seed.addr_info();

    // Client without the key cannot get in
    let outsider = node(&ctx, root_with(&[seed_info.clone()], None).await, &out).await;
    let result = outsider.connect(&seed_info, Duration::from_secs(10)).await;
    assert!(result.is_err());
    assert_eq!(outsider.connected_peer_count(), 0);

    // Client with the key can
    let member = node(&ctx, root_with(&[seed_info.clone()], Some(key)).await, &out).await;
    member.connect(&seed_info, Duration::from_secs(10)).await.unwrap();
    assert_eq!(member.pnet_fingerprint(), seed.pnet_fingerprint());

    ctx.cancel();
}

#[tokio::test]
async fn test_client_bootstrap_threshold() {
    let peer = PeerAddress::new(
        libp2p::PeerId::random(),
        vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
    );

    assert_eq!(BootstrapConfig::with_peer(peer).min_peer_threshold, 1);
    assert_eq!(BootstrapConfig::with_peers(vec![]).min_peer_threshold, 0);
}

#[tokio::test]
async fn test_unreachable_bootstrap_is_not_fatal() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();

    // Nobody listens on port 1
    let dead = PeerAddress::new(
        libp2p::PeerId::random(),
        vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
    );
    let client = node(&ctx, root_with(&[dead.clone()], None).await, &out).await;

    let handle = client.bootstrap(Some(dead)).await.unwrap();
    assert!(!handle.is_finished());
    assert_eq!(client.connected_peer_count(), 0);

    ctx.cancel();
}

#[tokio::test]
async fn test_repository_owned_by_one_node() {
    let ctx = CancellationToken::new();
    let out = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();

    Repository::init(dir.path(), &loopback()).await.unwrap();

    let first = Node::build(&ctx, RepoRoot::Persistent(dir.path().into()), config(&out))
        .await
        .unwrap();
    let second = Node::build(&ctx, RepoRoot::Persistent(dir.path().into()), config(&out)).await;
    assert!(matches!(
        second,
        Err(P2PError::Repo(RepoError::Locked(_)))
    ));

    // Released once the node is gone
    drop(first);
    Node::build(&ctx, RepoRoot::Persistent(dir.path().into()), config(&out))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_role_scenario() {
    let ctx = CancellationToken::new();
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let bootstrap_file = work.path().join("IDBootstrapIPFS");
    let cid_file = work.path().join("CID.txt");

    let seed = role::run_with(
        &ctx,
        NetworkMode::Public,
        NodeRole::Seed(SeedConfig {
            bootstrap_file: bootstrap_file.clone(),
            cid_file: cid_file.clone(),
            ..Default::default()
        }),
        config(&out),
        loopback(),
    )
    .await
    .unwrap();

    let published = match &seed.outcome {
        Outcome::Published(cid) => *cid,
        other => panic!("unexpected seed outcome {:?}", other),
    };

    let client = role::run_with(
        &ctx,
        NetworkMode::Public,
        NodeRole::Client(ClientConfig {
            bootstrap_file,
            cid_file,
        }),
        config(&out),
        loopback(),
    )
    .await
    .unwrap();

    match &client.outcome {
        Outcome::Retrieved(handle) => {
            assert_eq!(handle.id, published);
            assert_eq!(handle.data, role::DEFAULT_PAYLOAD);
            assert_eq!(handle.path, out.path().join(published.to_string()));
        }
        other => panic!("unexpected client outcome {:?}", other),
    }

    client.shutdown();
    seed.shutdown();
}

#[tokio::test]
async fn test_private_role_scenario() {
    let ctx = CancellationToken::new();
    let work = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let key = SwarmKey::generate();

    let seed = role::run_with(
        &ctx,
        NetworkMode::Private(key),
        NodeRole::Seed(SeedConfig {
            bootstrap_file: work.path().join("IDBootstrapIPFS"),
            cid_file: work.path().join("CID.txt"),
            payload: b"private payload".to_vec(),
        }),
        config(&out),
        loopback(),
    )
    .await
    .unwrap();
    assert!(seed.node.is_private());

    let client = role::run_with(
        &ctx,
        NetworkMode::Private(key),
        NodeRole::Client(ClientConfig {
            bootstrap_file: work.path().join("IDBootstrapIPFS"),
            cid_file: work.path().join("CID.txt"),
        }),
        config(&out),
        loopback(),
    )
    .await
    .unwrap();

    assert!(matches!(
        &client.outcome,
        Outcome::Retrieved(handle) if handle.data == b"private payload"
    ));

    ctx.cancel();
}
