//! Peer lifecycle across discovery, transport failures and trust changes.

use lanwarp::crypto::{GroupSecret, Identity, TrustStore};
use lanwarp::discovery::{DiscoveryEvent, Peer};
use lanwarp::node::{Node, NodeEvent};
use lanwarp::remote::{RemoteSettings, RemoteState};
use lanwarp::rpc::Connectivity;
use lanwarp::transport::MemoryNetwork;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

async fn start_node(network: &MemoryNetwork, name: &str, group: &str) -> Node {
    let trust = TrustStore::new(Identity::new(name, "0000BEEF"), &GroupSecret::new(group), None).unwrap();
    let settings = RemoteSettings {
        display_name: name.to_string(),
        ping_interval: Duration::from_millis(200),
        ..RemoteSettings::default()
    };
    Node::start(Arc::new(trust), Arc::new(network.transport()), settings)
        .await
        .unwrap()
}

/// Lifecycle states reported for `id`, up to and including `until`.
async fn states_until(
    events: &mut broadcast::Receiver<NodeEvent>,
    id: &str,
    until: RemoteState,
) -> Vec<RemoteState> {
    let mut states = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            if let NodeEvent::RemoteStateChanged { id: peer, state } = events.recv().await.unwrap() {
                if peer == id {
                    states.push(state);
                    if state == until {
                        return;
                    }
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {}, saw {:?}", id, until, states));
    states
}

fn peer_of(node: &Node) -> Peer {
    Peer::from_addr(node.identity(), node.local_addr())
}

#[tokio::test]
async fn test_offline_then_rediscovered() {
    let network = MemoryNetwork::new();
    let alpha = start_node(&network, "alpha", "Warpinator").await;
    let beta = start_node(&network, "beta", "Warpinator").await;
    let beta_id = beta.identity();
    let mut events = alpha.events();

    alpha.discover(peer_of(&beta)).await.unwrap();
    assert_eq!(
        states_until(&mut events, &beta_id, RemoteState::Online).await,
        vec![
            RemoteState::MdnsDiscovered,
            RemoteState::WaitingForDuplex,
            RemoteState::Online
        ]
    );

    alpha.forget(&beta_id).await.unwrap();
    assert_eq!(
        states_until(&mut events, &beta_id, RemoteState::MdnsOffline).await,
        vec![RemoteState::MdnsOffline]
    );

    // Late transport callbacks must not revive an offline peer.
    let remote = alpha.registry().get(&beta_id).unwrap();
    remote.notify_connectivity(Connectivity::Ready);
    remote.notify_connectivity(Connectivity::TransientFailure);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(remote.state(), RemoteState::MdnsOffline);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    alpha.discover(peer_of(&beta)).await.unwrap();
    assert_eq!(
        states_until(&mut events, &beta_id, RemoteState::Online).await,
        vec![
            RemoteState::MdnsDiscovered,
            RemoteState::WaitingForDuplex,
            RemoteState::Online
        ]
    );
}

#[tokio::test]
async fn test_requester_is_registered_by_the_other_side() {
    let network = MemoryNetwork::new();
    let alpha = start_node(&network, "alpha", "Warpinator").await;
    let beta = start_node(&network, "beta", "Warpinator").await;

    alpha
        .discovery_sender()
        .send(DiscoveryEvent::Appeared(peer_of(&beta)))
        .await
        .unwrap();

    beta.wait_online(&alpha.identity(), WAIT).await.unwrap();
    let peers = beta.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, alpha.identity());
    assert_eq!(peers[0].address, Some(alpha.local_addr().to_string()));
}

#[tokio::test]
async fn test_different_group_never_comes_online() {
    let network = MemoryNetwork::new();
    let alpha = start_node(&network, "alpha", "Warpinator").await;
    let beta = start_node(&network, "beta", "SomethingElse").await;
    let beta_id = beta.identity();
    let mut events = alpha.events();

    alpha.discover(peer_of(&beta)).await.unwrap();
    let states = states_until(&mut events, &beta_id, RemoteState::Failure).await;
    assert!(!states.contains(&RemoteState::Online));

    assert!(!alpha.registry().get(&beta_id).unwrap().has_certificate());
}

#[tokio::test]
async fn test_lost_link_fails_until_forgotten() {
    let network = MemoryNetwork::new();
    let alpha = start_node(&network, "alpha", "Warpinator").await;
    let beta = start_node(&network, "beta", "Warpinator").await;
    let beta_id = beta.identity();
    let mut events = alpha.events();

    alpha.discover(peer_of(&beta)).await.unwrap();
    states_until(&mut events, &beta_id, RemoteState::Online).await;

    network.disconnect(beta.local_addr());
    states_until(&mut events, &beta_id, RemoteState::Failure).await;

    let remote = alpha.registry().get(&beta_id).unwrap();
    assert!(remote.client().is_none());

    // A peer that is gone for good stops being retried once discovery drops it.
    alpha.forget(&beta_id).await.unwrap();
    states_until(&mut events, &beta_id, RemoteState::MdnsOffline).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(remote.state(), RemoteState::MdnsOffline);
}

#[tokio::test]
async fn test_regenerated_certificate_is_exchanged_again() {
    let network = MemoryNetwork::new();
    let alpha = start_node(&network, "alpha", "Warpinator").await;
    let beta = start_node(&network, "beta", "Warpinator").await;
    let alpha_id = alpha.identity();
    let beta_id = beta.identity();
    let mut alpha_events = alpha.events();
    let mut beta_events = beta.events();

    alpha.discover(peer_of(&beta)).await.unwrap();
    states_until(&mut alpha_events, &beta_id, RemoteState::Online).await;
    states_until(&mut beta_events, &alpha_id, RemoteState::Online).await;

    beta.regenerate_certificate().await.unwrap();
    assert_eq!(
        states_until(&mut beta_events, &alpha_id, RemoteState::Online).await,
        vec![
            RemoteState::MdnsDiscovered,
            RemoteState::WaitingForDuplex,
            RemoteState::Online
        ]
    );

    // Alpha still pins the old certificate; its next connect has to fetch the new one.
    alpha.forget(&beta_id).await.unwrap();
    states_until(&mut alpha_events, &beta_id, RemoteState::MdnsOffline).await;
    alpha.discover(peer_of(&beta)).await.unwrap();
    let states = states_until(&mut alpha_events, &beta_id, RemoteState::Online).await;
    assert!(states.contains(&RemoteState::Failure));
    assert!(alpha.registry().get(&beta_id).unwrap().has_certificate());
}
