//! End-to-end transfers between two nodes on an in-memory network.

use lanwarp::crypto::{GroupSecret, Identity, TrustStore};
use lanwarp::discovery::Peer;
use lanwarp::node::{Node, NodeEvent};
use lanwarp::operation::{Direction, TransferState};
use lanwarp::remote::RemoteSettings;
use lanwarp::transport::MemoryNetwork;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

async fn start_node(network: &MemoryNetwork, name: &str, save_directory: &Path, auto_accept: bool) -> Node {
    let trust = TrustStore::new(
        Identity::new(name, "0000CAFE"),
        &GroupSecret::new("Warpinator"),
        None,
    )
    .unwrap();
    let settings = RemoteSettings {
        display_name: name.to_string(),
        save_directory: save_directory.to_path_buf(),
        auto_accept,
        chunk_size: 4096,
        cache_depth: 2,
        ..RemoteSettings::default()
    };
    Node::start(Arc::new(trust), Arc::new(network.transport()), settings)
        .await
        .unwrap()
}

/// Two nodes that know each other and are online.
async fn connected_pair(network: &MemoryNetwork, save_directory: &Path, auto_accept: bool) -> (Node, Node) {
    let sender_dir = TempDir::new().unwrap();
    let sender = start_node(network, "sender", sender_dir.path(), false).await;
    let receiver = start_node(network, "receiver", save_directory, auto_accept).await;

    sender
        .discover(Peer::from_addr(receiver.identity(), receiver.local_addr()))
        .await
        .unwrap();
    sender.wait_online(&receiver.identity(), WAIT).await.unwrap();
    receiver.wait_online(&sender.identity(), WAIT).await.unwrap();
    (sender, receiver)
}

/// States of one transfer in publication order, up to and including a terminal one.
async fn collect_states(
    events: &mut broadcast::Receiver<NodeEvent>,
    transfer_id: i64,
    direction: Direction,
) -> Vec<TransferState> {
    let mut states = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            if let NodeEvent::TransferStateChanged {
                transfer_id: id,
                direction: d,
                state,
                ..
            } = events.recv().await.unwrap()
            {
                if id == transfer_id && d == direction {
                    let terminal = state.is_terminal();
                    states.push(state);
                    if terminal {
                        return;
                    }
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transfer {} never finished, saw {:?}", transfer_id, states));
    states
}

async fn next_incoming(events: &mut broadcast::Receiver<NodeEvent>) -> (String, i64, String) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let NodeEvent::IncomingTransfer {
                peer_id,
                transfer_id,
                title,
                ..
            } = events.recv().await.unwrap()
            {
                return (peer_id, transfer_id, title);
            }
        }
    })
    .await
    .unwrap()
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

fn within_a_second(a: SystemTime, b: SystemTime) -> bool {
    let delta = a.duration_since(b).or_else(|_| b.duration_since(a)).unwrap();
    delta <= Duration::from_secs(1)
}

#[tokio::test]
async fn test_single_file_transfer() {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();

    let file = source.path().join("notes.txt");
    let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, &content).unwrap();
    let stamp = filetime::FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(&file, stamp).unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), false).await;
    let mut sender_events = sender.events();
    let mut receiver_events = receiver.events();

    let transfer_id = sender
        .send_files(&receiver.identity(), vec![file.clone()])
        .await
        .unwrap();

    let (from, incoming_id, title) = next_incoming(&mut receiver_events).await;
    assert_eq!(from, sender.identity());
    assert_eq!(incoming_id, transfer_id);
    assert_eq!(title, "notes.txt");

    receiver.accept(&sender.identity(), transfer_id).await.unwrap();

    let upload = collect_states(&mut sender_events, transfer_id, Direction::Upload).await;
    assert_eq!(
        upload,
        vec![
            TransferState::Requested,
            TransferState::Started,
            TransferState::Completed
        ]
    );
    let download = collect_states(&mut receiver_events, transfer_id, Direction::Download).await;
    assert_eq!(download.last(), Some(&TransferState::Completed));

    let received = save.path().join("notes.txt");
    assert_eq!(std::fs::read(&received).unwrap(), content);
    assert!(within_a_second(mtime(&received), mtime(&file)));

    let op = receiver
        .transfer(&sender.identity(), Direction::Download, transfer_id)
        .unwrap();
    assert_eq!(op.metrics().bytes_transferred, content.len() as u64);
    assert_eq!(op.metrics().progress(), 1.0);
}

#[tokio::test]
async fn test_directory_tree_with_auto_accept() {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();

    let root = source.path().join("project");
    std::fs::create_dir_all(root.join("src/nested")).unwrap();
    std::fs::write(root.join("README.md"), b"# project\n").unwrap();
    std::fs::write(root.join("src/main.rs"), b"fn main() {}\n").unwrap();
    std::fs::write(root.join("src/nested/empty.txt"), b"").unwrap();
    let extra = source.path().join("extra.bin");
    std::fs::write(&extra, vec![7u8; 9000]).unwrap();

    let dir_stamp = filetime::FileTime::from_unix_time(1_500_000_000, 0);
    filetime::set_file_mtime(root.join("src"), dir_stamp).unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), true).await;
    let mut receiver_events = receiver.events();

    let transfer_id = sender
        .send_files(&receiver.identity(), vec![root.clone(), extra])
        .await
        .unwrap();

    let download = collect_states(&mut receiver_events, transfer_id, Direction::Download).await;
    assert_eq!(download.last(), Some(&TransferState::Completed));

    let out = save.path().join("project");
    assert_eq!(std::fs::read(out.join("README.md")).unwrap(), b"# project\n");
    assert_eq!(std::fs::read(out.join("src/main.rs")).unwrap(), b"fn main() {}\n");
    assert_eq!(std::fs::read(out.join("src/nested/empty.txt")).unwrap(), b"");
    assert_eq!(std::fs::read(save.path().join("extra.bin")).unwrap(), vec![7u8; 9000]);
    assert!(within_a_second(mtime(&out.join("src")), mtime(&root.join("src"))));

    let op = sender
        .transfer(&receiver.identity(), Direction::Upload, transfer_id)
        .unwrap();
    assert_eq!(op.title, "2 files");
    assert_eq!(op.entry_count, 7);
}

#[tokio::test]
async fn test_receiver_declines_request() {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();
    let file = source.path().join("declined.txt");
    std::fs::write(&file, b"no thanks").unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), false).await;
    let mut sender_events = sender.events();
    let mut receiver_events = receiver.events();

    let transfer_id = sender
        .send_files(&receiver.identity(), vec![file])
        .await
        .unwrap();
    next_incoming(&mut receiver_events).await;

    receiver.cancel(&sender.identity(), transfer_id).unwrap();

    let upload = collect_states(&mut sender_events, transfer_id, Direction::Upload).await;
    assert_eq!(upload.last(), Some(&TransferState::RequestCanceled));
    assert!(!save.path().join("declined.txt").exists());

    let removed = receiver.remove(&sender.identity(), transfer_id).unwrap();
    assert_eq!(*removed.state(), TransferState::RequestCanceled);
    assert!(receiver
        .transfer(&sender.identity(), Direction::Download, transfer_id)
        .is_none());
}

#[tokio::test]
async fn test_sender_withdraws_request() {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();
    let file = source.path().join("withdrawn.txt");
    std::fs::write(&file, b"changed my mind").unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), false).await;
    let mut receiver_events = receiver.events();

    let transfer_id = sender
        .send_files(&receiver.identity(), vec![file])
        .await
        .unwrap();
    next_incoming(&mut receiver_events).await;

    sender.cancel(&receiver.identity(), transfer_id).unwrap();

    let download = collect_states(&mut receiver_events, transfer_id, Direction::Download).await;
    assert_eq!(download.last(), Some(&TransferState::RequestCanceled));
    assert!(receiver.accept(&sender.identity(), transfer_id).await.is_err());
}

#[tokio::test]
async fn test_active_transfer_cannot_be_removed() {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();
    let file = source.path().join("pending.txt");
    std::fs::write(&file, b"pending").unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), false).await;
    let transfer_id = sender
        .send_files(&receiver.identity(), vec![file])
        .await
        .unwrap();

    assert!(sender.remove(&receiver.identity(), transfer_id).is_err());
    assert_eq!(
        sender
            .transfer(&receiver.identity(), Direction::Upload, transfer_id)
            .map(|op| op.state().clone()),
        Some(TransferState::Requested)
    );
}

#[tokio::test]
async fn test_receiver_failure_fails_the_upload() {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();

    let file = source.path().join("blocked.bin");
    std::fs::write(&file, vec![3u8; 20_000]).unwrap();
    // A directory in the way makes the first write on the receiver fail.
    std::fs::create_dir(save.path().join("blocked.bin")).unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), true).await;
    let mut sender_events = sender.events();
    let mut receiver_events = receiver.events();

    let transfer_id = sender
        .send_files(&receiver.identity(), vec![file])
        .await
        .unwrap();

    let download = collect_states(&mut receiver_events, transfer_id, Direction::Download).await;
    assert!(matches!(download.last(), Some(TransferState::Failed(_))));

    let upload = collect_states(&mut sender_events, transfer_id, Direction::Upload).await;
    assert!(matches!(upload.last(), Some(TransferState::Failed(_))));
    assert!(save.path().join("blocked.bin").is_dir());
}

/// Wait until the transfer reports `Started` in the given direction.
async fn wait_started(events: &mut broadcast::Receiver<NodeEvent>, transfer_id: i64, direction: Direction) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let NodeEvent::TransferStateChanged {
                transfer_id: id,
                direction: d,
                state: TransferState::Started,
                ..
            } = events.recv().await.unwrap()
            {
                if id == transfer_id && d == direction {
                    return;
                }
            }
        }
    })
    .await
    .unwrap()
}

/// Start a large auto-accepted transfer, stop it from one side while it runs and
/// return both sides' final states with the received size.
async fn stop_running_transfer(stop_from_sender: bool) -> (TransferState, TransferState, u64, u64) {
    let network = MemoryNetwork::new();
    let source = TempDir::new().unwrap();
    let save = TempDir::new().unwrap();

    let file = source.path().join("large.bin");
    let content: Vec<u8> = (0..32 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&file, &content).unwrap();

    let (sender, receiver) = connected_pair(&network, save.path(), true).await;
    let mut sender_events = sender.events();
    let mut receiver_events = receiver.events();

    let transfer_id = sender
        .send_files(&receiver.identity(), vec![file])
        .await
        .unwrap();

    // The receiver starts before it asks for the stream, so the upload starting
    // means both sides are running.
    wait_started(&mut sender_events, transfer_id, Direction::Upload).await;
    if stop_from_sender {
        sender.cancel(&receiver.identity(), transfer_id).unwrap();
    } else {
        receiver.cancel(&sender.identity(), transfer_id).unwrap();
    }

    let upload = collect_states(&mut sender_events, transfer_id, Direction::Upload).await;
    let download = collect_states(&mut receiver_events, transfer_id, Direction::Download).await;

    let received = std::fs::metadata(save.path().join("large.bin"))
        .map(|m| m.len())
        .unwrap_or(0);
    (
        upload.last().cloned().unwrap(),
        download.last().cloned().unwrap(),
        received,
        content.len() as u64,
    )
}

#[tokio::test]
async fn test_sender_stops_running_transfer() {
    let (upload, download, received, total) = stop_running_transfer(true).await;

    assert_eq!(upload, TransferState::TransferCanceled);
    assert_eq!(download, TransferState::TransferCanceled);
    assert!(received < total, "received {} of {}", received, total);
}

#[tokio::test]
async fn test_receiver_stops_running_transfer() {
    let (upload, download, received, total) = stop_running_transfer(false).await;

    assert_eq!(upload, TransferState::TransferCanceled);
    assert_eq!(download, TransferState::TransferCanceled);
    assert!(received < total, "received {} of {}", received, total);
}
