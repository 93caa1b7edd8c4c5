//! End-to-end tests spinning up whole rings on loopback TCP and driving
//! them through the client API.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::client::{OpFailure, RingClient};
use crate::commit::CommitNode;
use crate::utils::RingStoreError;

use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Config for 4-node rings: snappy timeouts so tests finish quickly.
const CFG4: &str = "tx_timeout_ms = 400\n\
                    tx_rtm_update_interval_ms = 100\n\
                    hb_hear_timeout_min_ms = 300\n\
                    hb_hear_timeout_max_ms = 600\n\
                    hb_send_interval_ms = 50\n";

/// Config for 4-node rings under majority failure: manager descriptors
/// must not expire, so the leader keeps leading (and aborting) instead of
/// forwarding commits away.
const CFG4_STATIC: &str = "tx_timeout_ms = 300\n\
                           tx_rtm_update_interval_ms = 30000\n\
                           hb_hear_timeout_min_ms = 300\n\
                           hb_hear_timeout_max_ms = 600\n\
                           hb_send_interval_ms = 50\n";

/// Config for a single-node ring exercising the full protocol machinery
/// through loopback delivery.
const CFG1: &str = "replication_factor = 1\n\
                    quorum_factor = 1\n\
                    rtm_min_known = 1\n\
                    tx_timeout_ms = 300\n\
                    tx_rtm_update_interval_ms = 100\n\
                    hb_hear_timeout_min_ms = 300\n\
                    hb_hear_timeout_max_ms = 600\n\
                    hb_send_interval_ms = 50\n";

fn loop_addr(base: u16, id: u8) -> SocketAddr {
    format!("127.0.0.1:{}", base + id as u16).parse().unwrap()
}

/// Spawns a ring of `population` nodes on loopback ports. Returns the
/// termination senders; sending `true` on one "crashes" that node (its
/// event loop exits and it goes silent).
async fn spawn_ring(
    api_base: u16,
    p2p_base: u16,
    population: u8,
    config: &'static str,
) -> Vec<watch::Sender<bool>> {
    let mut terms = Vec::new();
    for id in 0..population {
        let (tx_term, rx_term) = watch::channel(false);
        terms.push(tx_term);
        tokio::spawn(async move {
            let mut peer_addrs = HashMap::new();
            for peer in 0..population {
                if peer != id {
                    peer_addrs.insert(peer, loop_addr(p2p_base, peer));
                }
            }
            let mut node = CommitNode::new_and_setup(
                id,
                population,
                loop_addr(api_base, id),
                loop_addr(p2p_base, id),
                peer_addrs,
                Some(config),
            )
            .await?;
            node.run(rx_term).await
        });
    }

    // give the ring time to interconnect and discover standby managers
    time::sleep(Duration::from_millis(600)).await;
    terms
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_smoke() -> Result<(), RingStoreError> {
    let _terms = spawn_ring(33700, 33705, 1, CFG1).await;
    let mut client = RingClient::new_and_connect(loop_addr(33700, 0)).await?;

    assert_eq!(client.read("0").await, Err(OpFailure::NotFound));
    assert_eq!(client.write("0", "1").await, Ok(()));
    assert_eq!(client.read("0").await, Ok("1".into()));
    assert_eq!(client.write("0", "2").await, Ok(()));
    assert_eq!(client.read("0").await, Ok("2".into()));

    // a whole transaction: read-your-writes without touching the ring
    let mut tx = client.tx_start();
    assert_eq!(tx.read("0").await, Ok("2".into()));
    assert_eq!(tx.write("0", "3").await, Ok(()));
    assert_eq!(tx.read("0").await, Ok("3".into()));
    assert_eq!(tx.commit().await, Ok(()));
    assert_eq!(client.read("0").await, Ok("3".into()));

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn write_then_read() -> Result<(), RingStoreError> {
    let _terms = spawn_ring(33710, 33715, 4, CFG4).await;
    let mut client = RingClient::new_and_connect(loop_addr(33710, 0)).await?;

    assert_eq!(client.write("0", "1").await, Ok(()));
    assert_eq!(client.read("0").await, Ok("1".into()));

    // values and versions survive through a different node's API
    let mut other = RingClient::new_and_connect(loop_addr(33710, 2)).await?;
    assert_eq!(other.read("0").await, Ok("1".into()));
    assert_eq!(other.write("0", "9").await, Ok(()));
    assert_eq!(client.read("0").await, Ok("9".into()));

    client.leave().await?;
    other.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn survives_minority_failure() -> Result<(), RingStoreError> {
    let terms = spawn_ring(33720, 33725, 4, CFG4).await;
    let mut client = RingClient::new_and_connect(loop_addr(33720, 0)).await?;

    assert_eq!(client.write("0", "1").await, Ok(()));

    // crash one node; a majority of every replica set survives
    terms[3].send(true).unwrap();
    time::sleep(Duration::from_millis(800)).await;

    assert_eq!(client.read("0").await, Ok("1".into()));
    assert_eq!(client.write("0", "2").await, Ok(()));
    assert_eq!(client.read("0").await, Ok("2".into()));

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn majority_failure_surfaces_abort() -> Result<(), RingStoreError> {
    let terms = spawn_ring(33730, 33735, 4, CFG4_STATIC).await;
    let mut client = RingClient::new_and_connect(loop_addr(33730, 0)).await?;

    assert_eq!(client.write("0", "1").await, Ok(()));

    // crash two nodes: no replica set keeps a majority
    terms[2].send(true).unwrap();
    terms[3].send(true).unwrap();
    time::sleep(Duration::from_millis(400)).await;

    // reads cannot assemble a found-majority
    assert_eq!(client.read("0").await, Err(OpFailure::NotFound));

    // writes validate against stale replicas and must surface abort, not
    // hang and not diverge
    assert_eq!(client.write("0", "2").await, Err(OpFailure::Abort));

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn pubsub_round_trip() -> Result<(), RingStoreError> {
    let _terms = spawn_ring(33740, 33745, 4, CFG4).await;
    let mut client = RingClient::new_and_connect(loop_addr(33740, 1)).await?;

    client.subscribe("T", "http://a").await.unwrap();
    client.subscribe("T", "http://a").await.unwrap(); // idempotent
    client.subscribe("T", "http://b").await.unwrap();
    assert_eq!(
        client.get_subscribers("T").await.unwrap(),
        vec!["http://a".to_string(), "http://b".to_string()]
    );

    client.unsubscribe("T", "http://a").await.unwrap();
    assert_eq!(
        client.get_subscribers("T").await.unwrap(),
        vec!["http://b".to_string()]
    );
    assert_eq!(
        client.unsubscribe("T", "http://a").await,
        Err(OpFailure::NotFound)
    );

    client.publish("T", "breaking news").await.unwrap();

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn revert_then_commit() -> Result<(), RingStoreError> {
    let _terms = spawn_ring(33750, 33755, 4, CFG4).await;
    let mut client = RingClient::new_and_connect(loop_addr(33750, 0)).await?;

    let mut tx = client.tx_start();

    // a failed read poisons the key...
    assert_eq!(tx.read("k").await, Err(OpFailure::NotFound));

    // ...and without the revert, a commit would have to abort; reverting
    // restores the log as before the read
    tx.revert_last_op();
    assert!(tx.log().is_empty());

    assert_eq!(tx.write("k", "v").await, Ok(()));
    assert_eq!(tx.commit().await, Ok(()));

    assert_eq!(client.read("k").await, Ok("v".into()));

    client.leave().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn conflicting_writes_one_winner() -> Result<(), RingStoreError> {
    let _terms = spawn_ring(33760, 33765, 4, CFG4).await;
    let mut alice = RingClient::new_and_connect(loop_addr(33760, 0)).await?;
    let mut bob = RingClient::new_and_connect(loop_addr(33760, 0)).await?;

    assert_eq!(alice.write("c", "0").await, Ok(()));

    // both transactions start from the same committed version
    let mut tx_a = alice.tx_start();
    let mut tx_b = bob.tx_start();
    assert_eq!(tx_a.read("c").await, Ok("0".into()));
    assert_eq!(tx_b.read("c").await, Ok("0".into()));
    assert_eq!(tx_a.write("c", "a").await, Ok(()));
    assert_eq!(tx_b.write("c", "b").await, Ok(()));

    let (res_a, res_b) = tokio::join!(tx_a.commit(), tx_b.commit());

    // exactly one commit, one abort
    assert!(res_a.is_ok() != res_b.is_ok());
    let (winner, loser) = if res_a.is_ok() { ("a", res_b) } else { ("b", res_a) };
    assert_eq!(loser, Err(OpFailure::Abort));
    assert_eq!(alice.read("c").await, Ok(winner.into()));

    alice.leave().await?;
    bob.leave().await?;
    Ok(())
}
