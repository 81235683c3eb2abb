//! Advertiser/browser discovery over loopback UDP: announce, Bye, expiry,
//! and the gates that keep foreign or forged announces out of the table.

mod common;

use std::sync::Arc;

use common::{init_logs, recv_timeout, test_config, SILENCE};
use huddle_core::identity::Keypair;
use huddle_core::protocol::ControlFrame;
use huddle_core::{encode_payload, PROTOCOL_VERSION};
use huddle_net::{Advertiser, Browser, BrowserEvent};
use tokio::net::UdpSocket;

const SERVICE: &str = "huddle-test";

fn announce_frame(kp: &Keypair, service: &str, name: &str, version: u8) -> ControlFrame {
    ControlFrame::Announce {
        protocol_version: version,
        service: service.to_string(),
        id: kp.peer_id(),
        public_key: kp.public_key().clone(),
        display_name: name.to_string(),
        // Never dialed in these tests.
        invite_port: 9,
        discovery_info: Vec::new(),
    }
}

async fn send_frame(frame: &ControlFrame, port: u16) {
    let bytes = encode_payload(frame).expect("encode control frame");
    let sock = UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind sender");
    sock.send_to(&bytes, ("127.0.0.1", port))
        .await
        .expect("send announce");
}

#[tokio::test]
async fn browser_finds_advertiser_then_sees_bye() {
    init_logs();
    let cfg = test_config();

    let host_kp = Arc::new(Keypair::generate());
    let host = host_kp.identity("Dispatch");
    let (mut advertiser, _adv_events) =
        Advertiser::new(host.clone(), host_kp, SERVICE, cfg.clone());
    advertiser.set_discovery_info(vec![("role".to_string(), "host".to_string())]);
    advertiser.start().await.expect("advertiser starts");
    assert!(advertiser.is_advertising());
    assert!(advertiser.invite_port().expect("listener port") != 0);

    let scout_kp = Arc::new(Keypair::generate());
    let (mut browser, mut events) = Browser::new(
        scout_kp.identity("Scout"),
        scout_kp.clone(),
        SERVICE,
        cfg,
    );
    browser.start_browsing().await.expect("browser starts");

    match recv_timeout(&mut events, "peer found").await {
        BrowserEvent::PeerFound {
            peer,
            discovery_info,
        } => {
            assert_eq!(peer, host);
            assert_eq!(peer.display_name, "Dispatch");
            assert_eq!(
                discovery_info,
                vec![("role".to_string(), "host".to_string())]
            );
        }
        other => panic!("expected PeerFound, got {other:?}"),
    }
    assert_eq!(browser.discovered_peers().await, vec![host.clone()]);

    // Bye beats the timeout: the peer disappears as soon as it stops.
    advertiser.stop();
    match recv_timeout(&mut events, "peer lost").await {
        BrowserEvent::PeerLost { peer } => assert_eq!(peer, host),
        other => panic!("expected PeerLost, got {other:?}"),
    }
    assert!(browser.discovered_peers().await.is_empty());
}

#[tokio::test]
async fn silent_peer_expires() {
    init_logs();
    let cfg = test_config();

    let scout_kp = Arc::new(Keypair::generate());
    let (mut browser, mut events) = Browser::new(
        scout_kp.identity("Scout"),
        scout_kp,
        SERVICE,
        cfg.clone(),
    );
    browser.start_browsing().await.expect("browser starts");

    // One well-formed announce, then nothing.
    let ghost = Keypair::generate();
    send_frame(
        &announce_frame(&ghost, SERVICE, "Ghost", PROTOCOL_VERSION),
        cfg.announce_port,
    )
    .await;

    match recv_timeout(&mut events, "ghost found").await {
        BrowserEvent::PeerFound { peer, .. } => assert_eq!(peer.id, ghost.peer_id()),
        other => panic!("expected PeerFound, got {other:?}"),
    }

    match recv_timeout(&mut events, "ghost expiry").await {
        BrowserEvent::PeerLost { peer } => assert_eq!(peer.id, ghost.peer_id()),
        other => panic!("expected PeerLost, got {other:?}"),
    }
    assert!(browser.discovered_peers().await.is_empty());
}

#[tokio::test]
async fn foreign_and_forged_announces_are_ignored() {
    init_logs();
    let cfg = test_config();

    let scout_kp = Arc::new(Keypair::generate());
    let (mut browser, mut events) = Browser::new(
        scout_kp.identity("Scout"),
        scout_kp,
        SERVICE,
        cfg.clone(),
    );
    browser.start_browsing().await.expect("browser starts");

    // Wrong service namespace.
    let stranger = Keypair::generate();
    send_frame(
        &announce_frame(&stranger, "huddle-other", "Stranger", PROTOCOL_VERSION),
        cfg.announce_port,
    )
    .await;

    // ID that does not match the public key.
    let imposter = Keypair::generate();
    let victim = Keypair::generate();
    let forged = ControlFrame::Announce {
        protocol_version: PROTOCOL_VERSION,
        service: SERVICE.to_string(),
        id: victim.peer_id(),
        public_key: imposter.public_key().clone(),
        display_name: "Imposter".to_string(),
        invite_port: 9,
        discovery_info: Vec::new(),
    };
    send_frame(&forged, cfg.announce_port).await;

    // Incompatible protocol version.
    send_frame(
        &announce_frame(&stranger, SERVICE, "Time traveler", 0),
        cfg.announce_port,
    )
    .await;

    // A valid announce still gets through, proving the loop is alive and
    // everything above was dropped rather than queued.
    let honest = Keypair::generate();
    send_frame(
        &announce_frame(&honest, SERVICE, "Honest", PROTOCOL_VERSION),
        cfg.announce_port,
    )
    .await;

    match recv_timeout(&mut events, "honest peer").await {
        BrowserEvent::PeerFound { peer, .. } => {
            assert_eq!(peer.id, honest.peer_id());
            assert_eq!(peer.display_name, "Honest");
        }
        other => panic!("expected PeerFound, got {other:?}"),
    }
    assert_eq!(browser.discovered_peers().await.len(), 1);
}

#[tokio::test]
async fn browser_skips_its_own_announces() {
    init_logs();
    let cfg = test_config();

    // Advertiser and browser share one identity, as a coordinator's do.
    let kp = Arc::new(Keypair::generate());
    let local = kp.identity("Self");
    let (mut advertiser, _adv_events) =
        Advertiser::new(local.clone(), kp.clone(), SERVICE, cfg.clone());
    advertiser.start().await.expect("advertiser starts");

    let (mut browser, mut events) = Browser::new(local, kp, SERVICE, cfg);
    browser.start_browsing().await.expect("browser starts");

    assert!(
        tokio::time::timeout(SILENCE, events.recv()).await.is_err(),
        "browser must not discover itself"
    );
    assert!(browser.discovered_peers().await.is_empty());
}
