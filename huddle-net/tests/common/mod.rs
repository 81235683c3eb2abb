//! Helpers shared by the integration suites: loopback configs on isolated
//! announce ports and timed waits on event channels.

#![allow(dead_code)]

use std::time::Duration;

use huddle_net::NetConfig;
use tokio::sync::{mpsc, watch};

/// Upper bound for anything that is supposed to happen.
pub const EVENT_WAIT: Duration = Duration::from_secs(10);

/// How long to listen for something that must not happen.
pub const SILENCE: Duration = Duration::from_secs(2);

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A UDP port that was free a moment ago. Good enough to keep parallel
/// tests off each other's announce traffic.
pub fn free_udp_port() -> u16 {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0)).expect("bind port probe");
    probe.local_addr().expect("probe local addr").port()
}

/// Loopback config with short timers, isolated on its own announce port.
/// Unicast announce addr, so no multicast group membership is involved.
pub fn test_config() -> NetConfig {
    NetConfig {
        announce_addr: "127.0.0.1".to_string(),
        announce_port: free_udp_port(),
        announce_interval_secs: 1,
        peer_timeout_secs: 3,
        invite_port: 0,
    }
}

pub async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>, what: &str) -> T {
    tokio::time::timeout(EVENT_WAIT, rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed while waiting for {what}"))
}

/// Wait until a watch value satisfies `pred`, returning a snapshot of it.
pub async fn wait_watch<T, F>(rx: &mut watch::Receiver<T>, what: &str, pred: F) -> T
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let outcome = tokio::time::timeout(EVENT_WAIT, async {
        loop {
            let snapshot = rx.borrow().clone();
            if pred(&snapshot) {
                return snapshot;
            }
            if rx.changed().await.is_err() {
                panic!("watch closed while waiting for {what}");
            }
        }
    })
    .await;
    outcome.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}
