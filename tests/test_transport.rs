// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Router/dealer transport tests over real Unix-domain sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use voxbroker::{DealerSocket, RouterSocket};

fn unique_socket(prefix: &str) -> std::path::PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_{}_{n}.sock", std::process::id()))
}

#[test]
fn dealer_to_router_carries_identity() {
    let path = unique_socket("vbt_ident");
    let mut router = RouterSocket::bind(&path).expect("bind");

    let mut dealer = DealerSocket::connect(&path, b"worker_0_42").expect("connect");
    dealer.send(b"hello").expect("send");

    let (identity, payload) = router.recv().expect("recv");
    assert_eq!(identity, b"worker_0_42");
    assert_eq!(payload, b"hello");
}

#[test]
fn router_routes_by_identity() {
    let path = unique_socket("vbt_route");
    let mut router = RouterSocket::bind(&path).expect("bind");

    let mut a = DealerSocket::connect(&path, b"peer_a").expect("connect a");
    let mut b = DealerSocket::connect(&path, b"peer_b").expect("connect b");

    // Handshakes are only consumed when the router polls; one inbound
    // message from each makes both registrations visible.
    a.send(b"from_a").expect("send a");
    b.send(b"from_b").expect("send b");
    let mut seen = Vec::new();
    for _ in 0..2 {
        let (id, payload) = router.recv().expect("recv");
        seen.push((id, payload));
    }
    assert!(seen.contains(&(b"peer_a".to_vec(), b"from_a".to_vec())));
    assert!(seen.contains(&(b"peer_b".to_vec(), b"from_b".to_vec())));

    assert!(router.send(b"peer_b", b"only_for_b"));
    assert!(router.send(b"peer_a", b"only_for_a"));

    let got_a = a.recv(Some(Duration::from_secs(2))).expect("recv a");
    let got_b = b.recv(Some(Duration::from_secs(2))).expect("recv b");
    assert_eq!(got_a.as_deref(), Some(&b"only_for_a"[..]));
    assert_eq!(got_b.as_deref(), Some(&b"only_for_b"[..]));
}

#[test]
fn send_to_unknown_identity_is_dropped() {
    let path = unique_socket("vbt_unknown");
    let mut router = RouterSocket::bind(&path).expect("bind");
    assert!(!router.send(b"nobody", b"lost"));
}

#[test]
fn dealer_recv_times_out() {
    let path = unique_socket("vbt_timeout");
    let _router = RouterSocket::bind(&path).expect("bind");
    let mut dealer = DealerSocket::connect(&path, b"lonely").expect("connect");
    let got = dealer.recv(Some(Duration::from_millis(50))).expect("recv");
    assert!(got.is_none());
}

#[test]
fn router_recv_times_out() {
    let path = unique_socket("vbt_rtimeout");
    let mut router = RouterSocket::bind(&path).expect("bind");
    let got = router
        .recv_timeout(Duration::from_millis(50))
        .expect("recv_timeout");
    assert!(got.is_none());
}

#[test]
fn peer_hangup_unregisters() {
    let path = unique_socket("vbt_hangup");
    let mut router = RouterSocket::bind(&path).expect("bind");

    {
        let mut d = DealerSocket::connect(&path, b"transient").expect("connect");
        d.send(b"ping").expect("send");
        let (id, _) = router.recv().expect("recv");
        assert_eq!(id, b"transient");
        assert!(router.has_peer(b"transient"));
    }
    // The dealer is gone; the next poll notices the hangup and a send to
    // the stale identity reports the drop.
    let _ = router.recv_timeout(Duration::from_millis(100)).expect("poll");
    assert!(!router.send(b"transient", b"too_late"));
}

#[test]
fn large_payload_roundtrip() {
    let path = unique_socket("vbt_large");
    let mut router = RouterSocket::bind(&path).expect("bind");

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let path2 = path.clone();
    let sender = thread::spawn(move || {
        let mut d = DealerSocket::connect(&path2, b"bulk").expect("connect");
        d.send(&payload).expect("send");
        // Wait for the echo so the router's reply has a live peer.
        let echoed = d.recv(Some(Duration::from_secs(5))).expect("recv");
        echoed.expect("echo arrived")
    });

    let (id, got) = router.recv().expect("recv");
    assert_eq!(id, b"bulk");
    assert_eq!(got, expected);
    assert!(router.send(b"bulk", &got));

    let echoed = sender.join().expect("join");
    assert_eq!(echoed, expected);
}

#[test]
fn many_messages_arrive_in_order_per_peer() {
    let path = unique_socket("vbt_order");
    let mut router = RouterSocket::bind(&path).expect("bind");

    let mut d = DealerSocket::connect(&path, b"seq").expect("connect");
    for i in 0..100u32 {
        d.send(&i.to_le_bytes()).expect("send");
    }
    for i in 0..100u32 {
        let (_, payload) = router.recv().expect("recv");
        assert_eq!(payload, i.to_le_bytes());
    }
}
