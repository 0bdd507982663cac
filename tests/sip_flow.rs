//! End-to-end SIP scenarios over loopback UDP: registration with digest
//! authentication, proxying between registered endpoints, redirect mode
//! and upstream response routing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use siplab::config::Config;
use siplab::sip::SipServer;

async fn start_proxy(extra: &[&str]) -> (SocketAddr, CancellationToken) {
    let mut args = vec!["siplab", "--sip-port", "0"];
    args.extend_from_slice(extra);
    let config = Arc::new(Config::parse_from(args));
    let server = SipServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let token = CancellationToken::new();
    tokio::spawn(server.run(token.child_token()));
    (addr, token)
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_text(socket: &UdpSocket) -> String {
    let mut buf = vec![0u8; 8192];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    String::from_utf8(buf[..len].to_vec()).unwrap()
}

async fn send_recv(socket: &UdpSocket, target: SocketAddr, message: &str) -> String {
    socket.send_to(message.as_bytes(), target).await.unwrap();
    recv_text(socket).await
}

fn extract_nonce(challenge: &str) -> String {
    let start = challenge.find("nonce=\"").expect("challenge has a nonce") + 7;
    challenge[start..start + 32].to_string()
}

fn digest(user: &str, password: &str, nonce: &str) -> String {
    let ha1 = md5::compute(format!("{}:dummy:{}", user, password));
    let ha2 = md5::compute(format!("REGISTER:{}", "sip:lab"));
    format!(
        "{:x}",
        md5::compute(format!("{:x}:{}:{:x}", ha1, nonce, ha2))
    )
}

fn register_message(user: &str, local: SocketAddr, cseq: u32, extra_headers: &str) -> String {
    format!(
        "REGISTER sip:lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bK{user}{cseq}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{user}@lab>;tag={user}tag\r\n\
         To: <sip:{user}@lab>\r\n\
         Call-ID: reg-{user}@lab\r\n\
         CSeq: {cseq} REGISTER\r\n\
         Contact: <sip:{user}@{local}>\r\n\
         {extra_headers}Content-Length: 0\r\n\
         \r\n"
    )
}

fn authorization(user: &str, password: &str, nonce: &str) -> String {
    format!(
        "Authorization: Digest username=\"{}\", realm=\"dummy\", nonce=\"{}\", uri=\"sip:lab\", response=\"{}\"\r\n",
        user,
        nonce,
        digest(user, password, nonce)
    )
}

/// Challenge/response registration for `user` over `socket`; panics unless
/// the proxy ends up accepting it.
async fn register(socket: &UdpSocket, proxy: SocketAddr, user: &str) {
    let local = socket.local_addr().unwrap();
    let challenge = send_recv(socket, proxy, &register_message(user, local, 1, "")).await;
    assert!(challenge.starts_with("SIP/2.0 401 Unauthorized\r\n"));
    let nonce = extract_nonce(&challenge);
    let auth = authorization(user, "protected", &nonce);
    let reply = send_recv(socket, proxy, &register_message(user, local, 2, &auth)).await;
    assert!(reply.starts_with("SIP/2.0 200"), "unexpected reply: {reply}");
}

fn invite(from: &str, to: &str, local: SocketAddr) -> String {
    format!(
        "INVITE sip:{to}@lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKcall1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from}@lab>;tag={from}tag\r\n\
         To: <sip:{to}@lab>\r\n\
         Call-ID: call-1@lab\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:{from}@{local}>\r\n\
         Content-Type: application/sdp\r\n\
         Supported: replaces\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
}

#[tokio::test]
async fn first_register_is_challenged() {
    let (proxy, _token) = start_proxy(&[]).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    let reply = send_recv(&socket, proxy, &register_message("alice", local, 1, "")).await;
    assert!(reply.starts_with("SIP/2.0 401 Unauthorized\r\n"));
    assert!(reply.contains("WWW-Authenticate: Digest realm=\"dummy\", nonce=\""));
    let nonce = extract_nonce(&reply);
    assert_eq!(nonce.len(), 32);
    assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn register_with_valid_digest_succeeds_with_stock_reason() {
    let (proxy, _token) = start_proxy(&[]).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    let challenge = send_recv(&socket, proxy, &register_message("alice", local, 1, "")).await;
    let nonce = extract_nonce(&challenge);
    let auth = authorization("alice", "protected", &nonce);
    let reply = send_recv(&socket, proxy, &register_message("alice", local, 2, &auth)).await;
    // the stock reason is the literal "200 0K", digit zero
    assert!(reply.starts_with("SIP/2.0 200 0K\r\n"));
}

#[tokio::test]
async fn corrected_ok_reason_behind_flag() {
    let (proxy, _token) = start_proxy(&["--sip-correct-ok"]).await;
    let socket = client().await;
    register(&socket, proxy, "alice").await;

    let local = socket.local_addr().unwrap();
    let challenge = send_recv(&socket, proxy, &register_message("alice", local, 3, "")).await;
    let nonce = extract_nonce(&challenge);
    let auth = authorization("alice", "protected", &nonce);
    let reply = send_recv(&socket, proxy, &register_message("alice", local, 4, &auth)).await;
    assert!(reply.starts_with("SIP/2.0 200 OK\r\n"));
}

#[tokio::test]
async fn wrong_password_is_forbidden() {
    let (proxy, _token) = start_proxy(&[]).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    let challenge = send_recv(&socket, proxy, &register_message("alice", local, 1, "")).await;
    let nonce = extract_nonce(&challenge);
    let auth = authorization("alice", "guessed", &nonce);
    let reply = send_recv(&socket, proxy, &register_message("alice", local, 2, &auth)).await;
    assert!(reply.starts_with("SIP/2.0 403 Forbidden\r\n"));
}

#[tokio::test]
async fn register_echoes_rport_with_received_and_port() {
    let (proxy, _token) = start_proxy(&[]).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    let message = format!(
        "REGISTER sip:lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};rport;branch=z9hG4bKr1\r\n\
         From: <sip:alice@lab>;tag=a1\r\n\
         To: <sip:alice@lab>\r\n\
         Call-ID: reg-r@lab\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:alice@{local}>\r\n\
         Content-Length: 0\r\n\
         \r\n"
    );
    let reply = send_recv(&socket, proxy, &message).await;
    let expected = format!("received=127.0.0.1;rport={}", local.port());
    assert!(reply.contains(&expected), "reply: {reply}");
    assert!(!reply.contains(";rport;"));
    for line in reply.split("\r\n") {
        assert!(!line.ends_with(";rport"), "bare rport left in: {line}");
    }
}

#[tokio::test]
async fn invite_between_registered_endpoints_is_proxied() {
    let (proxy, _token) = start_proxy(&[]).await;
    let alice = client().await;
    let bob = client().await;
    register(&alice, proxy, "alice").await;
    register(&bob, proxy, "bob").await;

    let alice_addr = alice.local_addr().unwrap();
    let bob_addr = bob.local_addr().unwrap();
    alice
        .send_to(invite("alice", "bob", alice_addr).as_bytes(), proxy)
        .await
        .unwrap();

    let forwarded = recv_text(&bob).await;
    let lines: Vec<&str> = forwarded.split("\r\n").collect();
    // Request-URI rewritten to bob's registered contact
    assert_eq!(lines[0], format!("INVITE sip:bob@{} SIP/2.0", bob_addr));
    // Record-Route sits at slot 1
    assert_eq!(
        lines[1],
        format!("Record-Route: <sip:127.0.0.1:{};lr>", proxy.port())
    );
    // new top Via carries the proxy authority and the copied branch
    assert_eq!(
        lines[2],
        format!("Via: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKcall1", proxy.port())
    );
    // the original Via is annotated with the transport-layer peer
    assert_eq!(
        lines[3],
        format!(
            "Via: SIP/2.0/UDP {};branch=z9hG4bKcall1;received=127.0.0.1",
            alice_addr
        )
    );
}

#[tokio::test]
async fn record_route_can_be_suppressed() {
    let (proxy, _token) = start_proxy(&["--sip-no-record-route"]).await;
    let alice = client().await;
    let bob = client().await;
    register(&alice, proxy, "alice").await;
    register(&bob, proxy, "bob").await;

    let alice_addr = alice.local_addr().unwrap();
    alice
        .send_to(invite("alice", "bob", alice_addr).as_bytes(), proxy)
        .await
        .unwrap();
    let forwarded = recv_text(&bob).await;
    assert!(!forwarded.contains("Record-Route:"));
}

#[tokio::test]
async fn invite_from_unregistered_origin_is_rejected() {
    let (proxy, _token) = start_proxy(&[]).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    let reply = send_recv(&socket, proxy, &invite("ghost", "bob", local)).await;
    assert!(reply.starts_with("SIP/2.0 400 Bad Request\r\n"));
}

#[tokio::test]
async fn invite_to_unknown_destination_is_temporarily_unavailable() {
    let (proxy, _token) = start_proxy(&[]).await;
    let alice = client().await;
    register(&alice, proxy, "alice").await;

    let local = alice.local_addr().unwrap();
    let reply = send_recv(&alice, proxy, &invite("alice", "nobody", local)).await;
    assert!(reply.starts_with("SIP/2.0 480 Temporarily Unavailable\r\n"));
}

#[tokio::test]
async fn non_invite_to_unknown_destination_is_not_found() {
    let (proxy, _token) = start_proxy(&[]).await;
    let alice = client().await;
    register(&alice, proxy, "alice").await;

    let local = alice.local_addr().unwrap();
    let message = format!(
        "MESSAGE sip:nobody@lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKm1\r\n\
         From: <sip:alice@lab>;tag=a1\r\n\
         To: <sip:nobody@lab>\r\n\
         Call-ID: msg-1@lab\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Length: 0\r\n\
         \r\n"
    );
    let reply = send_recv(&alice, proxy, &message).await;
    assert!(reply.starts_with("SIP/2.0 404 Not found\r\n"));
}

#[tokio::test]
async fn expires_zero_unregisters() {
    let (proxy, _token) = start_proxy(&[]).await;
    let alice = client().await;
    let bob = client().await;
    register(&alice, proxy, "alice").await;
    register(&bob, proxy, "bob").await;

    // deregister bob
    let bob_addr = bob.local_addr().unwrap();
    let challenge = send_recv(&bob, proxy, &register_message("bob", bob_addr, 3, "")).await;
    let nonce = extract_nonce(&challenge);
    let auth = authorization("bob", "protected", &nonce);
    let extra = format!("{}Expires: 0\r\n", auth);
    let message = format!(
        "REGISTER sip:lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {bob_addr};branch=z9hG4bKbob4\r\n\
         From: <sip:bob@lab>;tag=bobtag\r\n\
         To: <sip:bob@lab>\r\n\
         Call-ID: reg-bob@lab\r\n\
         CSeq: 4 REGISTER\r\n\
         Contact: <sip:bob@{bob_addr}>\r\n\
         {extra}Content-Length: 0\r\n\
         \r\n"
    );
    let reply = send_recv(&bob, proxy, &message).await;
    assert!(reply.starts_with("SIP/2.0 200"));

    // bob is gone now
    let alice_addr = alice.local_addr().unwrap();
    let reply = send_recv(&alice, proxy, &invite("alice", "bob", alice_addr)).await;
    assert!(reply.starts_with("SIP/2.0 480 Temporarily Unavailable\r\n"));
}

#[tokio::test]
async fn info_is_answered_locally() {
    let (proxy, _token) = start_proxy(&[]).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    let message = format!(
        "INFO sip:bob@lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKi1\r\n\
         From: <sip:alice@lab>;tag=a1\r\n\
         To: <sip:bob@lab>\r\n\
         Call-ID: info-1@lab\r\n\
         CSeq: 1 INFO\r\n\
         Content-Length: 0\r\n\
         \r\n"
    );
    let reply = send_recv(&socket, proxy, &message).await;
    assert!(reply.starts_with("SIP/2.0 200 0K\r\n"));
}

#[tokio::test]
async fn redirect_mode_replies_moved_temporarily() {
    let (proxy, _token) = start_proxy(&["--sip-redirect"]).await;
    let alice = client().await;
    let bob = client().await;
    register(&alice, proxy, "alice").await;
    register(&bob, proxy, "bob").await;

    let alice_addr = alice.local_addr().unwrap();
    let bob_addr = bob.local_addr().unwrap();
    let reply = send_recv(&alice, proxy, &invite("alice", "bob", alice_addr)).await;

    let lines: Vec<&str> = reply.split("\r\n").collect();
    assert_eq!(lines[0], "SIP/2.0 302 Moved Temporarily");
    assert_eq!(lines[1], format!("Contact: <sip:bob@{}>", bob_addr));
    assert!(!reply.contains("Record-Route:"));
    assert!(!reply.contains("Content-Type:"));
    assert!(!reply.contains("Supported:"));
    assert!(!reply.contains("Max-Forwards:"));
}

#[tokio::test]
async fn redirect_mode_rejects_non_invite() {
    let (proxy, _token) = start_proxy(&["--sip-redirect"]).await;
    let alice = client().await;
    register(&alice, proxy, "alice").await;

    let local = alice.local_addr().unwrap();
    let message = format!(
        "MESSAGE sip:bob@lab SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKm2\r\n\
         From: <sip:alice@lab>;tag=a1\r\n\
         To: <sip:bob@lab>\r\n\
         Call-ID: msg-2@lab\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Length: 0\r\n\
         \r\n"
    );
    let reply = send_recv(&alice, proxy, &message).await;
    assert!(reply.starts_with("SIP/2.0 405 Method Not Allowed\r\n"));
}

#[tokio::test]
async fn upstream_response_routed_to_caller_without_own_via() {
    let (proxy, _token) = start_proxy(&[]).await;
    let alice = client().await;
    let bob = client().await;
    register(&alice, proxy, "alice").await;
    register(&bob, proxy, "bob").await;

    let alice_addr = alice.local_addr().unwrap();
    // bob answers a call; the proxy Via is re-spaced the way some stacks
    // reformat echoed headers
    let response = format!(
        "SIP/2.0 200 OK\r\n\
         Via: SIP/2.0/UDP  127.0.0.1:{} ;branch=z9hG4bKcall1\r\n\
         Via: SIP/2.0/UDP {};branch=z9hG4bKcall1\r\n\
         Route: <sip:127.0.0.1:{};lr>\r\n\
         From: <sip:alice@lab>;tag=alicetag\r\n\
         To: <sip:bob@lab>;tag=bobtag\r\n\
         Call-ID: call-1@lab\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: 0\r\n\
         \r\n",
        proxy.port(),
        alice_addr,
        proxy.port()
    );
    bob.send_to(response.as_bytes(), proxy).await.unwrap();

    let relayed = recv_text(&alice).await;
    assert!(relayed.starts_with("SIP/2.0 200 OK\r\n"));
    assert!(!relayed.contains(&format!("127.0.0.1:{} ;branch", proxy.port())));
    assert!(relayed.contains(&format!("Via: SIP/2.0/UDP {};branch=z9hG4bKcall1", alice_addr)));
    assert!(!relayed.contains("Route:"));
}
