//! The SIP worker: one socket, one task, sequential datagram processing.
//!
//! Per-method routing:
//!
//! | class | action |
//! |-------|--------|
//! | REGISTER | digest challenge/verify, registrar upsert/remove |
//! | INVITE | proxy forward (or 302 in redirect mode) |
//! | ACK | forward without origin check, never answered |
//! | BYE CANCEL OPTIONS MESSAGE REFER PRACK UPDATE SUBSCRIBE NOTIFY | non-INVITE forward |
//! | INFO PUBLISH | local 200 |
//! | `SIP/2.0 ...` | upstream response, routed back by From AoR |
//!
//! There is no transaction state: every datagram is handled on its own and
//! any response is sent before the next datagram is read.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::sip::auth;
use crate::sip::message::{hexdump, Method, Patterns, SipMessage};
use crate::sip::message::{is_contact, is_route, is_to};
use crate::sip::registrar::{Binding, Registrar};
use crate::Result;

pub struct SipServer {
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
    patterns: Patterns,
    registrar: Registrar,
    /// Issued nonces, keyed by AoR.
    nonces: HashMap<String, String>,
    /// `Via: SIP/2.0/UDP <exposed-ip>:<exposed-port>`, the value this
    /// proxy stamps on forwarded requests and strips from responses.
    top_via: String,
    /// `Record-Route: <sip:<exposed-ip>:<exposed-port>;lr>`
    record_route: String,
    ok_reason: &'static str,
}

impl SipServer {
    pub async fn bind(config: Arc<Config>) -> Result<Self> {
        let socket = UdpSocket::bind((config.ip, config.sip_port)).await?;
        let local = socket.local_addr()?;
        let exposed_ip = config
            .sip_exposed_ip
            .clone()
            .unwrap_or_else(|| config.ip.to_string());
        let exposed_port = config.sip_exposed_port.unwrap_or(local.port());
        let top_via = format!("Via: SIP/2.0/UDP {}:{}", exposed_ip, exposed_port);
        let record_route = format!("Record-Route: <sip:{}:{};lr>", exposed_ip, exposed_port);

        let mode = if config.sip_redirect {
            "redirect server"
        } else {
            "proxy"
        };
        info!("SIP: {} starting on {}", mode, local);
        if !config.sip_redirect {
            if !config.sip_no_record_route {
                debug!("SIP: using Record-Route header: {}", record_route);
            }
            debug!("SIP: using top Via header: {}", top_via);
        }

        Ok(SipServer {
            socket: Arc::new(socket),
            ok_reason: if config.sip_correct_ok {
                "200 OK"
            } else {
                "200 0K"
            },
            config,
            patterns: Patterns::new(),
            registrar: Registrar::new(),
            nonces: HashMap::new(),
            top_via,
            record_route,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; 8192];
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => {
                    info!("SIP: worker stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, peer) = received?;
            self.handle_datagram(&buf[..len], peer).await;
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) {
        if let Some(message) = SipMessage::from_datagram(data) {
            if self.patterns.request_line.is_match(message.start_line())
                || self.patterns.status_line.is_match(message.start_line())
            {
                debug!(
                    target: "sip_trace",
                    "Received from {}:{} ({} bytes):\n\n{}",
                    peer.ip(),
                    peer.port(),
                    data.len(),
                    message.to_wire()
                );
                self.process(message, peer).await;
                return;
            }
        }
        if data.len() > 4 {
            debug!(
                target: "sip_trace",
                "Received from {}:{} ({} bytes):",
                peer.ip(),
                peer.port(),
                data.len()
            );
            for line in hexdump(data, 16) {
                debug!(target: "sip_trace", "{}", line);
            }
        }
    }

    async fn process(&mut self, message: SipMessage, peer: SocketAddr) {
        let start = message.start_line().to_string();
        let Some(caps) = self.patterns.request_line.captures(&start) else {
            self.on_response(message, peer).await;
            return;
        };
        match Method::from_token(&caps[1]) {
            Some(Method::Register) => self.on_register(message, peer).await,
            Some(Method::Invite) => self.on_invite(message, peer).await,
            Some(Method::Ack) => self.on_ack(message, peer).await,
            Some(Method::Info) | Some(Method::Publish) => {
                self.respond(&message, self.ok_reason, peer).await;
            }
            Some(_) => self.on_non_invite(message, peer).await,
            None => error!("SIP: request line not handled: {}", start),
        }
    }

    async fn on_register(&mut self, mut message: SipMessage, peer: SocketAddr) {
        info!("SIP: REGISTER received: {}", message.start_line());

        let mut aor = String::new();
        let mut contact = String::new();
        let mut contact_expires = None;
        let mut header_expires = None;
        let mut authorization = None;
        let mut auth_index = 0;
        for (index, line) in message.lines.iter().enumerate() {
            if is_to(line) {
                if let Some(caps) = self.patterns.uri.captures(line) {
                    aor = format!("{}@{}", &caps[1], &caps[2]);
                }
            }
            if is_contact(line) {
                if let Some(caps) = self.patterns.uri.captures(line) {
                    contact = format!("{}@{}", &caps[1], &caps[2]);
                    debug!("SIP: registration: contact: {}", contact);
                } else if let Some(caps) = self.patterns.addr.captures(line) {
                    contact = caps[1].to_string();
                    debug!("SIP: registration: host-only contact: {}", contact);
                }
                if let Some(caps) = self.patterns.contact_expires.captures(line) {
                    contact_expires = Some(caps[1].to_string());
                }
            }
            if let Some(caps) = self.patterns.expires_header.captures(line) {
                header_expires = Some(caps[1].to_string());
            }
            if let Some(caps) = self.patterns.authorization.captures(line) {
                authorization = Some(caps[1].to_string());
                auth_index = index;
            }
        }

        // never echoed back
        if auth_index > 0 {
            message.lines.remove(auth_index);
        }

        let verified = match (&authorization, self.nonces.get(&aor)) {
            (Some(credentials), Some(nonce)) => Some(auth::verify(
                credentials,
                &self.config.sip_password,
                nonce,
                "REGISTER",
                &self.patterns,
            )),
            _ => None,
        };
        match verified {
            Some(true) => {}
            Some(false) => {
                self.respond(&message, "403 Forbidden", peer).await;
                return;
            }
            None => {
                let nonce = auth::generate_nonce();
                message.insert_header(6, auth::challenge_header(&nonce));
                self.nonces.insert(aor, nonce);
                self.respond(&message, "401 Unauthorized", peer).await;
                return;
            }
        }

        let requested: Option<u32> = contact_expires
            .or(header_expires)
            .and_then(|value| value.trim().parse().ok());
        if requested == Some(0) {
            self.registrar.remove(&aor);
            info!("SIP: registration removed: {}", aor);
            self.respond(&message, self.ok_reason, peer).await;
            return;
        }
        let expires = match requested {
            Some(expires) => expires,
            None => {
                let expires = self.config.sip_expires;
                message.insert_header(6, format!("Expires: {}", expires));
                expires
            }
        };

        info!("SIP: registration: {} -> {}", aor, contact);
        debug!("SIP: registration: source {}, expires={}", peer, expires);
        self.registrar.upsert(
            aor,
            Binding {
                contact,
                socket: self.socket.clone(),
                addr: peer,
                expires_at: crate::now_secs() + u64::from(expires),
            },
        );
        self.dump_registrar();
        self.respond(&message, self.ok_reason, peer).await;
    }

    async fn on_invite(&mut self, mut message: SipMessage, peer: SocketAddr) {
        if self.config.sip_redirect {
            self.redirect(message, peer).await;
            return;
        }
        debug!("SIP: INVITE received");
        let origin = message.origin(&self.patterns);
        if origin.is_empty() || self.registrar.lookup(&origin).is_none() {
            debug!("SIP: INVITE: origin not registered: {}", origin);
            self.respond(&message, "400 Bad Request", peer).await;
            return;
        }
        let destination = message.destination(&self.patterns);
        if destination.is_empty() {
            self.respond(&message, "500 Server Internal Error", peer)
                .await;
            return;
        }
        info!("SIP: INVITE: destination {}", destination);
        let Some(binding) = self.registrar.lookup(&destination) else {
            self.respond(&message, "480 Temporarily Unavailable", peer)
                .await;
            return;
        };
        message.rewrite_request_uri(&mut self.registrar, &self.patterns);
        self.forward(&mut message, &binding, peer).await;
        debug!("SIP: forwarded INVITE to {}", binding.addr);
    }

    async fn on_non_invite(&mut self, mut message: SipMessage, peer: SocketAddr) {
        if self.config.sip_redirect {
            self.redirect(message, peer).await;
            return;
        }
        info!("SIP: non-INVITE received: {}", message.start_line());
        let origin = message.origin(&self.patterns);
        if origin.is_empty() || self.registrar.lookup(&origin).is_none() {
            debug!("SIP: origin not registered: {}", origin);
            self.respond(&message, "400 Bad Request", peer).await;
            return;
        }
        let destination = message.destination(&self.patterns);
        if destination.is_empty() {
            self.respond(&message, "500 Server Internal Error", peer)
                .await;
            return;
        }
        info!("SIP: destination {}", destination);
        let Some(binding) = self.registrar.lookup(&destination) else {
            self.respond(&message, "404 Not found", peer).await;
            return;
        };
        message.rewrite_request_uri(&mut self.registrar, &self.patterns);
        self.forward(&mut message, &binding, peer).await;
    }

    async fn on_ack(&mut self, mut message: SipMessage, peer: SocketAddr) {
        if self.config.sip_redirect {
            self.redirect(message, peer).await;
            return;
        }
        info!("SIP: ACK received: {}", message.start_line());
        let destination = message.destination(&self.patterns);
        if destination.is_empty() {
            return;
        }
        if let Some(binding) = self.registrar.lookup(&destination) {
            self.forward(&mut message, &binding, peer).await;
        }
    }

    async fn on_response(&mut self, mut message: SipMessage, peer: SocketAddr) {
        if self.config.sip_redirect {
            self.redirect(message, peer).await;
            return;
        }
        info!("SIP: response received: {}", message.start_line());
        let origin = message.origin(&self.patterns);
        if origin.is_empty() {
            return;
        }
        debug!("SIP: response: origin {}", origin);
        if let Some(binding) = self.registrar.lookup(&origin) {
            message.strip_route();
            message.remove_own_via(&self.top_via);
            self.send(&message.to_wire(), binding.addr, &binding.socket)
                .await;
        }
    }

    /// Proxy-mode request forwarding: top Via with the incoming branch,
    /// Route strip, Record-Route at slot 1, then out the socket the
    /// destination registered on. The Request-URI rewrite happens at the
    /// call sites that want it; ACKs go out with theirs untouched.
    async fn forward(&self, message: &mut SipMessage, binding: &Binding, peer: SocketAddr) {
        message.add_top_via(&self.top_via, peer, &self.patterns);
        message.strip_route();
        if !self.config.sip_no_record_route {
            message.insert_header(1, self.record_route.clone());
        }
        self.send(&message.to_wire(), binding.addr, &binding.socket)
            .await;
    }

    /// Redirect mode: answer everything locally.
    async fn redirect(&mut self, mut message: SipMessage, peer: SocketAddr) {
        debug!("SIP: acting as a redirect server");
        let start = message.start_line().to_string();
        let Some(caps) = self.patterns.request_line.captures(&start) else {
            if self.patterns.status_line.is_match(&start) {
                debug!("SIP: response received, ignoring");
            }
            return;
        };
        let method = caps[1].to_string();
        if method.eq_ignore_ascii_case("ACK") {
            debug!("SIP: ACK received, ignoring");
            return;
        }
        if !method.eq_ignore_ascii_case("INVITE") {
            debug!("SIP: non-INVITE received");
            self.respond(&message, "405 Method Not Allowed", peer)
                .await;
            return;
        }
        let origin = message.origin(&self.patterns);
        if origin.is_empty() || self.registrar.lookup(&origin).is_none() {
            debug!("SIP: INVITE: origin not registered: {}", origin);
            self.respond(&message, "400 Bad Request", peer).await;
            return;
        }
        let destination = message.destination(&self.patterns);
        if destination.is_empty() {
            error!("SIP: cannot extract destination");
            self.respond(&message, "404 Not Found", peer).await;
            return;
        }
        debug!("SIP: destination: {}", destination);
        let Some(binding) = self.registrar.lookup(&destination) else {
            info!("SIP: destination not registered");
            self.respond(&message, "404 Not Found", peer).await;
            return;
        };
        message.remove_headers(|line| {
            is_contact(line)
                || is_route(line)
                || line.starts_with("Content-Type:")
                || line.starts_with("User-Agent:")
                || line.starts_with("Session-Expires:")
                || line.starts_with("Supported:")
                || line.starts_with("Content-Disposition:")
                || line.starts_with("Max-Forwards:")
        });
        let contact = format!("Contact: <sip:{}>", binding.contact);
        debug!("SIP: redirecting to {}", contact);
        message.insert_header(1, contact);
        self.respond(&message, "302 Moved Temporarily", peer)
            .await;
    }

    async fn respond(&self, message: &SipMessage, code: &str, peer: SocketAddr) {
        debug!("SIP: sending response {}", code);
        let text = message.build_response(code, peer, &self.patterns);
        self.send(&text, peer, &self.socket).await;
    }

    async fn send(&self, text: &str, dest: SocketAddr, socket: &Arc<UdpSocket>) {
        match socket.send_to(text.as_bytes(), dest).await {
            Ok(sent) => {
                debug!("SIP: sent {} bytes to {}", sent, dest);
                debug!(
                    target: "sip_trace",
                    "Send to: {}:{} ({} bytes):\n\n{}",
                    dest.ip(),
                    dest.port(),
                    text.len(),
                    text
                );
            }
            Err(error) => warn!("SIP: send to {} failed: {}", dest, error),
        }
    }

    fn dump_registrar(&self) {
        debug!("SIP: *** registrar ***");
        for (aor, binding) in self.registrar.iter() {
            debug!("SIP: {} -> {}", aor, binding.contact);
        }
        debug!("SIP: ******************");
    }
}
