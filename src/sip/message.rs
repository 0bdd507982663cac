//! Line-oriented SIP message model.
//!
//! A datagram is kept as the ordered list of its CRLF-separated lines and is
//! forwarded that way: headers the proxy does not care about stay
//! byte-for-byte intact and in their original position. Rewrites edit the
//! line vector in place. Field extraction is deliberately tolerant; the
//! appliance exists to exercise real phones, which produce a wide range of
//! almost-RFC-3261 messages.

use std::net::SocketAddr;

use regex::Regex;

/// Request methods understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Prack,
    Cancel,
    Bye,
    Options,
    Subscribe,
    Publish,
    Notify,
    Info,
    Message,
    Refer,
    Update,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "REGISTER" => Some(Method::Register),
            "INVITE" => Some(Method::Invite),
            "ACK" => Some(Method::Ack),
            "PRACK" => Some(Method::Prack),
            "CANCEL" => Some(Method::Cancel),
            "BYE" => Some(Method::Bye),
            "OPTIONS" => Some(Method::Options),
            "SUBSCRIBE" => Some(Method::Subscribe),
            "PUBLISH" => Some(Method::Publish),
            "NOTIFY" => Some(Method::Notify),
            "INFO" => Some(Method::Info),
            "MESSAGE" => Some(Method::Message),
            "REFER" => Some(Method::Refer),
            "UPDATE" => Some(Method::Update),
            _ => None,
        }
    }
}

/// Pre-compiled field extraction patterns, owned by the SIP server (not
/// global state).
pub struct Patterns {
    /// `METHOD sip:uri[;params] SIP/2.0`
    pub request_line: Regex,
    /// `SIP/2.0 <code>`
    pub status_line: Regex,
    /// `sip:user@host`, host terminated by `;`, `>` or `$`; the flavour
    /// used when routing on To/From
    pub uri_with_params: Regex,
    /// `sip:user@host`, host terminated by `>` or `$` only; the flavour
    /// used on REGISTER To and Contact
    pub uri: Regex,
    /// `sip:host` without a user part, for Contact values like
    /// `<sip:192.168.1.5:5062>`
    pub addr: Regex,
    pub branch: Regex,
    /// A bare `;rport` without a value
    pub rport: Regex,
    /// `expires=` parameter on a Contact line
    pub contact_expires: Regex,
    /// Top-level `Expires:` header
    pub expires_header: Regex,
    /// Authorization header: a six-character scheme token (`Digest`)
    /// followed by the credential list
    pub authorization: Regex,
    /// One `k=v` element of a credential list
    pub kv: Regex,
}

impl Patterns {
    pub fn new() -> Self {
        Patterns {
            request_line: Regex::new(r"^([^ ]*) sip:([^ ]*?)(;.*)* SIP/2\.0").expect("pattern"),
            status_line: Regex::new(r"^SIP/2\.0 ([^ ]*)").expect("pattern"),
            uri_with_params: Regex::new(r"sip:([^@]*)@([^;>$]*)").expect("pattern"),
            uri: Regex::new(r"sip:([^@]*)@([^>$]*)").expect("pattern"),
            addr: Regex::new(r"sip:([^ ;>$]*)").expect("pattern"),
            branch: Regex::new(r";branch=([^;]*)").expect("pattern"),
            rport: Regex::new(r";rport$|;rport;").expect("pattern"),
            contact_expires: Regex::new(r"expires=([^;$]*)").expect("pattern"),
            expires_header: Regex::new(r"^Expires: (.*)$").expect("pattern"),
            authorization: Regex::new(r"^Authorization: +\S{6} (.*)").expect("pattern"),
            kv: Regex::new(r"([^=]*)=(.*)").expect("pattern"),
        }
    }
}

impl Default for Patterns {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_via(line: &str) -> bool {
    line.starts_with("Via:") || line.starts_with("v:")
}

pub fn is_from(line: &str) -> bool {
    line.starts_with("From:") || line.starts_with("f:")
}

pub fn is_to(line: &str) -> bool {
    line.starts_with("To:") || line.starts_with("t:")
}

pub fn is_contact(line: &str) -> bool {
    line.starts_with("Contact:") || line.starts_with("m:")
}

pub fn is_route(line: &str) -> bool {
    line.starts_with("Route:")
}

/// A SIP datagram as an ordered list of lines. Line 0 is the start line;
/// one empty line separates headers from the body.
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub lines: Vec<String>,
}

impl SipMessage {
    /// Split a datagram on CRLF. `None` if the payload is not UTF-8; what
    /// the start line actually says is the dispatcher's problem.
    pub fn from_datagram(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        Some(SipMessage {
            lines: text.split("\r\n").map(str::to_string).collect(),
        })
    }

    pub fn start_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    pub fn to_wire(&self) -> String {
        self.lines.join("\r\n")
    }

    /// Insert a header line, clamped to the end of the message when the
    /// slot is beyond it (short messages still get their synthesized
    /// headers).
    pub fn insert_header(&mut self, index: usize, line: String) {
        let index = index.min(self.lines.len());
        self.lines.insert(index, line);
    }

    pub fn remove_headers(&mut self, pred: impl Fn(&str) -> bool) {
        self.lines.retain(|line| !pred(line));
    }

    pub fn strip_route(&mut self) {
        self.remove_headers(is_route);
    }

    fn header_aor(&self, select: impl Fn(&str) -> bool, uri: &Regex) -> String {
        for line in &self.lines {
            if select(line) {
                if let Some(caps) = uri.captures(line) {
                    return format!("{}@{}", &caps[1], &caps[2]);
                }
                break;
            }
        }
        String::new()
    }

    /// AoR of the request originator, from the first From header.
    pub fn origin(&self, patterns: &Patterns) -> String {
        self.header_aor(is_from, &patterns.uri_with_params)
    }

    /// AoR of the request target, from the first To header.
    pub fn destination(&self, patterns: &Patterns) -> String {
        self.header_aor(is_to, &patterns.uri_with_params)
    }

    /// Insert a copy of `top_via` (branch taken from the topmost Via of
    /// this request) above the existing top Via, then annotate that Via
    /// with the transport-layer peer: a bare `;rport` becomes
    /// `received=<ip>;rport=<port>`, otherwise `;received=<ip>` is
    /// appended.
    pub fn add_top_via(&mut self, top_via: &str, peer: SocketAddr, patterns: &Patterns) {
        let Some(index) = self.lines.iter().position(|l| is_via(l)) else {
            return;
        };
        let line = self.lines[index].clone();
        let mut annotate_at = index;
        if let Some(caps) = patterns.branch.captures(&line) {
            let via = format!("{};branch={}", top_via, &caps[1]);
            tracing::debug!("SIP: adding top Via header: {}", via);
            self.lines.insert(index, via);
            annotate_at = index + 1;
        }
        self.lines[annotate_at] = annotate_via(&line, peer, patterns);
    }

    /// Drop the proxy's own Via from a response. Matching is whitespace
    /// insensitive (peers are allowed to re-space parameters when echoing
    /// Via headers back); a plain prefix match is kept as fallback.
    pub fn remove_own_via(&mut self, top_via: &str) {
        let own = squeeze(top_via);
        if let Some(index) = self
            .lines
            .iter()
            .position(|l| is_via(l) && (l.starts_with(top_via) || squeeze(l).starts_with(&own)))
        {
            tracing::debug!("SIP: removing top Via header: {}", self.lines[index]);
            self.lines.remove(index);
        }
    }

    /// If the Request-URI's `user@host` is a registrar key, substitute the
    /// stored contact.
    pub fn rewrite_request_uri(
        &mut self,
        registrar: &mut crate::sip::registrar::Registrar,
        patterns: &Patterns,
    ) {
        let start = self.start_line().to_string();
        let Some(caps) = patterns.request_line.captures(&start) else {
            return;
        };
        let method = caps[1].to_string();
        let uri = caps[2].to_string();
        match registrar.lookup(&uri) {
            Some(binding) => {
                let rewritten = format!("{} sip:{} SIP/2.0", method, binding.contact);
                tracing::debug!("SIP: request URI: {} -> {}", start, rewritten);
                self.lines[0] = rewritten;
            }
            None => {
                tracing::debug!("SIP: URI not registered, leaving unchanged: {}", uri);
            }
        }
    }

    /// Build the wire text of a local response to this request: the start
    /// line is replaced, a tagless To gets `;tag=123456`, the echoed Via is
    /// annotated with `received`/`rport`, Content-Length is zeroed, and the
    /// body is dropped.
    pub fn build_response(&self, code: &str, peer: SocketAddr, patterns: &Patterns) -> String {
        let mut out: Vec<String> = Vec::with_capacity(self.lines.len() + 1);
        out.push(format!("SIP/2.0 {}", code));
        for line in self.lines.iter().skip(1) {
            if line.is_empty() {
                out.push(String::new());
                break;
            }
            if is_to(line) && !line.contains(";tag") {
                out.push(format!("{};tag=123456", line));
            } else if is_via(line) {
                out.push(annotate_via(line, peer, patterns));
            } else if line.starts_with("Content-Length:") {
                out.push("Content-Length: 0".to_string());
            } else if line.starts_with("l:") {
                out.push("l: 0".to_string());
            } else {
                out.push(line.clone());
            }
        }
        out.push(String::new());
        out.join("\r\n")
    }
}

fn annotate_via(line: &str, peer: SocketAddr, patterns: &Patterns) -> String {
    if patterns.rport.is_match(line) {
        let received = format!("received={};rport={}", peer.ip(), peer.port());
        line.replacen("rport", &received, 1)
    } else {
        format!("{};received={}", line, peer.ip())
    }
}

fn squeeze(line: &str) -> String {
    line.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Hex + ASCII dump of a datagram that did not parse as SIP, one line per
/// `width` bytes.
pub fn hexdump(data: &[u8], width: usize) -> Vec<String> {
    data.chunks(width)
        .map(|chunk| {
            let mut hex = String::with_capacity(width * 3);
            let mut ascii = String::with_capacity(width);
            for i in 0..width {
                let byte = chunk.get(i).copied().unwrap_or(0);
                hex.push_str(&format!("{:02x} ", byte));
                ascii.push(if byte.is_ascii_alphanumeric() {
                    byte as char
                } else {
                    '.'
                });
            }
            format!("{}{}", hex, ascii)
        })
        .collect()
}
