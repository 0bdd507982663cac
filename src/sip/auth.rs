//! REGISTER authentication: nonce generation and RFC 2617 digest
//! verification (qop absent). The realm is the fixed string `dummy` and
//! every endpoint shares one configured password: this is a lab tool, not
//! an account database.

use std::collections::HashMap;

use rand::Rng;

use super::message::Patterns;

pub const REALM: &str = "dummy";

const NONCE_LEN: usize = 32;
const NONCE_CHARS: &[u8] = b"0123456789abcdef";

/// 32 chars drawn uniformly from `[0-9a-f]`. A non-crypto PRNG is fine
/// here; the nonce only ties a challenge to its follow-up.
pub fn generate_nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LEN)
        .map(|_| NONCE_CHARS[rng.random_range(0..NONCE_CHARS.len())] as char)
        .collect()
}

pub fn challenge_header(nonce: &str) -> String {
    format!(
        "WWW-Authenticate: Digest realm=\"{}\", nonce=\"{}\"",
        REALM, nonce
    )
}

/// Split a credential list (`k1="v1", k2=v2, ...`) into a map, stripping
/// quotes and surrounding space from both sides.
pub fn parse_credentials(credentials: &str, patterns: &Patterns) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for element in credentials.split(',') {
        if let Some(caps) = patterns.kv.captures(element) {
            let key = caps[1].trim().to_string();
            let value = caps[2].trim_matches(|c| c == '"' || c == ' ').to_string();
            out.insert(key, value);
        }
    }
    out
}

/// Verify a digest response against the issued nonce and the shared
/// password:
///
/// ```text
/// HA1 = MD5(username ":" realm ":" password)
/// HA2 = MD5(method ":" uri)
/// expected = MD5(HA1 ":" nonce ":" HA2)
/// ```
pub fn verify(
    credentials: &str,
    password: &str,
    nonce: &str,
    method: &str,
    patterns: &Patterns,
) -> bool {
    let fields = parse_credentials(credentials, patterns);
    match fields.get("nonce") {
        Some(sent) if sent == nonce => {}
        _ => {
            tracing::warn!("SIP: authentication: incorrect nonce");
            return false;
        }
    }
    let (Some(username), Some(realm), Some(uri), Some(response)) = (
        fields.get("username"),
        fields.get("realm"),
        fields.get("uri"),
        fields.get("response"),
    ) else {
        tracing::warn!("SIP: authentication: incomplete credentials");
        return false;
    };
    let expected = digest(username, realm, password, method, uri, nonce);
    if expected == *response {
        tracing::debug!("SIP: authentication: succeeded");
        true
    } else {
        tracing::warn!("SIP: authentication: expected={}", expected);
        tracing::warn!("SIP: authentication: response={}", response);
        false
    }
}

/// The digest a client is expected to send for the given parameters.
pub fn digest(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5::compute(format!("{}:{}:{}", username, realm, password));
    let ha2 = md5::compute(format!("{}:{}", method, uri));
    format!(
        "{:x}",
        md5::compute(format!("{:x}:{}:{:x}", ha1, nonce, ha2))
    )
}
