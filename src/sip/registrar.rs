//! In-memory registrar: AoR -> current binding. Owned by the SIP worker
//! task, no locking. Registrations do not survive a restart.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::warn;

/// A registered endpoint.
#[derive(Clone)]
pub struct Binding {
    /// Transport-reachable URI body (`user@host[:port]`) from the Contact
    /// header.
    pub contact: String,
    /// Socket the REGISTER arrived on. Requests for this AoR are emitted
    /// from the same socket so replies come back on the right interface.
    pub socket: Arc<UdpSocket>,
    /// Transport-layer peer; differs from the contact host behind NAT.
    pub addr: SocketAddr,
    /// Epoch seconds after which the binding is dead.
    pub expires_at: u64,
}

#[derive(Default)]
pub struct Registrar {
    bindings: HashMap<String, Binding>,
}

impl Registrar {
    pub fn new() -> Self {
        Registrar::default()
    }

    pub fn upsert(&mut self, aor: String, binding: Binding) {
        self.bindings.insert(aor, binding);
    }

    pub fn remove(&mut self, aor: &str) {
        self.bindings.remove(aor);
    }

    /// Current binding for an AoR. An expired binding is purged on the spot
    /// and reported as absent.
    pub fn lookup(&mut self, aor: &str) -> Option<Binding> {
        let binding = self.bindings.get(aor)?;
        if binding.expires_at > crate::now_secs() {
            return Some(binding.clone());
        }
        warn!("SIP: registration for {} has expired", aor);
        self.bindings.remove(aor);
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
