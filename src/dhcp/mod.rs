//! DHCP server: DISCOVER→OFFER, REQUEST→ACK, a persistent lease store and
//! the option subset needed for phone provisioning (66/67 included).

pub mod leases;
pub mod packet;
pub mod server;

pub use server::{DhcpServer, DhcpSettings};
