//! SIP signaling engine: registrar, digest authentication and
//! stateless-per-transaction proxying or redirection over UDP.

pub mod auth;
pub mod message;
pub mod registrar;
pub mod server;

pub use server::SipServer;
