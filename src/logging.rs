//! Subscriber assembly for the two log streams: general diagnostics and the
//! SIP message transcript.
//!
//! Transcript events carry `target: "sip_trace"`. When `--sip-log` names a
//! file they are routed there and suppressed from the general sink;
//! otherwise they share it. Transcripts are debug level, so they only show
//! up with `-d`, same as the rest of the debug output.

use std::fs::File;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Config;
use crate::Result;

/// Event target used for SIP datagram transcripts.
pub const SIP_TRACE: &str = "sip_trace";

pub fn init(config: &Config) -> Result<()> {
    let max_level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.debug { "debug" } else { "info" }));

    let sip_to_file = config.sip_log_file.is_some();
    let general = match &config.log_file {
        Some(path) => tracing_subscriber::fmt::layer()
            .with_writer(Arc::new(File::create(path)?))
            .with_ansi(false)
            .boxed(),
        None => tracing_subscriber::fmt::layer().boxed(),
    }
    .with_filter(env_filter)
    .with_filter(filter_fn(move |meta| {
        !(sip_to_file && meta.target() == SIP_TRACE)
    }));

    let registry = tracing_subscriber::registry().with(general);
    match &config.sip_log_file {
        Some(path) => {
            let transcript = tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(File::create(path)?))
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(move |meta| {
                    meta.target() == SIP_TRACE && *meta.level() <= max_level
                }));
            registry.with(transcript).init();
        }
        None => registry.init(),
    }
    Ok(())
}
