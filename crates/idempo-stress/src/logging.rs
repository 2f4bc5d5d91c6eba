use std::collections::BTreeMap;
use std::env;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use sentry::types::Dsn;

use idempo_service::logging::init_json_logging;
use idempo_service::metrics;

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry_dsn: Option<Dsn>,
    pub tracing: bool,
    pub metrics: bool,
    /// Sends metrics to this statsd host instead of a local sink.
    pub statsd: Option<String>,
    pub metrics_prefix: String,
    pub custom_tags: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    _udp_sink: Option<JoinHandle<()>>,
}

/// Initializes logging, error reporting and metrics.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. It may only be called
/// while the program is still single-threaded.
pub unsafe fn init(config: Config) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if let Some(dsn) = config.sentry_dsn {
        guard._sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        }));
    }

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void, formatted like in production:
        init_json_logging("INFO", || NoopWriter);
    }

    if config.metrics {
        let host = match config.statsd {
            Some(host) => host,
            None => {
                let (addr, sink) = spawn_udp_sink().context("failed to start statsd sink")?;
                guard._udp_sink = Some(sink);
                addr.to_string()
            }
        };

        // have some default tags, just to be closer to the real world config
        let mut tags = config.custom_tags;
        tags.entry("host".into()).or_insert_with(|| "stresstest".into());
        tags.entry("env".into()).or_insert_with(|| "stresstest".into());

        metrics::configure_statsd(&config.metrics_prefix, host.as_str(), tags)?;
    }

    Ok(guard)
}

/// Receives and discards statsd packets on a local port.
fn spawn_udp_sink() -> Result<(SocketAddr, JoinHandle<()>)> {
    let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)))?;
    let addr = socket.local_addr()?;

    let handle = thread::Builder::new()
        .name("statsd-sink".into())
        .spawn(move || {
            let mut buf = [0; 1024];
            while socket.recv(&mut buf).is_ok() {}
        })?;

    Ok((addr, handle))
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
