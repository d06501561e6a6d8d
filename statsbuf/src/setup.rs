use std::path::Path;

use anyhow::{Context, Result};
use statsbuf_config::{Config, OverridableConfig};
use statsbuf_statsd::{BufferedClient, NoopClient, Statsd, replace_host};

/// Loads the config file and applies overrides from the environment.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    let mut config = Config::from_path(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    config
        .apply_override(OverridableConfig::from_env())
        .context("invalid config override")?;

    Ok(config)
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    let hostname = config.upstream.hostname();

    statsbuf_log::info!("sending metrics to {}", config.upstream.upstream);
    statsbuf_log::info!(
        "  prefix: {:?}",
        replace_host(&config.upstream.prefix, &hostname)
    );
    statsbuf_log::info!("  flush interval: {}ms", config.buffer.flush_interval);
    statsbuf_log::info!("  max packet size: {} bytes", config.buffer.max_packet_size);
    statsbuf_log::info!(
        "  sample rates: {} (timers {})",
        config.buffer.sample_rate,
        config.buffer.timer_sample_rate
    );
}

/// Creates a buffered client from the config.
pub fn create_client(config: &Config) -> Result<BufferedClient> {
    config.validate().context("invalid statsd configuration")?;

    BufferedClient::new(&config.upstream, &config.buffer).with_context(|| {
        format!(
            "failed to start statsd client for {}",
            config.upstream.upstream
        )
    })
}

/// Creates a buffered client, or a no-op client if the buffered client cannot be started.
///
/// Metrics are never essential to an application. The error is logged and callers continue with
/// a client that discards all metrics.
pub fn client_or_noop(config: &Config) -> Box<dyn Statsd> {
    match create_client(config) {
        Ok(client) => {
            dump_spawn_infos(config);
            Box::new(client)
        }
        Err(error) => {
            statsbuf_log::ensure_error(error);
            Box::new(NoopClient)
        }
    }
}
