use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use statsbuf_log::LogConfig;
use statsbuf_statsd::{BufferConfig, UpstreamConfig};

/// Defines the source of a config error
#[derive(Debug)]
enum ConfigErrorSource {
    /// An error occurring independently.
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field, either from the file or an override.
    Field(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
    location: ConfigErrorSource,
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            location: ConfigErrorSource::None,
            source: None,
        }
    }

    fn wrap<E>(source: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: Some(Box::new(source)),
            ..Self::new(kind)
        }
    }

    fn for_field<E>(source: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(source, ConfigErrorKind::InvalidValue).field(field)
    }

    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.location = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    fn field(mut self, name: &'static str) -> Self {
        self.location = ConfigErrorSource::Field(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }

    /// Returns the name of the offending field, if the error refers to one.
    pub fn field_name(&self) -> Option<&'static str> {
        match self.location {
            ConfigErrorSource::Field(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value
    #[error("invalid config value")]
    InvalidValue,
}

/// A value outside of its allowed range.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct OutOfRange(&'static str);

/// Overrides for individual configuration values.
///
/// All values are given as strings, as they come from environment variables or command line
/// arguments. See [`Config::apply_override`].
#[derive(Clone, Debug, Default)]
pub struct OverridableConfig {
    /// The address of the statsd server.
    pub upstream: Option<String>,
    /// The prefix prepended to all metric names.
    pub prefix: Option<String>,
    /// The flush interval in milliseconds.
    pub flush_interval: Option<String>,
    /// The sample rate for all observations except timings.
    pub sample_rate: Option<String>,
}

impl OverridableConfig {
    /// Reads overrides from `STATSBUF_UPSTREAM`, `STATSBUF_PREFIX`, `STATSBUF_FLUSH_INTERVAL`
    /// and `STATSBUF_SAMPLE_RATE`.
    pub fn from_env() -> Self {
        Self {
            upstream: std::env::var("STATSBUF_UPSTREAM").ok(),
            prefix: std::env::var("STATSBUF_PREFIX").ok(),
            flush_interval: std::env::var("STATSBUF_FLUSH_INTERVAL").ok(),
            sample_rate: std::env::var("STATSBUF_SAMPLE_RATE").ok(),
        }
    }
}

/// Config struct.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LogConfig,
    /// The statsd server and metric naming.
    pub upstream: UpstreamConfig,
    /// Aggregation and flushing.
    pub buffer: BufferConfig,
}

impl Config {
    /// Loads a config from the YAML file at the given path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let file = fs::File::open(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

        let config: Self = serde_yaml::from_reader(io::BufReader::new(file))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a config from a YAML string.
    ///
    /// This is mostly useful for tests.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?;

        config.validate()?;
        Ok(config)
    }

    /// Serializes the config to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::InvalidValue))
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters)
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(upstream) = overrides.upstream {
            self.upstream.upstream = upstream;
        }

        if let Some(prefix) = overrides.prefix {
            self.upstream.prefix = prefix;
        }

        if let Some(flush_interval) = overrides.flush_interval {
            self.buffer.flush_interval = flush_interval
                .parse()
                .map_err(|err| ConfigError::for_field(err, "flush_interval"))?;
        }

        if let Some(sample_rate) = overrides.sample_rate {
            self.buffer.sample_rate = sample_rate
                .parse()
                .map_err(|err| ConfigError::for_field(err, "sample_rate"))?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks that all values are within their allowed ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer = &self.buffer;

        check_rate(buffer.sample_rate, "sample_rate")?;
        check_rate(buffer.timer_sample_rate, "timer_sample_rate")?;

        if buffer.flush_interval == 0 {
            return Err(ConfigError::for_field(
                OutOfRange("must be greater than zero"),
                "flush_interval",
            ));
        }

        if buffer.max_packet_size == 0 {
            return Err(ConfigError::for_field(
                OutOfRange("must be greater than zero"),
                "max_packet_size",
            ));
        }

        if buffer.queue_size == 0 {
            return Err(ConfigError::for_field(
                OutOfRange("must be greater than zero"),
                "queue_size",
            ));
        }

        if let Some(p) = buffer.percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
            statsbuf_log::debug!(percentile = p, "invalid percentile");
            return Err(ConfigError::for_field(
                OutOfRange("must be between 0 and 100"),
                "percentiles",
            ));
        }

        Ok(())
    }
}

fn check_rate(rate: f64, field: &'static str) -> Result<(), ConfigError> {
    if rate > 0.0 && rate <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::for_field(
            OutOfRange("must be greater than 0 and at most 1"),
            field,
        ))
    }
}
