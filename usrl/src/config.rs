use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use topicring::DEFAULT_SEGMENT_NAME;

/// Optional TOML configuration shared by the binaries. Every section and
/// field has a default, and command line flags override file values.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub bench: BenchSection,

    #[serde(default)]
    pub monitor: MonitorSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_record_size")]
    pub record_size: usize,
    #[serde(
        default = "default_grace",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub grace: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_record_size")]
    pub payload_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_segment")]
    pub segment: String,
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: None,
            port: default_port(),
            record_size: default_record_size(),
            grace: default_grace(),
        }
    }
}

impl Default for BenchSection {
    fn default() -> Self {
        BenchSection {
            host: default_host(),
            port: default_port(),
            threads: default_threads(),
            iterations: default_iterations(),
            payload_size: default_record_size(),
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        MonitorSection {
            segment: default_segment(),
            interval: default_interval(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_record_size() -> usize {
    4096
}

fn default_threads() -> usize {
    4
}

fn default_iterations() -> u64 {
    1_000_000
}

fn default_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_segment() -> String {
    DEFAULT_SEGMENT_NAME.to_string()
}

fn default_interval() -> Duration {
    Duration::from_millis(500)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads `path` when given, the defaults otherwise.
    pub fn load_or_default(path: Option<&str>) -> eyre::Result<Self> {
        match path {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.record_size, 4096);
        assert_eq!(config.server.grace, Duration::from_secs(2));
        assert_eq!(config.bench.host, "127.0.0.1");
        assert_eq!(config.bench.threads, 4);
        assert_eq!(config.bench.iterations, 1_000_000);
        assert_eq!(config.bench.payload_size, 4096);
        assert_eq!(config.monitor.segment, "/usrl_core");
        assert_eq!(config.monitor.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
[server]
port = 9000
grace = "750ms"

[monitor]
interval = "1s"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.record_size, 4096);
        assert_eq!(config.server.grace, Duration::from_millis(750));
        assert_eq!(config.monitor.interval, Duration::from_secs(1));
        assert_eq!(config.bench.port, 8080);
    }

    #[rstest]
    #[case("[server]\ngrace = \"soon\"\n")]
    #[case("[bench]\nthreads = \"four\"\n")]
    #[case("[server\n")]
    fn test_invalid(#[case] content: &str) {
        assert!(toml::from_str::<Config>(content).is_err());
    }

    #[test]
    fn test_load_file() -> eyre::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[bench]\nhost = \"10.0.0.1\"\nthreads = 16")?;
        let config = Config::load(file.path().to_str().unwrap())?;
        assert_eq!(config.bench.host, "10.0.0.1");
        assert_eq!(config.bench.threads, 16);

        assert!(Config::load("/nonexistent/usrl.toml").is_err());
        Ok(())
    }
}
