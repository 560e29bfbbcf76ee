use std::{env, net::IpAddr, path::PathBuf, time::Duration};

use config::Config;
use serde::Deserialize;

fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let seconds = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(seconds))
}

const fn default_max_total() -> u32 {
    50
}

const fn default_max_per_server() -> u32 {
    3
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Deserialize, Clone)]
pub struct SshConfig {
    /// Path to an OpenSSH private key used to authenticate to every server.
    #[serde(default = "default_private_key_file")]
    pub private_key_file: PathBuf,
    pub private_key_passphrase: Option<String>,
    /// Remote login used on every hop of the crawl, jump host included.
    #[serde(default = "default_login")]
    pub login: String,
    /// Global SSH session cap.
    #[serde(default = "default_max_total")]
    pub max_total: u32,
    /// Per-host cap.
    #[serde(default = "default_max_per_server")]
    pub max_per_server: u32,
    #[serde(default = "default_connect_timeout", deserialize_with = "deserialize_seconds")]
    pub connect_timeout: Duration,
    #[serde(default = "default_command_timeout", deserialize_with = "deserialize_seconds")]
    pub command_timeout: Duration,
}

fn default_private_key_file() -> PathBuf {
    PathBuf::from("keys/id_keyspider")
}

fn default_login() -> String {
    "root".to_owned()
}

fn default_ssh_config() -> SshConfig {
    SshConfig {
        private_key_file: default_private_key_file(),
        private_key_passphrase: None,
        login: default_login(),
        max_total: default_max_total(),
        max_per_server: default_max_per_server(),
        connect_timeout: default_connect_timeout(),
        command_timeout: default_command_timeout(),
    }
}

/// One fleet entry point named in configuration. The spider seeds its
/// first BFS crawl from each of these; every other server is discovered
/// by following `authorized_keys`/auth-log trails outward from them.
#[derive(Debug, Deserialize, Clone)]
pub struct SeedServer {
    pub hostname: String,
    pub ip: String,
    #[serde(default = "default_seed_ssh_port")]
    pub ssh_port: i32,
}

const fn default_seed_ssh_port() -> i32 {
    22
}

const fn default_default_depth() -> u32 {
    10
}

const fn default_spider_max_depth() -> u32 {
    50
}

fn default_spider_config() -> SpiderConfig {
    SpiderConfig {
        default_depth: default_default_depth(),
        max_depth: default_spider_max_depth(),
        full_rescan_schedule: None,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpiderConfig {
    /// BFS depth used when a crawl doesn't specify one.
    #[serde(default = "default_default_depth")]
    pub default_depth: u32,
    /// Hard ceiling no crawl may exceed regardless of what it requests.
    #[serde(default = "default_spider_max_depth")]
    pub max_depth: u32,
    /// Cron expression (`croner` syntax) for the periodic full-fleet
    /// rescan. Unset disables it; servers are then only revisited by
    /// their persistent `TailWatcher`.
    #[serde(default)]
    pub full_rescan_schedule: Option<String>,
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_reconnect_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_watcher_config() -> WatcherConfig {
    WatcherConfig {
        reconnect_delay: default_reconnect_delay(),
        max_reconnect_delay: default_max_reconnect_delay(),
        auto_spider: default_auto_spider(),
        spider_depth: default_watcher_spider_depth(),
    }
}

const fn default_auto_spider() -> bool {
    false
}

const fn default_watcher_spider_depth() -> u32 {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_reconnect_delay", deserialize_with = "deserialize_seconds")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_max_reconnect_delay", deserialize_with = "deserialize_seconds")]
    pub max_reconnect_delay: Duration,
    /// Whether an accepted event from a source not yet known to the graph
    /// enqueues a spider crawl rooted at that source.
    #[serde(default = "default_auto_spider")]
    pub auto_spider: bool,
    /// Ceiling on how many extra hops auto-spider may take past the
    /// watched server. `0` disables expansion even when `auto_spider` is on.
    #[serde(default = "default_watcher_spider_depth")]
    pub spider_depth: u32,
}

const fn default_max_lines_initial() -> u32 {
    50_000
}

const fn default_max_lines_incremental() -> u32 {
    50_000
}

fn default_log_config() -> LogTailConfig {
    LogTailConfig {
        max_lines_initial: default_max_lines_initial(),
        max_lines_incremental: default_max_lines_incremental(),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogTailConfig {
    /// Cap on lines read during a server's first scan.
    #[serde(default = "default_max_lines_initial")]
    pub max_lines_initial: u32,
    /// Cap on lines read per incremental rescan.
    #[serde(default = "default_max_lines_incremental")]
    pub max_lines_incremental: u32,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_unreachable_config() -> UnreachableConfig {
    UnreachableConfig {
        cache_ttl: default_cache_ttl(),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnreachableConfig {
    #[serde(default = "default_cache_ttl", deserialize_with = "deserialize_seconds")]
    pub cache_ttl: Duration,
}

fn default_database_url() -> String {
    "sqlite://keyspider.db".to_owned()
}

const fn default_listen() -> IpAddr {
    use core::net::Ipv6Addr;
    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8000
}

fn default_loglevel() -> String {
    "info".to_owned()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Configuration {
    #[serde(default = "default_ssh_config")]
    pub ssh: SshConfig,
    #[serde(default = "default_spider_config")]
    pub spider: SpiderConfig,
    #[serde(default = "default_watcher_config")]
    pub watcher: WatcherConfig,
    #[serde(default = "default_log_config")]
    pub log: LogTailConfig,
    #[serde(default = "default_unreachable_config")]
    pub unreachable: UnreachableConfig,
    /// Fleet entry points the spider crawls from at startup.
    #[serde(default)]
    pub seeds: Vec<SeedServer>,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
}

/// Loads layered configuration: defaults, then an optional TOML file
/// (`CONFIG` env var or `./config.toml`), then environment overrides.
pub fn get_configuration() -> Result<(Configuration, String), String> {
    let config_path = env::var("CONFIG").unwrap_or_else(|_| String::from("./config.toml"));
    let config_builder = Config::builder();

    let (config_builder, config_source) = if std::path::Path::new(&config_path).exists() {
        use config::FileFormat::Toml;
        (
            config_builder.add_source(config::File::new(&config_path, Toml).required(false)),
            format!("Loading configuration from '{}'", &config_path),
        )
    } else {
        (
            config_builder,
            format!("No configuration file found at '{}'", &config_path),
        )
    };

    let mut config: Configuration = config_builder
        .add_source(config::Environment::default().separator("__"))
        .build()
        .map_err(|e| format!("Error while reading configuration source: {e}"))?
        .try_deserialize()
        .map_err(|e| format!("Error while parsing configuration: {e}"))?;

    if let Ok(ssh_key_path) = std::env::var("SSH_KEY") {
        config.ssh.private_key_file = std::path::PathBuf::from(ssh_key_path);
    }

    Ok((config, config_source))
}
