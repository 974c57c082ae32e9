use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Shared store endpoint. Required: without it the service cannot run.
    #[envconfig(from = "HLL_REDIS_HOST")]
    pub redis_host: String,

    #[envconfig(from = "HLL_REDIS_PORT")]
    pub redis_port: u16,

    /// Process-wide ceiling on outbound requests per second.
    #[envconfig(from = "HLL_LOCAL_MAX_SENDS_PER_SEC", default = "45")]
    pub max_sends_per_sec: u32,

    /// Queues are trimmed to this many entries after every push.
    #[envconfig(from = "HLL_WH_MAX_QUEUE_LENGTH", default = "150")]
    pub max_queue_length: i64,

    #[envconfig(from = "HLL_WH_MAX_RETRIES", default = "5")]
    pub max_reattempts: usize,

    /// How long per-bucket rate limit counters stay visible to peers.
    #[envconfig(from = "HLL_WH_SERVICE_RL_TIME_WINDOW", default = "600")]
    pub rate_limit_count_window: EnvSecsDuration,

    #[envconfig(from = "TAGGED_VERSION", default = "unknown")]
    pub tagged_version: String,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The store lives on database 0, shared with every peer service.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/0", self.redis_host, self.redis_port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecsDurationError)?;

        Ok(EnvSecsDuration(Duration::from_secs(secs)))
    }
}
