use std::time::Duration;

/// Numeric knobs for the session engine. The engine is constructed with a
/// resolved value of this type (or a [`ConfigProvider`]); it never reads
/// an environment source directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sweep_interval: Duration,
    pub placement_ttl: Duration,
    pub battle_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub channel_capacity: usize,
    pub salvo_shots_per_turn: u32,
    pub sweeper_yield_batch: usize,
    pub heartbeat_yield_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sweep_interval: Duration::from_secs(300),
            placement_ttl: Duration::from_secs(600),
            battle_ttl: Duration::from_secs(2100),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(8),
            channel_capacity: 10,
            salvo_shots_per_turn: 3,
            sweeper_yield_batch: 1000,
            heartbeat_yield_batch: 10_000,
        }
    }
}

impl EngineConfig {
    /// Overlays environment variables on top of [`Default`]. Unset or
    /// unparsable variables fall back to the default silently except for a
    /// debug log, matching the rest of the engine's "never hard-fail on
    /// config" stance.
    fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_secs("BATTLESHIP_SWEEP_INTERVAL_SECS") {
            self.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("BATTLESHIP_PLACEMENT_TTL_SECS") {
            self.placement_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("BATTLESHIP_BATTLE_TTL_SECS") {
            self.battle_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("BATTLESHIP_HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("BATTLESHIP_HEARTBEAT_TIMEOUT_SECS") {
            self.heartbeat_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("BATTLESHIP_RECONNECT_TIMEOUT_SECS") {
            self.reconnect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = std::env::var("BATTLESHIP_CHANNEL_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.channel_capacity = v;
        }
        if let Some(v) = std::env::var("BATTLESHIP_SALVO_SHOTS_PER_TURN")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            self.salvo_shots_per_turn = v;
        }
        self
    }
}

fn env_secs(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::debug!("ignoring unparsable {name}={raw}");
                None
            }
        },
        Err(_) => None,
    }
}

/// Supplies a resolved [`EngineConfig`] to the rest of the server. The
/// session engine only ever sees the trait object, never an environment
/// variable directly.
pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> EngineConfig;
}

pub struct EnvConfigProvider;

impl ConfigProvider for EnvConfigProvider {
    fn get_config(&self) -> EngineConfig {
        EngineConfig::default().with_env_overrides()
    }
}

pub fn default_config_provider() -> Box<dyn ConfigProvider> {
    Box::new(EnvConfigProvider)
}
