#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout in ms (default: 150).
    pub election_timeout_min_ms: u64,
    /// Maximum election timeout in ms (default: 300).
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat/replication interval in ms (default: 50).
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

/// Knobs for the RPC proxy sitting in front of every inbound call.
///
/// In reliable mode each inbound RPC sleeps a uniform `latency_min_ms..=
/// latency_max_ms` to simulate network latency. In unreliable mode a single
/// roll per call either drops it (the caller sees a transport error) or
/// delays it by `delay_ms`.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub unreliable: bool,
    /// Probability an inbound RPC is dropped (unreliable mode only).
    pub drop_probability: f64,
    /// Probability an inbound RPC is delayed (unreliable mode only).
    pub delay_probability: f64,
    /// Delay applied to delayed RPCs, in ms.
    pub delay_ms: u64,
    /// Simulated latency range in reliable mode, in ms.
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    /// Seed for the proxy's RNG; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            unreliable: false,
            drop_probability: 0.1,
            delay_probability: 0.1,
            delay_ms: 75,
            latency_min_ms: 1,
            latency_max_ms: 5,
            seed: None,
        }
    }
}

impl RpcOptions {
    /// Default options with unreliable mode switched on.
    pub fn unreliable() -> Self {
        Self {
            unreliable: true,
            ..Default::default()
        }
    }
}
