use rand::Rng;
use tokio::time::Duration;

use crate::config::RaftConfig;

/// Draws a fresh random election timeout. Each arming samples independently;
/// this randomness is what breaks split votes.
pub fn random_election_timeout(config: &RaftConfig) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms);
    Duration::from_millis(timeout_ms)
}
