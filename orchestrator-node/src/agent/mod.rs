//! Learning agent
//!
//! Dueling double-DQN over the discrete scaling action space, with
//! prioritized replay and epsilon-greedy exploration. `select_action` is
//! deterministic for a given seed and weight state; `observe` is
//! non-blocking; `train_step` runs opportunistically once the buffer holds a
//! batch and is intended for the blocking pool.

mod network;
mod replay;

pub use network::{Adam, QNetwork};
pub use replay::{Experience, PrioritizedReplay};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DrlConfig;
use crate::error::Result;
use crate::types::{AgentAction, VnfType};

/// Attention heads in the Q-network
const ATTENTION_HEADS: usize = 8;

/// Train steps over which beta anneals from its start value to 1.0
const BETA_ANNEAL_STEPS: f64 = 50_000.0;

const ALPHA: f64 = 0.6;
const BETA_START: f64 = 0.4;

/// Dimension of the state vector for `k` enabled VNF types: data-center
/// headroom (3), six features per type, pending requests by priority band (3)
pub fn state_dimension(k: usize) -> usize {
    3 + 6 * k + 3
}

/// Snapshot of training progress
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub epsilon: f64,
    pub beta: f64,
    pub train_steps: u64,
    pub episode: u64,
    pub replay_len: usize,
    pub last_loss: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    state_dim: usize,
    action_dim: usize,
    online: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    epsilon: f64,
    beta: f64,
    train_steps: u64,
    episode: u64,
}

struct AgentInner {
    online: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    replay: PrioritizedReplay,
    epsilon: f64,
    beta: f64,
    train_steps: u64,
    episode: u64,
    episode_reward: f64,
    last_loss: Option<f64>,
    rng: StdRng,
}

pub struct DrlAgent {
    config: DrlConfig,
    types: Vec<VnfType>,
    state_dim: usize,
    action_dim: usize,
    inner: Mutex<AgentInner>,
    /// Rewards earned by allocator events since the last control tick
    pending_reward: Mutex<f64>,
}

impl DrlAgent {
    pub fn new(config: DrlConfig, types: Vec<VnfType>) -> Self {
        let state_dim = state_dimension(types.len());
        let action_dim = types.len() * 3;

        let loaded = Self::load_checkpoint(&config.model_path, state_dim, action_dim);
        let inner = match loaded {
            Some(checkpoint) => {
                info!(
                    path = %config.model_path,
                    episode = checkpoint.episode,
                    train_steps = checkpoint.train_steps,
                    "Loaded agent checkpoint"
                );
                AgentInner {
                    online: checkpoint.online,
                    target: checkpoint.target,
                    optimizer: checkpoint.optimizer,
                    replay: PrioritizedReplay::new(config.memory_size, ALPHA),
                    epsilon: checkpoint.epsilon,
                    beta: checkpoint.beta,
                    train_steps: checkpoint.train_steps,
                    episode: checkpoint.episode,
                    episode_reward: 0.0,
                    last_loss: None,
                    rng: StdRng::seed_from_u64(config.seed),
                }
            }
            None => {
                let mut rng = StdRng::seed_from_u64(config.seed);
                let online = QNetwork::new(
                    state_dim,
                    action_dim,
                    config.hidden_dim,
                    ATTENTION_HEADS,
                    &mut rng,
                );
                let target = online.clone();
                let optimizer = Adam::new(config.learning_rate, &online);
                AgentInner {
                    online,
                    target,
                    optimizer,
                    replay: PrioritizedReplay::new(config.memory_size, ALPHA),
                    epsilon: config.epsilon_start,
                    beta: BETA_START,
                    train_steps: 0,
                    episode: 0,
                    episode_reward: 0.0,
                    last_loss: None,
                    rng,
                }
            }
        };

        Self {
            config,
            types,
            state_dim,
            action_dim,
            inner: Mutex::new(inner),
            pending_reward: Mutex::new(0.0),
        }
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    fn state_row(&self, state: &[f64]) -> Array2<f64> {
        let mut padded = state.to_vec();
        padded.resize(self.state_dim, 0.0);
        Array2::from_shape_vec((1, self.state_dim), padded).expect("state row shape")
    }

    /// Epsilon-greedy action selection
    pub fn select_action(&self, state: &[f64]) -> AgentAction {
        let mut inner = self.inner.lock().expect("agent lock");
        let index = if inner.rng.gen::<f64>() < inner.epsilon {
            inner.rng.gen_range(0..self.action_dim)
        } else {
            let q = inner.online.forward(&self.state_row(state));
            argmax_row(&q, 0)
        };
        AgentAction::from_index(index, &self.types)
            .unwrap_or(AgentAction::NoOp(self.types[0]))
    }

    /// Greedy action, ignoring exploration; used by evaluation paths
    pub fn greedy_action(&self, state: &[f64]) -> AgentAction {
        let inner = self.inner.lock().expect("agent lock");
        let q = inner.online.forward(&self.state_row(state));
        AgentAction::from_index(argmax_row(&q, 0), &self.types)
            .unwrap_or(AgentAction::NoOp(self.types[0]))
    }

    /// Record a transition. Non-blocking: a short lock push into the buffer.
    pub fn observe(
        &self,
        state: &[f64],
        action: AgentAction,
        reward: f64,
        next_state: &[f64],
        terminal: bool,
    ) {
        let Some(index) = action.to_index(&self.types) else {
            warn!(?action, "Observed action outside the enabled action space");
            return;
        };
        let mut inner = self.inner.lock().expect("agent lock");
        inner.episode_reward += reward;
        inner.replay.push(Experience {
            state: state.to_vec(),
            action: index,
            reward,
            next_state: next_state.to_vec(),
            terminal,
        });
    }

    /// Accumulate reward earned between control ticks (allocator events)
    pub fn add_reward(&self, delta: f64) {
        *self.pending_reward.lock().expect("reward lock") += delta;
    }

    /// Take and reset the accumulated between-tick reward
    pub fn drain_pending_reward(&self) -> f64 {
        let mut pending = self.pending_reward.lock().expect("reward lock");
        std::mem::take(&mut *pending)
    }

    /// One optimization step over a prioritized batch. Returns the weighted
    /// loss, or `None` while the buffer is smaller than a batch.
    pub fn train_step(&self) -> Option<f64> {
        let mut inner = self.inner.lock().expect("agent lock");
        let batch_size = self.config.batch_size;
        if inner.replay.len() < batch_size {
            return None;
        }

        let beta = inner.beta;
        let (indices, batch, weights) = {
            // Split borrows: the RNG and the replay buffer live in the same struct
            let AgentInner { replay, rng, .. } = &mut *inner;
            replay.sample(batch_size, beta, rng)
        };

        let states = batch_matrix(&batch, self.state_dim, false);
        let next_states = batch_matrix(&batch, self.state_dim, true);

        // Double DQN: online picks, target evaluates
        let online_next = inner.online.forward(&next_states);
        let target_next = inner.target.forward(&next_states);
        let gamma = self.config.gamma;
        let targets: Vec<f64> = batch
            .iter()
            .enumerate()
            .map(|(i, experience)| {
                let best = argmax_row(&online_next, i);
                let bootstrap = if experience.terminal {
                    0.0
                } else {
                    gamma * target_next[[i, best]]
                };
                experience.reward + bootstrap
            })
            .collect();

        let cache = inner.online.forward_cached(&states);
        let mut dq = Array2::zeros(cache.q.raw_dim());
        let mut td_errors = Vec::with_capacity(batch.len());
        let mut loss = 0.0;
        for (i, experience) in batch.iter().enumerate() {
            let td = cache.q[[i, experience.action]] - targets[i];
            td_errors.push(td);
            loss += weights[i] * td * td;
            dq[[i, experience.action]] = 2.0 * weights[i] * td / batch.len() as f64;
        }
        loss /= batch.len() as f64;

        let grads = inner.online.backward(&cache, &dq);
        {
            let AgentInner {
                online, optimizer, ..
            } = &mut *inner;
            optimizer.step(online, grads);
        }
        inner.replay.update_priorities(&indices, &td_errors);

        inner.train_steps += 1;
        if inner.train_steps % self.config.target_update_freq == 0 {
            let AgentInner { online, target, .. } = &mut *inner;
            target.copy_from(online);
            debug!(train_steps = inner.train_steps, "Target network synced");
        }

        if inner.epsilon > self.config.epsilon_min {
            inner.epsilon = (inner.epsilon * self.config.epsilon_decay)
                .max(self.config.epsilon_min);
        }
        inner.beta = (inner.beta + (1.0 - BETA_START) / BETA_ANNEAL_STEPS).min(1.0);
        inner.last_loss = Some(loss);
        Some(loss)
    }

    /// Close the current episode, returning its index and cumulative reward
    pub fn end_episode(&self) -> (u64, f64) {
        let mut inner = self.inner.lock().expect("agent lock");
        inner.episode += 1;
        let reward = std::mem::take(&mut inner.episode_reward);
        (inner.episode, reward)
    }

    pub fn stats(&self) -> AgentStats {
        let inner = self.inner.lock().expect("agent lock");
        AgentStats {
            epsilon: inner.epsilon,
            beta: inner.beta,
            train_steps: inner.train_steps,
            episode: inner.episode,
            replay_len: inner.replay.len(),
            last_loss: inner.last_loss,
        }
    }

    /// Persist weights and optimizer state to the configured artifact path
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner.lock().expect("agent lock");
        let checkpoint = Checkpoint {
            state_dim: self.state_dim,
            action_dim: self.action_dim,
            online: inner.online.clone(),
            target: inner.target.clone(),
            optimizer: inner.optimizer.clone(),
            epsilon: inner.epsilon,
            beta: inner.beta,
            train_steps: inner.train_steps,
            episode: inner.episode,
        };
        drop(inner);

        let path = Path::new(&self.config.model_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_vec(&checkpoint)?;
        std::fs::write(path, encoded)?;
        info!(path = %self.config.model_path, "Agent checkpoint written");
        Ok(())
    }

    fn load_checkpoint(path: &str, state_dim: usize, action_dim: usize) -> Option<Checkpoint> {
        let raw = std::fs::read(path).ok()?;
        match serde_json::from_slice::<Checkpoint>(&raw) {
            Ok(checkpoint) => {
                if checkpoint.state_dim != state_dim || checkpoint.action_dim != action_dim {
                    warn!(
                        path,
                        "Checkpoint dimensions do not match the enabled VNF set; starting fresh"
                    );
                    return None;
                }
                Some(checkpoint)
            }
            Err(e) => {
                warn!(path, error = %e, "Unreadable checkpoint; starting fresh");
                None
            }
        }
    }

    /// Reward weights, exposed for the decision loop
    pub fn rewards(&self) -> crate::config::RewardWeights {
        self.config.rewards
    }
}

fn argmax_row(q: &Array2<f64>, row: usize) -> usize {
    let mut best = 0usize;
    let mut best_value = f64::NEG_INFINITY;
    for (i, value) in q.row(row).iter().enumerate() {
        if *value > best_value {
            best_value = *value;
            best = i;
        }
    }
    best
}

fn batch_matrix(batch: &[Experience], state_dim: usize, next: bool) -> Array2<f64> {
    let mut matrix = Array2::zeros((batch.len(), state_dim));
    for (i, experience) in batch.iter().enumerate() {
        let source = if next {
            &experience.next_state
        } else {
            &experience.state
        };
        for (j, value) in source.iter().take(state_dim).enumerate() {
            matrix[[i, j]] = *value;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;

    fn agent_with(types: Vec<VnfType>, model_path: &str) -> DrlAgent {
        let mut config = OrchestratorConfig::default().drl_config;
        config.model_path = model_path.to_string();
        config.hidden_dim = 32;
        config.batch_size = 8;
        DrlAgent::new(config, types)
    }

    fn types3() -> Vec<VnfType> {
        vec![VnfType::Firewall, VnfType::Spamfilter, VnfType::Mail]
    }

    #[test]
    fn test_select_action_deterministic_for_seed() {
        let a = agent_with(types3(), "/nonexistent/a.json");
        let b = agent_with(types3(), "/nonexistent/b.json");
        let state: Vec<f64> = (0..a.state_dim()).map(|i| i as f64 / 30.0).collect();
        for _ in 0..20 {
            assert_eq!(a.select_action(&state), b.select_action(&state));
        }
    }

    #[test]
    fn test_greedy_is_pure_function_of_state() {
        let agent = agent_with(types3(), "/nonexistent/c.json");
        let state: Vec<f64> = (0..agent.state_dim()).map(|i| (i % 5) as f64 / 5.0).collect();
        let first = agent.greedy_action(&state);
        for _ in 0..10 {
            assert_eq!(agent.greedy_action(&state), first);
        }
    }

    #[test]
    fn test_train_requires_full_batch() {
        let agent = agent_with(types3(), "/nonexistent/d.json");
        let state = vec![0.0; agent.state_dim()];
        for _ in 0..3 {
            agent.observe(
                &state,
                AgentAction::NoOp(VnfType::Firewall),
                0.0,
                &state,
                false,
            );
        }
        assert!(agent.train_step().is_none());
    }

    #[test]
    fn test_training_runs_and_decays_epsilon() {
        let agent = agent_with(types3(), "/nonexistent/e.json");
        let dim = agent.state_dim();
        for i in 0..32 {
            let state: Vec<f64> = (0..dim).map(|j| ((i + j) % 7) as f64 / 7.0).collect();
            let next: Vec<f64> = (0..dim).map(|j| ((i + j + 1) % 7) as f64 / 7.0).collect();
            let action = AgentAction::from_index(i % agent.action_dim(), &types3()).unwrap();
            agent.observe(&state, action, if i % 2 == 0 { 1.0 } else { -0.5 }, &next, false);
        }
        let before = agent.stats();
        for _ in 0..5 {
            assert!(agent.train_step().is_some());
        }
        let after = agent.stats();
        assert_eq!(after.train_steps, before.train_steps + 5);
        assert!(after.epsilon < before.epsilon);
        assert!(after.last_loss.is_some());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let path_str = path.to_str().unwrap().to_string();

        let agent = agent_with(types3(), &path_str);
        let state = vec![0.25; agent.state_dim()];
        for i in 0..16 {
            agent.observe(
                &state,
                AgentAction::from_index(i % 9, &types3()).unwrap(),
                0.5,
                &state,
                false,
            );
        }
        agent.train_step();
        agent.checkpoint().unwrap();

        let restored = agent_with(types3(), &path_str);
        let restored_stats = restored.stats();
        assert_eq!(restored_stats.train_steps, agent.stats().train_steps);

        // Restored weights produce the same greedy policy
        assert_eq!(restored.greedy_action(&state), agent.greedy_action(&state));
    }

    #[test]
    fn test_pending_reward_drains_once() {
        let agent = agent_with(types3(), "/nonexistent/f.json");
        agent.add_reward(2.0);
        agent.add_reward(-0.5);
        assert!((agent.drain_pending_reward() - 1.5).abs() < 1e-12);
        assert_eq!(agent.drain_pending_reward(), 0.0);
    }
}
