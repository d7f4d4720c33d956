//! Online training: act in an environment, replay, update

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rlkit_core::{RLError, Result};
use rlkit_training::preprocessing::BatchPreprocessor;
use rlkit_training::Trainer;

use crate::environment::Environment;
use crate::policy::Policy;
use crate::replay_buffer::ReplayBuffer;
use crate::runner::run_episode;
use crate::samplers::Sampler;
use crate::scorers::Scorer;
use crate::trainer_preprocessor::ReplayTrainerPreprocessor;

/// Schedule of an online training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineTrainingOptions {
    /// Episodes to play
    pub num_episodes: usize,
    /// Per-episode step limit
    pub max_steps: Option<usize>,
    /// Replay buffer capacity
    pub replay_capacity: usize,
    /// Transitions per training batch
    pub minibatch_size: usize,
    /// Environment steps between training steps
    pub train_every_steps: usize,
    /// Transitions collected before the first training step
    pub min_replay_size: usize,
    /// Seed for replay sampling
    pub seed: Option<u64>,
}

impl Default for OnlineTrainingOptions {
    fn default() -> Self {
        Self {
            num_episodes: 100,
            max_steps: Some(500),
            replay_capacity: 100_000,
            minibatch_size: 64,
            train_every_steps: 1,
            min_replay_size: 1_000,
            seed: None,
        }
    }
}

impl OnlineTrainingOptions {
    fn validate(&self) -> Result<()> {
        if self.minibatch_size == 0 || self.train_every_steps == 0 {
            return Err(RLError::Configuration(
                "minibatch_size and train_every_steps must be positive".to_string(),
            ));
        }
        if self.minibatch_size > self.replay_capacity {
            return Err(RLError::Configuration(format!(
                "minibatch_size {} exceeds replay capacity {}",
                self.minibatch_size, self.replay_capacity
            )));
        }
        Ok(())
    }
}

/// Play `num_episodes` episodes with `policy`, training `trainer` from replay.
///
/// Every `train_every_steps` environment steps, once the buffer holds
/// `min_replay_size` transitions, one minibatch is sampled, preprocessed and
/// trained on. The policy's sampler is updated after each episode. Returns
/// the total reward of each episode.
pub async fn train_online<E, S, A, T, P>(
    env: &mut E,
    policy: &mut Policy<S, A>,
    trainer: &mut T,
    preprocessor: &ReplayTrainerPreprocessor<P>,
    options: &OnlineTrainingOptions,
) -> Result<Vec<f32>>
where
    E: Environment + ?Sized,
    S: Scorer,
    A: Sampler,
    T: Trainer,
    P: BatchPreprocessor<Output = T::Batch>,
{
    options.validate()?;
    let mut buffer = ReplayBuffer::new(options.replay_capacity)?;
    let mut rng = options
        .seed
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let warmup = options.min_replay_size.max(options.minibatch_size);
    let mut total_steps = 0_usize;
    let mut rewards = Vec::with_capacity(options.num_episodes);

    for episode in 0..options.num_episodes {
        let trajectory = run_episode(env, policy, options.max_steps, |transition| {
            buffer.push(transition.clone());
            total_steps += 1;
            if buffer.len() < warmup || total_steps % options.train_every_steps != 0 {
                return Ok(());
            }
            let Some(sampled) = buffer.sample(options.minibatch_size, &mut rng) else {
                return Ok(());
            };
            let batch = preprocessor.preprocess(&sampled)?;
            let metrics = trainer.train(batch)?;
            debug!(minibatch = trainer.minibatch(), ?metrics, "online training step");
            Ok(())
        })
        .await?;
        policy.update();

        info!(
            episode,
            reward = trajectory.total_reward,
            steps = trajectory.len(),
            minibatches = trainer.minibatch(),
            "online episode finished"
        );
        rewards.push(trajectory.total_reward);
    }
    Ok(rewards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classic::{CartPoleConfig, CartPoleEnv};
    use crate::samplers::SoftmaxActionSampler;
    use crate::scorers::DiscreteDqnScorer;
    use crate::trainer_preprocessor::{ActionColumns, TransitionEncoder};
    use rlkit_core::{NormalizationData, NormalizationParameters};
    use rlkit_training::preprocessing::{
        DiscreteDqnBatchPreprocessor, Preprocessor, PreprocessorOptions,
    };
    use rlkit_training::{
        share, Activation, DiscreteQNetwork, DqnTrainer, DqnTrainerParameters,
        FullyConnectedNetwork,
    };
    use std::collections::BTreeMap;

    fn state_preprocessor() -> Preprocessor {
        let params: BTreeMap<_, _> = (0..4)
            .map(|id| (id, NormalizationParameters::continuous(0.0, 1.0, -5.0, 5.0)))
            .collect();
        Preprocessor::new(&NormalizationData::new(params), PreprocessorOptions::default())
            .unwrap()
    }

    #[test]
    fn options_are_validated() {
        let options = OnlineTrainingOptions {
            minibatch_size: 10,
            replay_capacity: 5,
            ..OnlineTrainingOptions::default()
        };
        assert!(matches!(options.validate(), Err(RLError::Configuration(_))));
    }

    #[tokio::test]
    async fn cartpole_dqn_trains_from_replay() {
        let names = vec!["left".to_string(), "right".to_string()];
        let body = FullyConnectedNetwork::new(4, &[16], &[Activation::Relu], 2).unwrap();
        let q = share(DiscreteQNetwork::fully_connected(body, 2).unwrap());
        let mut trainer = DqnTrainer::new(
            q.clone(),
            DqnTrainerParameters {
                actions: names.clone(),
                minibatch_size: 8,
                ..DqnTrainerParameters::default()
            },
        )
        .unwrap();

        let mut policy = Policy::new(
            DiscreteDqnScorer::new(q, state_preprocessor()),
            SoftmaxActionSampler::new(1.0).unwrap(),
        );
        let preprocessor = ReplayTrainerPreprocessor::new(
            TransitionEncoder::with_sequential_ids(4, ActionColumns::Discrete(names.clone()))
                .unwrap(),
            DiscreteDqnBatchPreprocessor::new(&names, state_preprocessor()).unwrap(),
        );
        let options = OnlineTrainingOptions {
            num_episodes: 3,
            max_steps: Some(50),
            replay_capacity: 1_000,
            minibatch_size: 8,
            train_every_steps: 2,
            min_replay_size: 16,
            seed: Some(7),
        };

        let mut env = CartPoleEnv::with_seed(CartPoleConfig::default(), 21);
        let rewards = train_online(&mut env, &mut policy, &mut trainer, &preprocessor, &options)
            .await
            .unwrap();
        assert_eq!(rewards.len(), 3);
        assert!(rewards.iter().all(|r| *r >= 1.0));
        let steps: f32 = rewards.iter().sum();
        if steps >= 16.0 {
            assert!(trainer.minibatch() > 0);
        }
    }
}
