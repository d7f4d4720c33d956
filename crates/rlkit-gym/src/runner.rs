//! Episode rollouts

use ndarray::{Array1, Array2, Axis};
use tracing::{debug, info};
use uuid::Uuid;

use rlkit_core::{FeatureData, RLError, Result, Trajectory, Transition};

use crate::environment::Environment;
use crate::policy::Policy;
use crate::samplers::Sampler;
use crate::scorers::Scorer;

/// Roll out one episode, calling `post_step` after every environment step.
///
/// The episode ends on a terminal or truncated step, or after `max_steps`
/// steps when given. An error from the environment, the policy or the hook
/// aborts the episode.
pub async fn run_episode<E, S, A, F>(
    env: &mut E,
    policy: &Policy<S, A>,
    max_steps: Option<usize>,
    mut post_step: F,
) -> Result<Trajectory>
where
    E: Environment + ?Sized,
    S: Scorer,
    A: Sampler,
    F: FnMut(&Transition) -> Result<()>,
{
    let mut trajectory = Trajectory::new(Uuid::new_v4().to_string());
    let mut observation = env.reset().await?;
    let limit = max_steps.unwrap_or(usize::MAX);

    while trajectory.len() < limit {
        let batch = observation.clone().insert_axis(Axis(0));
        let output = policy.act(&FeatureData::from_batch(batch))?;
        let action = first_row(&output.action)?;
        let step = env.step(&action).await?;

        let transition = Transition {
            observation: observation.to_vec(),
            action,
            reward: step.reward,
            next_observation: step.observation.to_vec(),
            terminal: step.terminal,
            log_prob: output.log_prob.first().copied().unwrap_or(0.0),
        };
        post_step(&transition)?;
        trajectory.push(transition);

        if step.done() {
            break;
        }
        observation = step.observation;
    }

    debug!(
        episode_id = %trajectory.episode_id,
        steps = trajectory.len(),
        total_reward = trajectory.total_reward,
        "episode finished"
    );
    Ok(trajectory)
}

fn first_row(action: &Array2<f32>) -> Result<Array1<f32>> {
    if action.nrows() != 1 {
        return Err(RLError::DimensionMismatch {
            expected: 1,
            actual: action.nrows(),
        });
    }
    Ok(action.row(0).to_owned())
}

/// Total reward of each of `n` episodes
pub async fn evaluate_for_n_episodes<E, S, A>(
    env: &mut E,
    policy: &Policy<S, A>,
    n: usize,
    max_steps: Option<usize>,
) -> Result<Vec<f32>>
where
    E: Environment + ?Sized,
    S: Scorer,
    A: Sampler,
{
    let mut rewards = Vec::with_capacity(n);
    for _ in 0..n {
        let trajectory = run_episode(env, policy, max_steps, |_| Ok(())).await?;
        rewards.push(trajectory.total_reward);
    }
    if !rewards.is_empty() {
        #[allow(clippy::cast_precision_loss)]
        let mean = rewards.iter().sum::<f32>() / rewards.len() as f32;
        info!(episodes = n, mean_reward = mean, "evaluation finished");
    }
    Ok(rewards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classic::{CartPoleConfig, CartPoleEnv, MountainCarConfig, MountainCarContinuousEnv};
    use crate::policy::{ContinuousRandomPolicy, DiscreteRandomPolicy};
    use rlkit_core::{ActionSpace, ContinuousActionRange};

    #[tokio::test]
    async fn random_cartpole_episode_ends_and_calls_hook() {
        let mut env = CartPoleEnv::with_seed(CartPoleConfig::default(), 5);
        let policy = DiscreteRandomPolicy::create_for_env(&env.action_space()).unwrap();
        let mut hook_calls = 0;
        let trajectory = run_episode(&mut env, &policy, Some(200), |t| {
            assert_eq!(t.action.len(), 2);
            hook_calls += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(hook_calls, trajectory.len());
        assert!(!trajectory.is_empty());
        assert!(trajectory.len() <= 200);
        assert!(Uuid::parse_str(&trajectory.episode_id).is_ok());
    }

    #[tokio::test]
    async fn hook_error_aborts_the_episode() {
        let mut env = CartPoleEnv::with_seed(CartPoleConfig::default(), 1);
        let policy = DiscreteRandomPolicy::with_num_actions(2).unwrap();
        let result = run_episode(&mut env, &policy, None, |_| {
            Err(RLError::Environment("stop".to_string()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn max_steps_bounds_the_episode() {
        let mut env = MountainCarContinuousEnv::with_seed(MountainCarConfig::default(), 2);
        let space = ActionSpace::continuous(vec![-1.0], vec![1.0]).unwrap();
        let policy =
            ContinuousRandomPolicy::create_for_env(&space, ContinuousActionRange::default())
                .unwrap();
        let rewards = evaluate_for_n_episodes(&mut env, &policy, 3, Some(10))
            .await
            .unwrap();
        assert_eq!(rewards.len(), 3);
        assert!(rewards.iter().all(|r| *r <= 0.0));
    }
}
