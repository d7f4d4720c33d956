//! Classic control environments

use async_trait::async_trait;
use ndarray::{arr1, Array1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rlkit_core::{ActionSpace, RLError, Result};
use rlkit_training::preprocessing::argmax;

use crate::environment::{Environment, Step};

/// CartPole environment
pub struct CartPoleEnv {
    /// Current state
    state: CartPoleState,
    /// Configuration
    config: CartPoleConfig,
    /// Step count
    steps: usize,
    rng: StdRng,
}

#[derive(Debug, Clone)]
struct CartPoleState {
    x: f64,          // Cart position
    x_dot: f64,      // Cart velocity
    theta: f64,      // Pole angle
    theta_dot: f64,  // Pole angular velocity
}

/// Physical constants and limits of [`CartPoleEnv`]
#[derive(Debug, Clone)]
pub struct CartPoleConfig {
    /// Gravitational acceleration
    pub gravity: f64,
    /// Mass of the cart
    pub mass_cart: f64,
    /// Mass of the pole
    pub mass_pole: f64,
    /// Half the pole length
    pub length: f64,
    /// Force applied per push
    pub force_mag: f64,
    /// Steps before truncation
    pub max_steps: usize,
    /// Cart position limit
    pub x_threshold: f64,
    /// Pole angle limit in radians
    pub theta_threshold: f64,
}

impl Default for CartPoleConfig {
    fn default() -> Self {
        Self {
            gravity: 9.8,
            mass_cart: 1.0,
            mass_pole: 0.1,
            length: 0.5,
            force_mag: 10.0,
            max_steps: 500,
            x_threshold: 2.4,
            theta_threshold: 0.209, // ~12 degrees
        }
    }
}

impl CartPoleEnv {
    /// Create a new CartPole environment
    #[must_use]
    pub fn new(config: CartPoleConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create an environment with reproducible resets
    #[must_use]
    pub fn with_seed(config: CartPoleConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: CartPoleConfig, rng: StdRng) -> Self {
        Self {
            state: CartPoleState {
                x: 0.0,
                x_dot: 0.0,
                theta: 0.0,
                theta_dot: 0.0,
            },
            config,
            steps: 0,
            rng,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn observation(&self) -> Array1<f32> {
        arr1(&[
            self.state.x as f32,
            self.state.x_dot as f32,
            self.state.theta as f32,
            self.state.theta_dot as f32,
        ])
    }

    fn is_terminal(&self) -> bool {
        self.state.x.abs() > self.config.x_threshold
            || self.state.theta.abs() > self.config.theta_threshold
    }
}

impl Default for CartPoleEnv {
    fn default() -> Self {
        Self::new(CartPoleConfig::default())
    }
}

#[async_trait]
impl Environment for CartPoleEnv {
    fn action_space(&self) -> ActionSpace {
        ActionSpace::discrete(2) // 0: push left, 1: push right
    }

    fn observation_dim(&self) -> usize {
        4
    }

    async fn reset(&mut self) -> Result<Array1<f32>> {
        let rng = &mut self.rng;
        self.state = CartPoleState {
            x: rng.gen_range(-0.05..0.05),
            x_dot: rng.gen_range(-0.05..0.05),
            theta: rng.gen_range(-0.05..0.05),
            theta_dot: rng.gen_range(-0.05..0.05),
        };
        self.steps = 0;
        Ok(self.observation())
    }

    async fn step(&mut self, action: &Array1<f32>) -> Result<Step> {
        if action.len() != 2 {
            return Err(RLError::InvalidAction(format!(
                "CartPole expects a one-hot action of width 2, got {}",
                action.len()
            )));
        }
        let force = if argmax(action.view()) == 1 {
            self.config.force_mag
        } else {
            -self.config.force_mag
        };

        let cos_theta = self.state.theta.cos();
        let sin_theta = self.state.theta.sin();

        let total_mass = self.config.mass_cart + self.config.mass_pole;
        let pole_mass_length = self.config.mass_pole * self.config.length;

        let temp =
            (force + pole_mass_length * self.state.theta_dot.powi(2) * sin_theta) / total_mass;
        let theta_acc = (self.config.gravity * sin_theta - cos_theta * temp)
            / (self.config.length
                * (4.0 / 3.0 - self.config.mass_pole * cos_theta.powi(2) / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        let dt = 0.02;
        self.state.x += dt * self.state.x_dot;
        self.state.x_dot += dt * x_acc;
        self.state.theta += dt * self.state.theta_dot;
        self.state.theta_dot += dt * theta_acc;

        self.steps += 1;

        let terminal = self.is_terminal();
        Ok(Step {
            observation: self.observation(),
            reward: 1.0, // one per step survived
            terminal,
            truncated: !terminal && self.steps >= self.config.max_steps,
        })
    }
}

/// Continuous Mountain Car environment
pub struct MountainCarContinuousEnv {
    position: f64,
    velocity: f64,
    config: MountainCarConfig,
    steps: usize,
    rng: StdRng,
}

/// Track and engine constants of [`MountainCarContinuousEnv`]
#[derive(Debug, Clone)]
pub struct MountainCarConfig {
    /// Left end of the track
    pub min_position: f64,
    /// Right end of the track
    pub max_position: f64,
    /// Speed limit in either direction
    pub max_speed: f64,
    /// Position that ends the episode
    pub goal_position: f64,
    /// Minimum velocity at the goal
    pub goal_velocity: f64,
    /// Engine power per unit of action
    pub power: f64,
    /// Gravity along the track
    pub gravity: f64,
    /// Steps before truncation
    pub max_steps: usize,
}

impl Default for MountainCarConfig {
    fn default() -> Self {
        Self {
            min_position: -1.2,
            max_position: 0.6,
            max_speed: 0.07,
            goal_position: 0.45,
            goal_velocity: 0.0,
            power: 0.0015,
            gravity: 0.0025,
            max_steps: 999,
        }
    }
}

impl MountainCarContinuousEnv {
    /// Create a new Mountain Car environment
    #[must_use]
    pub fn new(config: MountainCarConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create an environment with reproducible resets
    #[must_use]
    pub fn with_seed(config: MountainCarConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: MountainCarConfig, rng: StdRng) -> Self {
        Self {
            position: -0.5,
            velocity: 0.0,
            config,
            steps: 0,
            rng,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn observation(&self) -> Array1<f32> {
        arr1(&[self.position as f32, self.velocity as f32])
    }
}

impl Default for MountainCarContinuousEnv {
    fn default() -> Self {
        Self::new(MountainCarConfig::default())
    }
}

#[async_trait]
impl Environment for MountainCarContinuousEnv {
    fn action_space(&self) -> ActionSpace {
        ActionSpace::ContinuousBox {
            low: vec![-1.0],
            high: vec![1.0],
            shape: vec![1],
        }
    }

    fn observation_dim(&self) -> usize {
        2
    }

    async fn reset(&mut self) -> Result<Array1<f32>> {
        self.position = self.rng.gen_range(-0.6..-0.4);
        self.velocity = 0.0;
        self.steps = 0;
        Ok(self.observation())
    }

    async fn step(&mut self, action: &Array1<f32>) -> Result<Step> {
        let Some(&raw) = action.iter().next().filter(|_| action.len() == 1) else {
            return Err(RLError::InvalidAction(format!(
                "MountainCar expects a scalar action, got width {}",
                action.len()
            )));
        };
        if raw.is_nan() {
            return Err(RLError::InvalidAction("action is NaN".to_string()));
        }
        // out-of-range engine commands saturate
        let force = f64::from(raw).clamp(-1.0, 1.0);

        let c = &self.config;
        self.velocity += force * c.power - c.gravity * (3.0 * self.position).cos();
        self.velocity = self.velocity.clamp(-c.max_speed, c.max_speed);
        self.position = (self.position + self.velocity).clamp(c.min_position, c.max_position);
        if self.position <= c.min_position && self.velocity < 0.0 {
            self.velocity = 0.0;
        }

        self.steps += 1;

        let terminal = self.position >= c.goal_position && self.velocity >= c.goal_velocity;
        let mut reward = -0.1 * force * force;
        if terminal {
            reward += 100.0;
        }
        #[allow(clippy::cast_possible_truncation)]
        let reward = reward as f32;
        Ok(Step {
            observation: self.observation(),
            reward,
            terminal,
            truncated: !terminal && self.steps >= c.max_steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cartpole_falls_under_constant_push() {
        let mut env = CartPoleEnv::with_seed(CartPoleConfig::default(), 3);
        let obs = env.reset().await.unwrap();
        assert_eq!(obs.len(), env.observation_dim());

        let push_right = arr1(&[0.0, 1.0]);
        let mut steps = 0;
        loop {
            let step = env.step(&push_right).await.unwrap();
            steps += 1;
            assert!((step.reward - 1.0).abs() < f32::EPSILON);
            if step.done() {
                assert!(step.terminal);
                break;
            }
        }
        assert!(steps < 100);
    }

    #[tokio::test]
    async fn cartpole_rejects_wrong_action_width() {
        let mut env = CartPoleEnv::with_seed(CartPoleConfig::default(), 0);
        env.reset().await.unwrap();
        assert!(matches!(
            env.step(&arr1(&[1.0])).await,
            Err(RLError::InvalidAction(_))
        ));
    }

    #[tokio::test]
    async fn mountain_car_truncates_and_penalises_effort() {
        let config = MountainCarConfig {
            max_steps: 5,
            ..MountainCarConfig::default()
        };
        let mut env = MountainCarContinuousEnv::with_seed(config, 11);
        env.reset().await.unwrap();
        let mut last = None;
        for _ in 0..5 {
            last = Some(env.step(&arr1(&[2.0])).await.unwrap());
        }
        let step = last.unwrap();
        assert!(step.truncated);
        assert!(!step.terminal);
        assert!((step.reward + 0.1).abs() < 1e-6);
    }
}
