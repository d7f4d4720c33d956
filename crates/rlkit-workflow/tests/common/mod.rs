//! Synthetic training tables shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;

use rlkit_core::{RawAction, RawFeatures, TransitionRow};
use rlkit_workflow::InMemoryDataFetcher;

pub const ACTIONS: [&str; 4] = ["up", "down", "left", "right"];
pub const ACTION_FEATURE: i64 = 100;

pub fn action_names() -> Vec<String> {
    ACTIONS.iter().map(|a| (*a).to_string()).collect()
}

#[allow(clippy::cast_precision_loss)]
fn state(step: usize) -> RawFeatures {
    let x = step as f32;
    RawFeatures::from([
        (1, (x * 0.37).sin() * 2.0),
        (2, (x * 0.11).cos() * 5.0 + 1.0),
        (3, x * 0.5 - 10.0),
    ])
}

fn discrete_action(episode: usize, seq: usize) -> RawAction {
    RawAction::Discrete(ACTIONS[(episode + seq) % ACTIONS.len()].to_string())
}

#[allow(clippy::cast_precision_loss)]
fn continuous_action(episode: usize, seq: usize) -> RawAction {
    let value = ((episode * 7 + seq) % 9) as f32 / 4.0 - 1.0;
    RawAction::Continuous(RawFeatures::from([(ACTION_FEATURE, value)]))
}

fn rows(
    num_episodes: usize,
    episode_len: usize,
    action: fn(usize, usize) -> RawAction,
) -> Vec<TransitionRow> {
    let mut rows = Vec::new();
    for episode in 0..num_episodes {
        for seq in 0..episode_len {
            let step = episode * episode_len + seq;
            let terminal = seq + 1 == episode_len;
            let taken = action(episode, seq);
            let reward = match &taken {
                RawAction::Discrete(name) if name == "right" => 1.0,
                RawAction::Continuous(features) => -features[&ACTION_FEATURE].abs(),
                RawAction::Discrete(_) => 0.0,
            };
            rows.push(TransitionRow {
                mdp_id: format!("episode-{episode}"),
                sequence_number: i64::try_from(seq).unwrap(),
                state_features: state(step),
                action: taken,
                action_probability: 0.25,
                reward,
                next_state_features: state(step + 1),
                next_action: if terminal {
                    RawAction::none()
                } else {
                    action(episode, seq + 1)
                },
                possible_next_actions: Vec::new(),
                terminal,
                metrics: HashMap::from([("clicks".to_string(), reward * 2.0)]),
                step: 1,
            });
        }
    }
    rows
}

/// Four named actions, three float state features
pub fn discrete_fetcher(table: &str) -> InMemoryDataFetcher {
    let mut fetcher = InMemoryDataFetcher::new();
    fetcher.insert_table(table, rows(12, 8, discrete_action));
    fetcher
}

/// One continuous action feature, three float state features
pub fn continuous_fetcher(table: &str) -> InMemoryDataFetcher {
    let mut fetcher = InMemoryDataFetcher::new();
    fetcher.insert_table(table, rows(12, 8, continuous_action));
    fetcher
}
