//! Example: offline DQN on logged random CartPole episodes

use rlkit_core::FeatureId;
use rlkit_gym::{
    evaluate_for_n_episodes, run_episode, ActionColumns, CartPoleConfig, CartPoleEnv,
    DiscreteRandomPolicy, Environment as _, TransitionEncoder,
};
use rlkit_workflow::{train_workflow, InMemoryDataFetcher, RlTrainingReport, WorkflowConfig};

const TABLE: &str = "cartpole_random";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut env = CartPoleEnv::with_seed(CartPoleConfig::default(), 7);
    let policy = DiscreteRandomPolicy::create_for_env(&env.action_space())?;
    let state_ids: Vec<FeatureId> = (1..=4).collect();
    let encoder = TransitionEncoder::new(
        state_ids,
        ActionColumns::Discrete(vec!["left".to_string(), "right".to_string()]),
    )?;

    // Log random episodes, one mdp per episode
    let mut rows = Vec::new();
    for _ in 0..200 {
        let trajectory = run_episode(&mut env, &policy, Some(200), |_| Ok(())).await?;
        for (seq, transition) in (0_i64..).zip(&trajectory.transitions) {
            let mut row = encoder.encode(transition, seq)?;
            row.mdp_id.clone_from(&trajectory.episode_id);
            rows.push(row);
        }
    }
    println!("Logged {} transitions", rows.len());

    let mut fetcher = InMemoryDataFetcher::new();
    fetcher.insert_table(TABLE, rows);

    let config = WorkflowConfig::from_json_str(&format!(
        r#"{{
            "model": {{
                "DiscreteDQN": {{
                    "trainer_param": {{
                        "actions": ["left", "right"],
                        "minibatch_size": 256,
                        "rl": {{"gamma": 0.99, "target_update_rate": 0.01}}
                    }},
                    "net_builder": {{"FullyConnected": {{"sizes": [64, 64], "activations": ["relu", "relu"]}}}}
                }}
            }},
            "input_table_spec": {{"table_name": "{TABLE}"}},
            "num_train_epochs": 10,
            "train_sample_range": [0.0, 90.0],
            "eval_sample_range": [90.0, 100.0]
        }}"#
    ))?;
    let mut trained = train_workflow(&config, &fetcher)?;

    if let Some(RlTrainingReport::DiscreteDqn(report)) = &trained.output.training_report {
        println!(
            "Trained {} minibatches over {} epochs",
            report.summary.num_minibatches, report.summary.num_epochs
        );
        for (action, share) in &report.action_distribution {
            println!("  {action}: {share:.2}");
        }
    }

    // Evaluate the serving policy
    let serving = trained.manager.create_policy(true)?;
    let rewards = evaluate_for_n_episodes(&mut env, &serving, 10, Some(500)).await?;
    let avg_reward = rewards.iter().sum::<f32>() / rewards.len() as f32;
    println!("\nAverage Reward over {} episodes: {:.2}", rewards.len(), avg_reward);

    Ok(())
}
