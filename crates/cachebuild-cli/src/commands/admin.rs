//! Administrative commands.

use anyhow::Result;
use reqwest::Method;
use serde::Deserialize;

use crate::client::ApiClient;

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    configurations: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    max_concurrency: usize,
    configurations: usize,
    workers: Vec<Worker>,
    queued: Vec<QueuedRun>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Worker {
    run_id: i64,
    config_id: i64,
    state: String,
    started_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedRun {
    run_id: i64,
    config_id: i64,
}

pub async fn refresh(client: &ApiClient) -> Result<()> {
    let response: RefreshResponse = client
        .send_json(client.request(Method::POST, "/refresh")?)
        .await?;
    println!("Loaded {} build configurations", response.configurations);
    Ok(())
}

pub async fn status(client: &ApiClient) -> Result<()> {
    let status: Status = client
        .send_json(client.request(Method::GET, "/status")?)
        .await?;

    println!(
        "{} configurations, {}/{} workers busy, {} queued",
        status.configurations,
        status.workers.len(),
        status.max_concurrency,
        status.queued.len()
    );
    if !status.workers.is_empty() {
        println!();
        println!("{:<10} {:<10} {:<14} STARTED", "RUN", "CONFIG", "STATE");
        for w in &status.workers {
            println!(
                "{:<10} {:<10} {:<14} {}",
                w.run_id, w.config_id, w.state, w.started_at
            );
        }
    }
    if !status.queued.is_empty() {
        println!();
        println!("{:<10} CONFIG", "QUEUED");
        for q in &status.queued {
            println!("{:<10} {}", q.run_id, q.config_id);
        }
    }
    Ok(())
}
