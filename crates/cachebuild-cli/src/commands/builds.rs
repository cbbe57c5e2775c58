//! Build commands.

use anyhow::{Context, Result};
use cachebuild_core::session::{FinalStatus, SessionMessage};
use futures::StreamExt;
use reqwest::Method;
use serde::Deserialize;

use crate::client::ApiClient;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    run_id: i64,
}

#[derive(Debug, Deserialize)]
struct KillResponse {
    killed: Vec<i64>,
}

pub async fn trigger(client: &ApiClient, config_id: i64, follow: bool) -> Result<()> {
    let response: TriggerResponse = client
        .send_json(client.request(Method::POST, &format!("/builds/{}", config_id))?)
        .await?;
    println!("Queued run {} of configuration {}", response.run_id, config_id);

    if follow {
        logs(client, response.run_id, false).await?;
    }
    Ok(())
}

pub async fn kill(client: &ApiClient, config_id: i64) -> Result<()> {
    let response: KillResponse = client
        .send_json(client.request(Method::DELETE, &format!("/builds/{}", config_id))?)
        .await?;
    for run_id in response.killed {
        println!("Killed run {}", run_id);
    }
    Ok(())
}

pub async fn logs(client: &ApiClient, run_id: i64, raw: bool) -> Result<()> {
    let response = client
        .send(client.request(Method::GET, &format!("/builds/{}/stream", run_id))?)
        .await?;

    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("reading build output")?;
        for line in lines.push(&chunk) {
            print_message(&line, raw);
        }
    }
    if let Some(line) = lines.finish() {
        print_message(&line, raw);
    }
    Ok(())
}

fn print_message(line: &str, raw: bool) {
    if raw {
        println!("{}", line);
    } else if let Some(text) = render(line) {
        println!("{}", text);
    }
}

/// Human-readable form of one session message.
fn render(line: &str) -> Option<String> {
    let Ok(message) = SessionMessage::parse(line) else {
        return Some(line.to_string());
    };
    match message {
        SessionMessage::Output { line } => Some(line),
        SessionMessage::InitialState { lines } if lines.is_empty() => None,
        SessionMessage::InitialState { lines } => Some(lines.join("\n")),
        SessionMessage::StatusUpdate { status, revision } => Some(match revision {
            Some(revision) => format!("==> {} ({})", status, revision),
            None => format!("==> {}", status),
        }),
        SessionMessage::Final { status, durations } => {
            let outcome = match status {
                FinalStatus::Success => "succeeded",
                FinalStatus::Failure => "failed",
            };
            Some(format!(
                "==> build {} in {:.1}s (fetch {:.1}s, build {:.1}s, push {:.1}s)",
                outcome,
                durations.total_ms as f64 / 1000.0,
                durations.fetch_ms as f64 / 1000.0,
                durations.build_ms as f64 / 1000.0,
                durations.push_ms as f64 / 1000.0,
            ))
        }
    }
}

/// Splits a byte stream into newline-terminated lines.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let text = text.trim_end_matches('\r');
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}
