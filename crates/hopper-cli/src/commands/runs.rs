//! Run, trust and log commands.

use anyhow::Result;
use hopper_core::TrustUpdate;
use serde_json::{Value, json};

use super::{Client, field};

fn print_run(body: &Value) {
    let run = &body["run"];
    println!("Run {}", field(run, "id"));
    println!("  repo:     {}", run["repo_id"]);
    println!("  workflow: {}", field(run, "workflow_id"));
    println!("  event:    {}", field(run, "event"));
    println!("  status:   {}", field(run, "status"));
    if run["need_approval"].as_bool().unwrap_or(false) {
        println!("  awaiting approval");
    }
    println!();
    println!("{:<38} {:<24} STATUS", "JOB", "NAME");
    for job in body["jobs"].as_array().into_iter().flatten() {
        println!(
            "{:<38} {:<24} {}",
            field(job, "id"),
            field(job, "name"),
            field(job, "status")
        );
    }
}

pub async fn show(client: &Client, id: &str) -> Result<()> {
    let body = client.get(&format!("/api/v1/runs/{}", id)).await?;
    print_run(&body);
    Ok(())
}

pub async fn cancel(client: &Client, id: &str) -> Result<()> {
    let body = client
        .post(&format!("/api/v1/runs/{}/cancel", id), None)
        .await?;
    print_run(&body);
    Ok(())
}

pub async fn trust(client: &Client, id: &str, decision: TrustUpdate, doer: i64) -> Result<()> {
    let body = client
        .post(
            &format!("/api/v1/runs/{}/trust", id),
            Some(json!({ "doer_id": doer, "decision": decision })),
        )
        .await?;
    print_run(&body);
    Ok(())
}

pub async fn logs(client: &Client, task: &str, offset: i64, limit: i64) -> Result<()> {
    let body = client
        .get(&format!(
            "/api/v1/tasks/{}/logs?offset={}&limit={}",
            task, offset, limit
        ))
        .await?;
    for row in body["rows"].as_array().into_iter().flatten() {
        println!("{} {}", field(row, "timestamp"), field(row, "content"));
    }
    if !body["closed"].as_bool().unwrap_or(false) {
        eprintln!("(log still open, {} rows stored)", body["log_length"]);
    }
    Ok(())
}
