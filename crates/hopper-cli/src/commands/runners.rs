//! Runner and registration token commands.

use anyhow::Result;
use hopper_core::RunnerScope;

use super::{Client, field, print_json, scope_path};

pub async fn list(client: &Client, scope: RunnerScope) -> Result<()> {
    let runners = client
        .get(&format!("{}/runners", scope_path(&scope)))
        .await?;
    let runners = runners.as_array().cloned().unwrap_or_default();
    if runners.is_empty() {
        println!("No runners registered in {}", scope);
        return Ok(());
    }
    println!("{:<38} {:<24} {:<8} LABELS", "ID", "NAME", "STATUS");
    for runner in &runners {
        let labels: Vec<&str> = runner["labels"]
            .as_array()
            .map(|l| l.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        println!(
            "{:<38} {:<24} {:<8} {}",
            field(runner, "id"),
            field(runner, "name"),
            field(runner, "status"),
            labels.join(",")
        );
    }
    Ok(())
}

pub async fn show(client: &Client, scope: RunnerScope, id: &str) -> Result<()> {
    let runner = client
        .get(&format!("{}/runners/{}", scope_path(&scope), id))
        .await?;
    print_json(&runner)
}

pub async fn delete(client: &Client, scope: RunnerScope, id: &str) -> Result<()> {
    client
        .delete(&format!("{}/runners/{}", scope_path(&scope), id))
        .await?;
    println!("Deleted runner {}", id);
    Ok(())
}

pub async fn create_token(client: &Client, scope: RunnerScope) -> Result<()> {
    let issued = client
        .post(&format!("{}/registration-token", scope_path(&scope)), None)
        .await?;
    println!("{}", field(&issued, "token"));
    Ok(())
}
