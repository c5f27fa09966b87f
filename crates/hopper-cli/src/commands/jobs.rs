//! Job commands.

use anyhow::Result;
use hopper_core::RunnerScope;

use super::{Client, field, scope_path};

pub async fn pending(client: &Client, scope: RunnerScope, labels: &[String]) -> Result<()> {
    let path = format!("{}/jobs", scope_path(&scope));
    let jobs = client.get_query(&path, &label_query(labels)).await?;
    let jobs = jobs.as_array().cloned().unwrap_or_default();
    if jobs.is_empty() {
        println!("No pending jobs");
        return Ok(());
    }
    println!("{:<38} {:<8} {:<24} GROUP", "ID", "REPO", "NAME");
    for job in &jobs {
        println!(
            "{:<38} {:<8} {:<24} {}",
            field(job, "id"),
            job["repo_id"],
            field(job, "name"),
            field(job, "concurrency_group")
        );
    }
    Ok(())
}

fn label_query(labels: &[String]) -> Vec<(&'static str, String)> {
    if labels.is_empty() {
        return Vec::new();
    }
    vec![("labels", labels.join(","))]
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    fn pending_url(labels: &[&str]) -> String {
        let client = Client::new("http://localhost:3000", None).unwrap();
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        client
            .request(Method::GET, "/api/v1/repos/9/jobs")
            .unwrap()
            .query(&label_query(&labels))
            .build()
            .unwrap()
            .url()
            .to_string()
    }

    #[test]
    fn test_labels_are_url_encoded() {
        let url = pending_url(&["gpu #1&x", "a+b"]);
        assert_eq!(
            url,
            "http://localhost:3000/api/v1/repos/9/jobs?labels=gpu+%231%26x%2Ca%2Bb"
        );

        let parsed = url::Url::parse(&url).unwrap();
        let labels: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(labels, vec![("labels".to_string(), "gpu #1&x,a+b".to_string())]);
    }

    #[test]
    fn test_no_labels_leaves_query_empty() {
        assert_eq!(pending_url(&[]), "http://localhost:3000/api/v1/repos/9/jobs");
    }
}
