//! CLI command implementations.

pub mod jobs;
pub mod runners;
pub mod runs;

use anyhow::{Context, Result, bail};
use hopper_core::RunnerScope;
use reqwest::{Method, RequestBuilder};
use serde_json::Value;
use url::Url;

/// Thin client over the administrative API.
pub struct Client {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl Client {
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let base = Url::parse(api_url).with_context(|| format!("invalid API URL: {}", api_url))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.get_query(path, &[]).await
    }

    /// GET with `query` appended as URL-encoded pairs.
    pub async fn get_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        send(self.request(Method::GET, path)?.query(query)).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut builder = self.request(Method::POST, path)?;
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        send(builder).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        send(self.request(Method::DELETE, path)?).await
    }
}

async fn send(builder: RequestBuilder) -> Result<Value> {
    let response = builder.send().await.context("request failed")?;
    let status = response.status();
    let bytes = response.bytes().await?;
    let body: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| body.to_string());
        bail!("{}: {}", status, message);
    }
    Ok(body)
}

/// Path prefix of a scope on the administrative API.
pub fn scope_path(scope: &RunnerScope) -> String {
    match scope {
        RunnerScope::Global => "/api/v1/global".to_string(),
        RunnerScope::Owner(id) => format!("/api/v1/owners/{}", id),
        RunnerScope::Repository(id) => format!("/api/v1/repos/{}", id),
    }
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_path() {
        assert_eq!(scope_path(&RunnerScope::Global), "/api/v1/global");
        assert_eq!(scope_path(&RunnerScope::Owner(3)), "/api/v1/owners/3");
        assert_eq!(scope_path(&RunnerScope::Repository(9)), "/api/v1/repos/9");
    }

    #[test]
    fn test_client_joins_paths() {
        let client = Client::new("http://localhost:3000", None).unwrap();
        assert_eq!(
            client.base.join("/api/v1/runs/abc").unwrap().as_str(),
            "http://localhost:3000/api/v1/runs/abc"
        );
        assert!(Client::new("not a url", None).is_err());
    }
}
