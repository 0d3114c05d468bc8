//! Sandboxed function execution collaborator
//!
//! `$function` bodies never run in this process. The host supplies a worker
//! loader: `loader.get(name, code).get_entrypoint().fetch(request)` runs one
//! batch of calls inside an isolated worker built from `code`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::SandboxConfig;
use crate::ExecuteError;

/// Module source and settings for a worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCode {
    pub compatibility_date: String,
    pub main_module: String,
    /// `(file name, source)` pairs; `main_module` names one of them
    pub modules: Vec<(String, String)>,
}

impl WorkerCode {
    const MAIN_MODULE: &'static str = "function.js";

    /// Worker that applies `body` to every argument tuple of a request
    pub fn for_function(body: &str, config: &SandboxConfig) -> Self {
        let source = format!(
            r#"const fn = ({body});

export default {{
  async fetch(request) {{
    try {{
      const {{ argsArray }} = await request.json();
      const results = [];
      for (const args of argsArray) {{
        results.push(await fn(...args));
      }}
      return Response.json({{ results }});
    }} catch (err) {{
      return Response.json({{ error: String(err && err.message ? err.message : err) }}, {{ status: 500 }});
    }}
  }}
}};
"#,
            body = body
        );
        Self {
            compatibility_date: config.compatibility_date.clone(),
            main_module: Self::MAIN_MODULE.to_string(),
            modules: vec![(Self::MAIN_MODULE.to_string(), source)],
        }
    }
}

/// Worker name for a function body: same body, same worker
pub fn worker_name(prefix: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{}{:x}", prefix, hasher.finalize())
}

/// Batch request: one argument tuple per call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub args_array: Vec<Vec<Value>>,
}

/// Worker reply, `{results}` or `{error}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BatchResponse {
    Results { results: Vec<Value> },
    Error { error: String },
}

impl BatchResponse {
    /// Results for a batch of `expected` calls, in call order
    pub fn into_results(self, expected: usize) -> Result<Vec<Value>, ExecuteError> {
        match self {
            BatchResponse::Results { results } if results.len() == expected => Ok(results),
            BatchResponse::Results { results } => Err(ExecuteError::BatchExecutionFailed(format!(
                "expected {} results, worker returned {}",
                expected,
                results.len()
            ))),
            BatchResponse::Error { error } => Err(ExecuteError::BatchExecutionFailed(error)),
        }
    }
}

/// HTTP-shaped request delivered to a worker entrypoint
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub method: String,
    pub body: String,
}

impl WorkerRequest {
    pub fn post(body: String) -> Self {
        Self {
            method: "POST".to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait WorkerEntrypoint: Send + Sync {
    async fn fetch(&self, request: WorkerRequest) -> Result<WorkerResponse, ExecuteError>;
}

pub trait WorkerStub: Send + Sync {
    fn get_entrypoint(&self) -> Arc<dyn WorkerEntrypoint>;
}

pub trait WorkerLoader: Send + Sync {
    /// Worker named `name`, created from `code` when not already loaded
    fn get(&self, name: &str, code: WorkerCode) -> Arc<dyn WorkerStub>;
}
