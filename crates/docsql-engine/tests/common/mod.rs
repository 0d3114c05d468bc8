//! In-memory collaborators shared by the executor tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docsql_engine::{
    BatchRequest, ExecuteError, Row, SqlExecutor, SqlParam, SqlResult, WorkerCode,
    WorkerEntrypoint, WorkerLoader, WorkerRequest, WorkerResponse, WorkerStub,
};
use serde_json::{json, Value};

/// Answers every statement with the same rows and records what it ran
pub struct FakeSql {
    rows: Vec<Row>,
    pub statements: Mutex<Vec<(String, Vec<SqlParam>)>>,
}

impl FakeSql {
    pub fn new(documents: &[Value]) -> Arc<Self> {
        Arc::new(Self {
            rows: documents.iter().map(|doc| Row::new(doc.to_string())).collect(),
            statements: Mutex::new(Vec::new()),
        })
    }

    pub fn raw(rows: Vec<Row>) -> Arc<Self> {
        Arc::new(Self {
            rows,
            statements: Mutex::new(Vec::new()),
        })
    }

    pub fn statement_count(&self) -> usize {
        self.statements.lock().unwrap().len()
    }
}

#[async_trait]
impl SqlExecutor for FakeSql {
    async fn exec(&self, sql: &str, params: &[SqlParam]) -> Result<SqlResult, ExecuteError> {
        self.statements
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(SqlResult::Results(self.rows.clone()))
    }
}

type Handler = dyn Fn(&[Value]) -> Value + Send + Sync;

/// Sandbox that evaluates calls with a Rust closure instead of JavaScript
pub struct FakeLoader {
    handler: Arc<Handler>,
    failure: Option<String>,
    pub loads: Mutex<Vec<(String, WorkerCode)>>,
    pub requests: Arc<Mutex<Vec<BatchRequest>>>,
}

impl FakeLoader {
    pub fn new(handler: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            failure: None,
            loads: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(|_: &[Value]| Value::Null),
            failure: Some(message.to_string()),
            loads: Mutex::new(Vec::new()),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn requests(&self) -> Vec<BatchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl WorkerLoader for FakeLoader {
    fn get(&self, name: &str, code: WorkerCode) -> Arc<dyn WorkerStub> {
        self.loads.lock().unwrap().push((name.to_string(), code));
        Arc::new(FakeWorker {
            handler: self.handler.clone(),
            failure: self.failure.clone(),
            requests: self.requests.clone(),
        })
    }
}

struct FakeWorker {
    handler: Arc<Handler>,
    failure: Option<String>,
    requests: Arc<Mutex<Vec<BatchRequest>>>,
}

impl WorkerStub for FakeWorker {
    fn get_entrypoint(&self) -> Arc<dyn WorkerEntrypoint> {
        Arc::new(FakeWorker {
            handler: self.handler.clone(),
            failure: self.failure.clone(),
            requests: self.requests.clone(),
        })
    }
}

#[async_trait]
impl WorkerEntrypoint for FakeWorker {
    async fn fetch(&self, request: WorkerRequest) -> Result<WorkerResponse, ExecuteError> {
        assert_eq!(request.method, "POST");
        let batch: BatchRequest = serde_json::from_str(&request.body).unwrap();
        self.requests.lock().unwrap().push(batch.clone());

        let body = match &self.failure {
            Some(message) => json!({ "error": message }),
            None => {
                let results: Vec<Value> = batch
                    .args_array
                    .iter()
                    .map(|args| (self.handler)(args))
                    .collect();
                json!({ "results": results })
            }
        };
        Ok(WorkerResponse {
            status: if self.failure.is_some() { 500 } else { 200 },
            body: body.to_string(),
        })
    }
}
