use std::sync::Mutex;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_BATCH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SystemRecord {
    pub user_id: String,
    pub session_id: String,
    pub level: Level,
    pub message: String,
    pub source: String,
    pub tags: Vec<String>,
    pub app_name: String,
    pub app_id: String,
}

#[derive(Debug, Serialize)]
struct SystemLog<'a> {
    #[serde(rename = "TYPE")]
    kind: &'static str,
    #[serde(rename = "DATASET")]
    dataset: &'a str,
    #[serde(rename = "RECORDS")]
    records: &'a [SystemRecord],
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Collector endpoint. `None` disables shipping; records are only logged.
    pub url: Option<String>,
    pub app_name: String,
    pub app_id: String,
    pub dataset: String,
    pub timeout: Duration,
}

struct Worker {
    tx: mpsc::UnboundedSender<SystemRecord>,
    handle: JoinHandle<()>,
}

enum WorkerState {
    Idle,
    Running(Worker),
    Closed,
}

pub struct TelemetrySink {
    config: TelemetryConfig,
    state: Mutex<WorkerState>,
}

impl TelemetrySink {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WorkerState::Idle),
        }
    }

    #[cfg(test)]
    pub fn disabled(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        Self::new(TelemetryConfig {
            url: None,
            app_id: app_name.clone(),
            app_name,
            dataset: String::new(),
            timeout: Duration::from_secs(5),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.url.is_some()
    }

    /// Queues a record. Never blocks and never fails the caller.
    pub fn record(&self, level: Level, source: &str, session_id: &str, message: impl Into<String>) {
        let record = SystemRecord {
            user_id: "unknown".to_string(),
            session_id: session_id.to_string(),
            level,
            message: message.into(),
            source: source.to_string(),
            tags: vec![self.config.app_name.clone()],
            app_name: self.config.app_name.clone(),
            app_id: self.config.app_id.clone(),
        };

        let Some(url) = self.config.url.clone() else {
            debug!(source, level = ?record.level, message = %record.message, "telemetry disabled");
            return;
        };

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if matches!(*state, WorkerState::Idle) {
            *state = WorkerState::Running(spawn_worker(url, self.config.clone()));
        }
        match &*state {
            WorkerState::Running(worker) => {
                if worker.tx.send(record).is_err() {
                    warn!("telemetry worker stopped; dropping record");
                }
            }
            WorkerState::Closed => debug!("telemetry sink closed; dropping record"),
            WorkerState::Idle => {}
        }
    }

    /// Stops accepting records and waits for queued ones to be sent.
    pub async fn close(&self) {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, WorkerState::Closed),
            Err(_) => return,
        };
        if let WorkerState::Running(worker) = previous {
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "telemetry worker panicked");
            }
        }
    }
}

fn spawn_worker(url: String, config: TelemetryConfig) -> Worker {
    let (tx, mut rx) = mpsc::unbounded_channel::<SystemRecord>();
    let client = Client::builder()
        .timeout(config.timeout)
        .build()
        .unwrap_or_else(|_| Client::new());

    let handle = tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }

            let log = SystemLog {
                kind: "OB",
                dataset: &config.dataset,
                records: &batch,
            };
            match client.post(&url).json(&log).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(records = batch.len(), "shipped telemetry batch");
                }
                Ok(response) => {
                    warn!(status = %response.status(), "telemetry collector rejected batch");
                }
                Err(e) => warn!(error = %e, "failed to ship telemetry batch"),
            }
        }
    });

    Worker { tx, handle }
}
