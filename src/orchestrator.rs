//! Multi-tenant task queue: per-exchange concurrency semaphores, task-state
//! table, exchange-client instance pooling (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::ingestor::ExchangeIngestor;
use crate::manifest::Manifest;
use crate::market_client::MarketClient;
use crate::verify::{VerifyStatus, verify_integrity};
use crate::writer::PartitionWriter;

/// Which series a submitted task should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Raw,
    Funding,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// §3.3 — one row per `(exchange, market, symbol, data_type)` key. Never
/// GC'd implicitly: callers read it to report progress.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub message: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub data_kind: DataKind,
}

/// A request to submit. `full_history`, when set, forces `start_date=None`
/// so the ingestor probes for the earliest candle rather than resuming
/// from a caller-supplied date.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub exchange: String,
    pub market: String,
    pub symbol: String,
    pub timeframe: String,
    pub data_kind: DataKind,
    pub start_date: Option<String>,
    pub full_history: bool,
}

fn task_key(exchange: &str, market: &str, symbol: &str, data_kind: DataKind) -> String {
    let kind = match data_kind {
        DataKind::Raw => "raw",
        DataKind::Funding => "funding",
        DataKind::Both => "both",
    };
    format!("{exchange}:{market}:{symbol}:{kind}")
}

fn derivative_flavored(market: &str) -> bool {
    let m = market.to_lowercase();
    ["future", "swap", "linear", "inverse", "derivative"]
        .iter()
        .any(|kw| m.contains(kw))
}

struct SharedState<C: MarketClient> {
    tasks: HashMap<String, TaskRecord>,
    exchange_cache: HashMap<(String, String), Arc<C>>,
    exchange_semaphores: HashMap<String, Arc<Semaphore>>,
}

/// Factory for a `MarketClient` bound to one `(exchange, market)`. The
/// orchestrator calls this exactly once per cache entry, under the lock
/// (§4.5.2 step 4).
pub trait ClientFactory<C: MarketClient>: Send + Sync {
    fn build(&self, exchange: &str, market: &str) -> Arc<C>;
}

impl<C, F> ClientFactory<C> for F
where
    C: MarketClient,
    F: Fn(&str, &str) -> Arc<C> + Send + Sync,
{
    fn build(&self, exchange: &str, market: &str) -> Arc<C> {
        self(exchange, market)
    }
}

/// The task-queue, semaphore-map, and client-cache component of §4.5.
pub struct DownloadOrchestrator<C: MarketClient + 'static> {
    state: Arc<Mutex<SharedState<C>>>,
    manifest: Manifest,
    writer: Arc<PartitionWriter>,
    factory: Arc<dyn ClientFactory<C>>,
    per_exchange_concurrency: usize,
}

impl<C: MarketClient + 'static> Clone for DownloadOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            manifest: self.manifest.clone(),
            writer: self.writer.clone(),
            factory: self.factory.clone(),
            per_exchange_concurrency: self.per_exchange_concurrency,
        }
    }
}

impl<C: MarketClient + 'static> DownloadOrchestrator<C> {
    pub fn new(
        manifest: Manifest,
        writer: Arc<PartitionWriter>,
        factory: Arc<dyn ClientFactory<C>>,
        per_exchange_concurrency: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState {
                tasks: HashMap::new(),
                exchange_cache: HashMap::new(),
                exchange_semaphores: HashMap::new(),
            })),
            manifest,
            writer,
            factory,
            per_exchange_concurrency,
        }
    }

    /// §4.5.1 — dedup at submit: if the key is already pending/running,
    /// return without enqueuing a second worker (T7).
    pub async fn submit(&self, req: DownloadRequest) {
        let key = task_key(&req.exchange, &req.market, &req.symbol, req.data_kind);
        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.tasks.get(&key) {
                if matches!(existing.status, TaskStatus::Pending | TaskStatus::Running) {
                    return;
                }
            }
            state.tasks.insert(
                key.clone(),
                TaskRecord {
                    status: TaskStatus::Pending,
                    message: "queued".to_string(),
                    start_time: chrono::Utc::now(),
                    exchange: req.exchange.clone(),
                    market: req.market.clone(),
                    symbol: req.symbol.clone(),
                    data_kind: req.data_kind,
                },
            );
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_job(key, req).await;
        });
    }

    /// Current status of a task, by key, for progress reporting.
    pub async fn status(&self, exchange: &str, market: &str, symbol: &str, data_kind: DataKind) -> Option<TaskRecord> {
        let key = task_key(exchange, market, symbol, data_kind);
        self.state.lock().await.tasks.get(&key).cloned()
    }

    async fn set_status(&self, key: &str, status: TaskStatus, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(key) {
            task.status = status;
            task.message = message.into();
        }
    }

    async fn semaphore_for(&self, exchange: &str) -> Arc<Semaphore> {
        let mut state = self.state.lock().await;
        state
            .exchange_semaphores
            .entry(exchange.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_exchange_concurrency)))
            .clone()
    }

    async fn client_for(&self, exchange: &str, market: &str) -> Arc<C> {
        let mut state = self.state.lock().await;
        let key = (exchange.to_string(), market.to_string());
        if let Some(client) = state.exchange_cache.get(&key) {
            return client.clone();
        }
        let client = self.factory.build(exchange, market);
        state.exchange_cache.insert(key, client.clone());
        client
    }

    /// §4.5.2 — the full worker job lifecycle, including the finalizer
    /// that forces a still-`running` task to `failed` (step 10).
    async fn run_job(&self, key: String, req: DownloadRequest) {
        self.set_status(&key, TaskStatus::Pending, "waiting for exchange slot").await;

        let semaphore = self.semaphore_for(&req.exchange).await;
        let _permit = semaphore.acquire().await.expect("semaphore never closed");

        self.set_status(&key, TaskStatus::Running, "fetching data").await;

        let outcome = self.execute(&req).await;

        match outcome {
            Ok(()) => {
                let report = verify_integrity(
                    &self.manifest,
                    &req.exchange,
                    &req.symbol,
                    Some(&req.market),
                    &req.timeframe,
                );
                match report {
                    Ok(r) if r.status == VerifyStatus::Success => {
                        self.set_status(&key, TaskStatus::Completed, "finished (verified)").await;
                    }
                    Ok(r) if r.status == VerifyStatus::Warning => {
                        warn!(exchange = %req.exchange, symbol = %req.symbol, message = %r.message, "integrity warning");
                        self.set_status(&key, TaskStatus::Completed, format!("finished: {}", r.message)).await;
                    }
                    Ok(r) => {
                        warn!(exchange = %req.exchange, symbol = %req.symbol, message = %r.message, "no files found to verify");
                        self.set_status(&key, TaskStatus::Completed, r.message).await;
                    }
                    Err(e) => {
                        error!(exchange = %req.exchange, symbol = %req.symbol, error = %e, "verification error");
                        self.set_status(&key, TaskStatus::Completed, format!("verification error: {e}")).await;
                    }
                }
            }
            Err(e) => {
                self.set_status(&key, TaskStatus::Failed, e.to_string()).await;
            }
        }

        // Finalizer: if something above left us stuck in Running (e.g. a
        // panic caught by the spawn boundary elsewhere), force failed.
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&key) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Failed;
                task.message = "terminated unexpectedly".to_string();
            }
        }
    }

    async fn execute(&self, req: &DownloadRequest) -> Result<()> {
        let client = self.client_for(&req.exchange, &req.market).await;
        let ingestor = ExchangeIngestor::new(
            client,
            self.writer.clone(),
            self.manifest.clone(),
            req.exchange.clone(),
            req.market.clone(),
        );

        let start_date = if req.full_history { None } else { req.start_date.as_deref() };

        if matches!(req.data_kind, DataKind::Raw | DataKind::Both) {
            ingestor
                .download_ohlcv(&req.symbol, &req.timeframe, start_date, None)
                .await?;
        }

        if matches!(req.data_kind, DataKind::Funding | DataKind::Both) && derivative_flavored(&req.market) {
            ingestor.download_funding(&req.symbol).await?;
        }

        info!(exchange = %req.exchange, symbol = %req.symbol, market = %req.market, "job executed");
        Ok(())
    }
}
