//! 백그라운드 페치 스케줄러.
//!
//! - [`FetchQueue`]: `(우선순위 내림차순, 등록 순서)` 우선순위 큐와
//!   `(resource_id, data_type)` 중복 제거
//! - [`FetchScheduler`]: 큐를 소비하는 워커 풀 (1~8개)
//!
//! 큐에 있거나 처리 중인 요청은 다시 등록되지 않습니다. 대기 중인 요청의
//! 우선순위를 올리면 새 항목을 넣고 이전 항목은 꺼낼 때 버립니다.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use feed_core::{DataType, FetchRequest, Priority};

use crate::pipeline::{FetchOutcome, FetchPipeline};

type DedupKey = (String, DataType);

/// 등록 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 새로 등록됨
    Queued,
    /// 대기 중인 요청의 우선순위가 올라감
    Raised,
    /// 이미 대기 중이거나 처리 중
    Duplicate,
}

#[derive(Debug)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    request: FetchRequest,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// 높은 우선순위 먼저, 같은 우선순위는 먼저 들어온 순서.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// 대기 중인 요청의 현재 (우선순위, seq)
    queued: HashMap<DedupKey, (Priority, u64)>,
    in_flight: HashSet<DedupKey>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, request: FetchRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued
            .insert(request.dedup_key(), (request.priority, seq));
        self.heap.push(QueueEntry {
            priority: request.priority,
            seq,
            request,
        });
    }

    fn push(&mut self, request: FetchRequest) -> EnqueueOutcome {
        let key = request.dedup_key();
        if self.in_flight.contains(&key) {
            return duplicate(&request, "in_flight");
        }

        match self.queued.get(&key) {
            Some((priority, _)) if request.priority > *priority => {
                self.insert(request);
                EnqueueOutcome::Raised
            }
            Some(_) => duplicate(&request, "queued"),
            None => {
                self.insert(request);
                EnqueueOutcome::Queued
            }
        }
    }

    fn pop(&mut self) -> Option<FetchRequest> {
        while let Some(entry) = self.heap.pop() {
            let key = entry.request.dedup_key();
            let current = matches!(self.queued.get(&key), Some((_, seq)) if *seq == entry.seq);
            if !current {
                // 우선순위 상향으로 대체된 항목
                continue;
            }
            self.queued.remove(&key);
            self.in_flight.insert(key);
            return Some(entry.request);
        }
        None
    }
}

/// 중복 키는 파라미터를 보지 않으므로 다른 파라미터 변형도 여기서 버려집니다.
fn duplicate(request: &FetchRequest, holder: &'static str) -> EnqueueOutcome {
    debug!(
        resource = %request.resource_id,
        data_type = %request.data_type,
        params = %request.params.hash(),
        holder,
        "Duplicate fetch request dropped"
    );
    EnqueueOutcome::Duplicate
}

/// 중복 제거 우선순위 큐.
#[derive(Default)]
pub struct FetchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 요청 등록.
    pub async fn push(&self, request: FetchRequest) -> EnqueueOutcome {
        let outcome = self.state.lock().await.push(request);
        if outcome != EnqueueOutcome::Duplicate {
            self.notify.notify_one();
        }
        outcome
    }

    /// 가장 높은 우선순위의 요청을 꺼내 처리 중으로 표시합니다.
    pub async fn pop(&self) -> Option<FetchRequest> {
        self.state.lock().await.pop()
    }

    /// 요청이 들어오거나 종료될 때까지 대기하며 꺼냅니다.
    ///
    /// 알림을 놓쳐도 `idle_wait`마다 큐를 다시 확인합니다.
    pub async fn next(
        &self,
        cancel: &CancellationToken,
        idle_wait: Duration,
    ) -> Option<FetchRequest> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(request) = self.pop().await {
                return Some(request);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(idle_wait) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// 처리 완료 표시.
    pub async fn complete(&self, request: &FetchRequest) {
        self.state.lock().await.in_flight.remove(&request.dedup_key());
    }

    /// 처리 중인 요청을 다시 대기열에 넣습니다.
    pub async fn requeue(&self, request: FetchRequest) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&request.dedup_key());
        let outcome = state.push(request);
        drop(state);
        if outcome != EnqueueOutcome::Duplicate {
            self.notify.notify_one();
        }
    }

    /// 대기 중인 요청 수.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 처리 중인 요청 수.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

/// 워커 풀.
pub struct FetchScheduler {
    queue: Arc<FetchQueue>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FetchScheduler {
    pub fn new(queue: Arc<FetchQueue>) -> Self {
        Self {
            queue,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<FetchQueue> {
        &self.queue
    }

    /// 워커 시작. 이미 실행 중이면 아무것도 하지 않습니다.
    pub(crate) async fn start(&self, pipeline: Arc<FetchPipeline>, worker_count: usize) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        if self.cancel.is_cancelled() {
            warn!("Scheduler already shut down, not starting workers");
            return;
        }

        for id in 0..worker_count {
            let pipeline = Arc::clone(&pipeline);
            let queue = Arc::clone(&self.queue);
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(run_worker(id, pipeline, queue, cancel)));
        }
        info!(workers = worker_count, "Fetch workers started");
    }

    /// 종료 신호를 보내고 모든 워커가 끝날 때까지 기다립니다.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Fetch worker terminated abnormally");
            }
        }
        info!("Fetch workers stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_worker(
    id: usize,
    pipeline: Arc<FetchPipeline>,
    queue: Arc<FetchQueue>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Fetch worker running");
    let idle_wait = pipeline.config.idle_wait();

    while let Some(request) = queue.next(&cancel, idle_wait).await {
        let span = feed_core::fetch_span!(
            "fetch_worker",
            request.resource_id,
            request.data_type,
            request.priority
        );
        let outcome = pipeline.process(&request, &cancel).instrument(span).await;

        match outcome {
            FetchOutcome::RateLimited if !cancel.is_cancelled() => {
                debug!(worker = id, resource = %request.resource_id, "Re-queueing after rate limit");
                queue.requeue(request).await;
            }
            FetchOutcome::Fetched(_) => {
                debug!(worker = id, resource = %request.resource_id, "데이터 수집 완료");
                queue.complete(&request).await;
            }
            _ => queue.complete(&request).await,
        }
    }

    debug!(worker = id, "Fetch worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, priority: Priority) -> FetchRequest {
        FetchRequest::new(id, DataType::Quote, priority)
    }

    #[tokio::test]
    async fn test_pops_by_priority_then_fifo() {
        let queue = FetchQueue::new();
        queue.push(request("LOW", Priority::Low)).await;
        queue.push(request("N1", Priority::Normal)).await;
        queue.push(request("CRIT", Priority::Critical)).await;
        queue.push(request("N2", Priority::Normal)).await;
        queue.push(request("HIGH", Priority::High)).await;

        let mut order = Vec::new();
        while let Some(req) = queue.pop().await {
            order.push(req.resource_id.clone());
            queue.complete(&req).await;
        }
        assert_eq!(order, vec!["CRIT", "HIGH", "N1", "N2", "LOW"]);
    }

    #[tokio::test]
    async fn test_duplicates_are_rejected_while_queued_or_in_flight() {
        let queue = FetchQueue::new();
        assert_eq!(
            queue.push(request("AAPL", Priority::Normal)).await,
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.push(request("aapl", Priority::Low)).await,
            EnqueueOutcome::Duplicate
        );

        let in_flight = queue.pop().await.unwrap();
        assert_eq!(
            queue.push(request("AAPL", Priority::Critical)).await,
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.in_flight().await, 1);

        queue.complete(&in_flight).await;
        assert_eq!(
            queue.push(request("AAPL", Priority::Normal)).await,
            EnqueueOutcome::Queued
        );
    }

    #[tokio::test]
    async fn test_raising_priority_reorders_without_duplicating() {
        let queue = FetchQueue::new();
        queue.push(request("A", Priority::Normal)).await;
        queue.push(request("B", Priority::Normal)).await;
        assert_eq!(
            queue.push(request("B", Priority::High)).await,
            EnqueueOutcome::Raised
        );
        assert_eq!(queue.len().await, 2);

        let first = queue.pop().await.unwrap();
        assert_eq!(first.resource_id, "B");
        assert_eq!(first.priority, Priority::High);

        let second = queue.pop().await.unwrap();
        assert_eq!(second.resource_id, "A");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_returns_request_to_queue() {
        let queue = FetchQueue::new();
        queue.push(request("MSFT", Priority::High)).await;
        let req = queue.pop().await.unwrap();
        assert!(queue.is_empty().await);

        queue.requeue(req).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_next_wakes_on_push_and_stops_on_cancel() {
        let queue = Arc::new(FetchQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next(&cancel, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(request("NVDA", Priority::Normal)).await;

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().resource_id, "NVDA");

        cancel.cancel();
        assert!(queue.next(&cancel, Duration::from_secs(30)).await.is_none());
    }
}
