//! 프로세스 내 저장소.
//!
//! Redis가 없을 때 단일 프로세스 배포용 대체 저장소이자 L1 캐시 구현입니다.
//! 만료는 조회 시점에 지연 처리하고, 주기적으로 일괄 정리합니다.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{KvBackend, WindowAdmission};
use crate::error::Result;

/// 이 횟수의 쓰기마다 만료 항목을 정리합니다.
const PURGE_EVERY: u64 = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    windows: HashMap<String, VecDeque<i64>>,
}

impl State {
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        let expired = matches!(self.entries.get(key), Some(entry) if !entry.is_live(now));
        if expired {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn insert(&mut self, key: &str, value: &str, ttl: Duration, now: Instant) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    fn prune_window(&mut self, key: &str, now_ms: i64, window: Duration) -> &mut VecDeque<i64> {
        let floor = now_ms - window.as_millis() as i64;
        let log = self.windows.entry(key.to_string()).or_default();
        while matches!(log.front(), Some(&ts) if ts <= floor) {
            log.pop_front();
        }
        log
    }
}

/// 프로세스 내 key-value 저장소.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 (만료되지 않은) 키 수.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn maybe_purge(&self, state: &mut State, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == 0 {
            state.entries.retain(|_, entry| entry.is_live(now));
            state.windows.retain(|_, log| !log.is_empty());
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.insert(key, value, ttl, now);
        self.maybe_purge(&mut state, now);
        Ok(())
    }

    async fn set_many_ex(&self, entries: &[(String, String, Duration)]) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for (key, value, ttl) in entries {
            state.insert(key, value, *ttl, now);
        }
        self.maybe_purge(&mut state, now);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.insert(key, value, ttl, now);
        self.maybe_purge(&mut state, now);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let existed = state.live(key, now).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let owned = state
            .live(key, now)
            .is_some_and(|entry| entry.value == expected);
        if owned {
            state.entries.remove(key);
        }
        Ok(owned)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let owned = state
            .live(key, now)
            .is_some_and(|entry| entry.value == expected);
        if owned {
            state.insert(key, expected, ttl, now);
        }
        Ok(owned)
    }

    async fn del_prefix(&self, prefix: &str, except_suffixes: &[&str]) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut deleted = 0;
        state.entries.retain(|key, entry| {
            if key.starts_with(prefix) && !except_suffixes.iter().any(|s| key.ends_with(s)) {
                if entry.is_live(now) {
                    deleted += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        Ok(state
            .live(key, now)
            .map(|entry| entry.expires_at.saturating_duration_since(now)))
    }

    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u32,
    ) -> Result<WindowAdmission> {
        let mut state = self.state.lock().await;
        let log = state.prune_window(key, now_ms, window);

        let admitted = (log.len() as u32) < limit;
        if admitted {
            log.push_back(now_ms);
        }

        Ok(WindowAdmission {
            admitted,
            count: log.len() as u32,
            oldest_ms: log.front().copied(),
        })
    }

    async fn window_peek(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> Result<WindowAdmission> {
        let mut state = self.state.lock().await;
        let log = state.prune_window(key, now_ms, window);
        Ok(WindowAdmission {
            admitted: false,
            count: log.len() as u32,
            oldest_ms: log.front().copied(),
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
