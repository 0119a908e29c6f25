//! 무효 리소스 레지스트리.
//!
//! 상장 폐지 등으로 영구히 조회할 수 없는 리소스 ID 집합입니다. 항목은 자동으로
//! 만료되지 않으며 운영자가 명시적으로 제거해야 합니다.
//!
//! 파일 형식은 정렬된 JSON 문자열 배열입니다. 여러 프로세스가 같은 파일을
//! 쓸 수 있으므로 변경은 `<파일>.lock`의 배타 잠금 안에서 디스크 내용을 다시
//! 읽고 병합한 뒤 기록합니다. 메모리 미러는 변경 시점의 병합 결과와 명시적인
//! [`reload`](InvalidResourceRegistry::reload) 때만 갱신됩니다.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use feed_core::normalize_resource_id;

use crate::error::{CacheError, Result};

/// 레지스트리 변경.
#[derive(Debug, Clone)]
enum Change {
    Add(String),
    Remove(String),
}

impl Change {
    /// 집합에 적용. 실제로 바뀌었으면 `true`.
    fn apply(&self, entries: &mut HashSet<String>) -> bool {
        match self {
            Change::Add(id) => entries.insert(id.clone()),
            Change::Remove(id) => entries.remove(id),
        }
    }
}

/// 무효 리소스 레지스트리.
pub struct InvalidResourceRegistry {
    path: Option<PathBuf>,
    entries: RwLock<HashSet<String>>,
}

impl InvalidResourceRegistry {
    /// 메모리 전용 레지스트리.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(HashSet::new()),
        }
    }

    /// 파일 기반 레지스트리. 파일이 없으면 빈 집합으로 시작합니다.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = read_file(&path).await?;
        info!(path = %path.display(), count = entries.len(), "Invalid resource registry loaded");

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// 설정 경로가 있으면 파일 기반, 없으면 메모리 전용.
    pub async fn from_path(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::open(path).await,
            None => Ok(Self::in_memory()),
        }
    }

    pub async fn contains(&self, resource_id: &str) -> bool {
        self.entries
            .read()
            .await
            .contains(&normalize_resource_id(resource_id))
    }

    /// 리소스 등록. 새로 추가되었으면 `true`.
    pub async fn add(&self, resource_id: &str) -> Result<bool> {
        let id = normalize_resource_id(resource_id);
        if self.contains(&id).await {
            return Ok(false);
        }

        let added = self.apply(Change::Add(id.clone())).await?;
        if added {
            warn!(resource = %id, "Resource marked permanently invalid");
        }
        Ok(added)
    }

    /// 등록 해제 (운영자 작업). 제거되었으면 `true`.
    pub async fn remove(&self, resource_id: &str) -> Result<bool> {
        let id = normalize_resource_id(resource_id);
        let removed = self.apply(Change::Remove(id.clone())).await?;
        if removed {
            info!(resource = %id, "Resource removed from invalid registry");
        }
        Ok(removed)
    }

    /// 정렬된 목록.
    pub async fn list(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 파일에서 메모리 미러를 다시 읽습니다.
    ///
    /// 다른 프로세스가 수정한 내용을 반영할 때 사용합니다.
    pub async fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.len().await);
        };

        let fresh = read_file(path).await?;
        let count = fresh.len();
        *self.entries.write().await = fresh;
        debug!(path = %path.display(), count, "Invalid resource registry reloaded");
        Ok(count)
    }

    /// 변경 적용. 파일 기반이면 잠금 안에서 디스크 내용과 병합 후 기록하고
    /// 미러를 병합 결과로 교체합니다.
    async fn apply(&self, change: Change) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let Some(path) = self.path.clone() else {
            return Ok(change.apply(&mut entries));
        };

        let (changed, merged) = tokio::task::spawn_blocking(move || apply_locked(&path, &change))
            .await
            .map_err(|e| CacheError::Io(format!("registry write task failed: {e}")))??;
        *entries = merged;
        Ok(changed)
    }
}

/// 배타 파일 잠금 안에서 읽기-병합-쓰기.
///
/// 쓰기는 임시 파일에 한 뒤 이름을 바꿔 원자적으로 교체하므로 잠금 없이
/// 읽는 쪽도 항상 완전한 파일을 봅니다.
fn apply_locked(path: &Path, change: &Change) -> Result<(bool, HashSet<String>)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path.with_extension("json.lock"))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.write()?;

    let mut entries = match std::fs::read_to_string(path) {
        Ok(raw) => parse(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
        Err(e) => return Err(e.into()),
    };

    let changed = change.apply(&mut entries);
    if changed {
        let sorted: BTreeSet<&String> = entries.iter().collect();
        let json = serde_json::to_string_pretty(&sorted)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
    }
    Ok((changed, entries))
}

async fn read_file(path: &Path) -> Result<HashSet<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => parse(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e.into()),
    }
}

fn parse(raw: &str) -> Result<HashSet<String>> {
    if raw.trim().is_empty() {
        return Ok(HashSet::new());
    }
    let ids: Vec<String> = serde_json::from_str(raw)?;
    Ok(ids.iter().map(|id| normalize_resource_id(id)).collect())
}
