//! 업스트림 데이터 소스 어댑터.
//!
//! 데이터 유형마다 하나의 [`SourceAdapter`]가 등록됩니다. 어댑터는 실제
//! 네트워크 호출과 실패 분류만 담당하고, 재시도/냉각/캐싱은 코디네이터가
//! 결정합니다.

use async_trait::async_trait;
use feed_core::{normalize_resource_id, DataType, FetchParams, ProviderConfig};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::SourceError;

/// 어댑터 결과 타입.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// 배치 호출의 리소스별 결과 (키: 정규화된 리소스 ID).
pub type BatchResult = HashMap<String, SourceResult<Value>>;

/// 업스트림 데이터 소스.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// 어댑터 이름 (로깅용).
    fn name(&self) -> &str;

    /// 담당 데이터 유형.
    fn data_type(&self) -> DataType;

    /// 단일 리소스 조회.
    async fn fetch(&self, resource_id: &str, params: &FetchParams) -> SourceResult<Value>;

    /// 다중 리소스 요청을 한 번의 업스트림 호출로 처리할 수 있는지 여부.
    fn supports_batch(&self) -> bool {
        false
    }

    /// 다중 리소스 조회.
    ///
    /// 외부 `Err`는 호출 전체의 실패(예: 429)를 뜻합니다. 기본 구현은 리소스마다
    /// [`fetch`](Self::fetch)를 호출하며, rate limit 신호를 받으면 남은 리소스를
    /// 모두 같은 에러로 표시하고 멈춥니다.
    async fn fetch_batch(
        &self,
        resource_ids: &[String],
        params: &FetchParams,
    ) -> SourceResult<BatchResult> {
        let mut results = BatchResult::with_capacity(resource_ids.len());
        let mut throttled: Option<SourceError> = None;

        for id in resource_ids {
            if let Some(err) = &throttled {
                results.insert(id.clone(), Err(err.clone()));
                continue;
            }
            let result = self.fetch(id, params).await;
            if let Err(err @ SourceError::RateLimited { .. }) = &result {
                throttled = Some(err.clone());
            }
            results.insert(id.clone(), result);
        }

        Ok(results)
    }

    /// 내부 세션 재생성. 냉각 진입 시 호출됩니다.
    async fn reset(&self) {}
}

/// HTTP JSON provider 어댑터.
///
/// URL 템플릿의 `{symbol}`은 리소스 ID로, `{symbols}`는 쉼표로 구분한 목록으로,
/// `{이름}`은 같은 이름의 파라미터로 치환됩니다. 템플릿에 없는 파라미터는
/// 쿼리 문자열로 붙습니다.
///
/// 배치 응답은 리소스 ID를 키로 하는 JSON 객체여야 합니다.
pub struct HttpSourceAdapter {
    data_type: DataType,
    config: ProviderConfig,
    client: RwLock<Client>,
}

impl HttpSourceAdapter {
    pub fn new(data_type: DataType, config: ProviderConfig) -> SourceResult<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            data_type,
            config,
            client: RwLock::new(client),
        })
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        resource: &str,
    ) -> SourceResult<Value> {
        let client = self.client.read().await.clone();
        let response = client.get(url).query(query).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            return Ok(serde_json::from_str(&body)?);
        }

        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, resource, message))
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    #[instrument(skip(self, params), fields(provider = %self.config.name))]
    async fn fetch(&self, resource_id: &str, params: &FetchParams) -> SourceResult<Value> {
        let (url, query) = render(&self.config.url_template, "symbol", resource_id, params);
        debug!(url = %url, "Upstream request");
        self.get_json(&url, &query, resource_id).await
    }

    fn supports_batch(&self) -> bool {
        self.config.batch_url_template.is_some()
    }

    #[instrument(skip(self, resource_ids, params), fields(provider = %self.config.name, count = resource_ids.len()))]
    async fn fetch_batch(
        &self,
        resource_ids: &[String],
        params: &FetchParams,
    ) -> SourceResult<BatchResult> {
        let Some(template) = &self.config.batch_url_template else {
            // 배치 템플릿이 없으면 단건 호출로 처리
            let mut results = BatchResult::with_capacity(resource_ids.len());
            for id in resource_ids {
                results.insert(id.clone(), self.fetch(id, params).await);
            }
            return Ok(results);
        };

        let joined = resource_ids.join(",");
        let (url, query) = render(template, "symbols", &joined, params);
        let body = self.get_json(&url, &query, &joined).await?;

        let Value::Object(map) = body else {
            return Err(SourceError::Parse(
                "batch response must be a JSON object keyed by resource id".to_string(),
            ));
        };

        let mut by_id: HashMap<String, Value> = map
            .into_iter()
            .map(|(k, v)| (normalize_resource_id(&k), v))
            .collect();

        Ok(resource_ids
            .iter()
            .map(|id| {
                let result = match by_id.remove(&normalize_resource_id(id)) {
                    Some(Value::Null) | None => Err(SourceError::NotFound(id.clone())),
                    Some(value) => Ok(value),
                };
                (id.clone(), result)
            })
            .collect())
    }

    async fn reset(&self) {
        match build_client(&self.config) {
            Ok(client) => {
                *self.client.write().await = client;
                info!(provider = %self.config.name, "HTTP 세션 재생성");
            }
            Err(e) => {
                warn!(provider = %self.config.name, error = %e, "HTTP client rebuild failed");
            }
        }
    }
}

fn build_client(config: &ProviderConfig) -> SourceResult<Client> {
    Client::builder()
        .timeout(config.timeout())
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| SourceError::Unknown(format!("failed to build HTTP client: {}", e)))
}

/// 템플릿 치환. 템플릿에서 쓰이지 않은 파라미터는 쿼리로 반환합니다.
fn render<'a>(
    template: &str,
    placeholder: &str,
    value: &str,
    params: &'a FetchParams,
) -> (String, Vec<(&'a str, &'a str)>) {
    let mut url = template.replace(&format!("{{{}}}", placeholder), value);
    let mut query = Vec::new();

    for (key, param) in params.iter() {
        let token = format!("{{{}}}", key);
        if url.contains(&token) {
            url = url.replace(&token, param);
        } else {
            query.push((key, param));
        }
    }

    (url, query)
}

/// HTTP 상태 코드 분류.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    resource: &str,
    message: String,
) -> SourceError {
    match status.as_u16() {
        429 => SourceError::RateLimited { retry_after },
        404 | 410 => SourceError::NotFound(resource.to_string()),
        code @ 500..=599 => SourceError::Server {
            status: code,
            message,
        },
        code => SourceError::Unexpected {
            status: code,
            message,
        },
    }
}

/// `Retry-After` 헤더 (초 단위만 지원).
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use serde_json::json;

    fn provider(server: &mockito::Server, batch: bool) -> ProviderConfig {
        ProviderConfig {
            name: "mock".to_string(),
            url_template: format!("{}/quote/{{symbol}}", server.url()),
            batch_url_template: batch.then(|| format!("{}/quotes?symbols={{symbols}}", server.url())),
            timeout_ms: 2_000,
            user_agent: "feed-test".to_string(),
        }
    }

    #[test]
    fn test_render_substitutes_and_collects_query() {
        let params = FetchParams::new().with("period", "1y").with("interval", "1d");
        let (url, query) = render(
            "https://api.example.com/history/{symbol}?range={period}",
            "symbol",
            "AAPL",
            &params,
        );
        assert_eq!(url, "https://api.example.com/history/AAPL?range=1y");
        assert_eq!(query, vec![("interval", "1d")]);
    }

    #[test]
    fn test_classify_status() {
        let classes = [
            (429, FailureClass::RateLimited),
            (404, FailureClass::PermanentlyInvalid),
            (410, FailureClass::PermanentlyInvalid),
            (500, FailureClass::Transient),
            (503, FailureClass::Transient),
            (400, FailureClass::Unknown),
            (401, FailureClass::Unknown),
        ];
        for (code, expected) in classes {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status(status, None, "AAPL", String::new());
            assert_eq!(err.classify(), expected, "status {}", code);
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/quote/AAPL")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"symbol":"AAPL","price":187.5}"#)
            .create_async()
            .await;

        let adapter = HttpSourceAdapter::new(DataType::Quote, provider(&server, false)).unwrap();
        let value = adapter.fetch("AAPL", &FetchParams::new()).await.unwrap();

        assert_eq!(value, json!({"symbol": "AAPL", "price": 187.5}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_rate_limited_reads_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote/AAPL")
            .with_status(429)
            .with_header("retry-after", "30")
            .create_async()
            .await;

        let adapter = HttpSourceAdapter::new(DataType::Quote, provider(&server, false)).unwrap();
        let err = adapter.fetch("AAPL", &FetchParams::new()).await.unwrap_err();

        assert_eq!(err.classify(), FailureClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote/DELISTED")
            .with_status(404)
            .create_async()
            .await;

        let adapter = HttpSourceAdapter::new(DataType::Quote, provider(&server, false)).unwrap();
        let err = adapter
            .fetch("DELISTED", &FetchParams::new())
            .await
            .unwrap_err();
        assert_eq!(err.classify(), FailureClass::PermanentlyInvalid);
    }

    #[tokio::test]
    async fn test_malformed_body_is_unknown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote/AAPL")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let adapter = HttpSourceAdapter::new(DataType::Quote, provider(&server, false)).unwrap();
        let err = adapter.fetch("AAPL", &FetchParams::new()).await.unwrap_err();
        assert_eq!(err.classify(), FailureClass::Unknown);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let config = ProviderConfig {
            name: "offline".to_string(),
            url_template: "http://127.0.0.1:1/quote/{symbol}".to_string(),
            batch_url_template: None,
            timeout_ms: 1_000,
            user_agent: "feed-test".to_string(),
        };
        let adapter = HttpSourceAdapter::new(DataType::Quote, config).unwrap();
        let err = adapter.fetch("AAPL", &FetchParams::new()).await.unwrap_err();
        assert_eq!(err.classify(), FailureClass::Transient);
    }

    #[tokio::test]
    async fn test_batch_maps_missing_ids_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quotes")
            .match_query(mockito::Matcher::UrlEncoded(
                "symbols".into(),
                "AAPL,MSFT,GONE".into(),
            ))
            .with_status(200)
            .with_body(r#"{"aapl": {"price": 1}, "MSFT": {"price": 2}}"#)
            .create_async()
            .await;

        let adapter = HttpSourceAdapter::new(DataType::Quote, provider(&server, true)).unwrap();
        assert!(adapter.supports_batch());

        let ids = vec!["AAPL".to_string(), "MSFT".to_string(), "GONE".to_string()];
        let results = adapter.fetch_batch(&ids, &FetchParams::new()).await.unwrap();

        assert_eq!(results["AAPL"].as_ref().unwrap(), &json!({"price": 1}));
        assert_eq!(results["MSFT"].as_ref().unwrap(), &json!({"price": 2}));
        assert_eq!(
            results["GONE"].as_ref().unwrap_err().classify(),
            FailureClass::PermanentlyInvalid
        );
    }

    #[tokio::test]
    async fn test_reset_keeps_adapter_usable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/quote/MSFT")
            .with_status(200)
            .with_body(r#"{"price": 410}"#)
            .expect(2)
            .create_async()
            .await;

        let adapter = HttpSourceAdapter::new(DataType::Quote, provider(&server, false)).unwrap();
        adapter.fetch("MSFT", &FetchParams::new()).await.unwrap();
        adapter.reset().await;
        adapter.fetch("MSFT", &FetchParams::new()).await.unwrap();

        mock.assert_async().await;
    }
}
