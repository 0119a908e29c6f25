//! Market feed cache CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use feed_cache::Coordinator;
use feed_collector::{watchlist, CollectorError};
use feed_core::{init_logging, AppConfig, DataType, FetchParams, LogConfig, LogFormat, Priority};

#[derive(Parser)]
#[command(name = "feed-collector")]
#[command(about = "Market feed cache coordinator CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    /// 로그 레벨 재정의 (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// 로그 형식 재정의 (pretty, json, compact)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// 단일 리소스 조회
    Get {
        symbol: String,

        #[arg(long, short = 't', default_value = "quote")]
        data_type: DataType,

        /// 요청 파라미터 (key=value, 반복 가능)
        #[arg(long = "param", short = 'p', value_parser = watchlist::parse_param)]
        params: Vec<(String, String)>,

        /// 캐시 미스 시 기다리지 않고 백그라운드 로딩만 등록
        #[arg(long)]
        no_wait: bool,
    },

    /// 다건 조회 (쉼표로 구분, 예: "AAPL,MSFT")
    Batch {
        symbols: String,

        #[arg(long, short = 't', default_value = "quote")]
        data_type: DataType,

        #[arg(long = "param", short = 'p', value_parser = watchlist::parse_param)]
        params: Vec<(String, String)>,
    },

    /// 백그라운드 프리페치 후 완료까지 대기
    Prefetch {
        symbols: String,

        #[arg(long, short = 't', default_value = "quote")]
        data_type: DataType,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// 최대 대기 시간 (초)
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// 리소스의 모든 캐시 항목 삭제
    Invalidate {
        symbol: String,

        #[arg(long, short = 't', default_value = "quote")]
        data_type: DataType,
    },

    /// 무효 리소스 레지스트리 관리
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// 저장소/limiter/큐 상태 점검
    Health,

    /// 데몬 모드: 관심 종목을 주기적으로 프리페치
    Daemon,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// 무효 리소스 등록
    Add { symbol: String },
    /// 무효 리소스 해제
    Remove { symbol: String },
    /// 등록된 리소스 목록
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)?;

    let mut log_config = LogConfig::from(&config.logging);
    if let Some(level) = &cli.log_level {
        log_config.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    init_logging(log_config)?;

    tracing::info!(config = %cli.config.display(), "Market feed collector 시작");

    let coordinator = Coordinator::from_app_config(&config).await?;

    match cli.command {
        Commands::Get {
            symbol,
            data_type,
            params,
            no_wait,
        } => {
            let params: FetchParams = params.into_iter().collect();
            let lookup = coordinator.get(&symbol, data_type, &params, !no_wait).await;
            print_json(&lookup)?;
        }
        Commands::Batch {
            symbols,
            data_type,
            params,
        } => {
            let symbols = parse_symbols(&symbols)?;
            let params: FetchParams = params.into_iter().collect();
            let (stats, results) = watchlist::warm(&coordinator, &symbols, data_type, &params).await;
            stats.log_summary("배치 조회");
            print_json(&results)?;
        }
        Commands::Prefetch {
            symbols,
            data_type,
            priority,
            timeout_secs,
        } => {
            let symbols = parse_symbols(&symbols)?;
            let stats = watchlist::prefetch_all(&coordinator, &symbols, &[data_type], priority).await;
            stats.log_summary("프리페치 등록");

            coordinator.start().await;
            if !coordinator.wait_idle(Duration::from_secs(timeout_secs)).await {
                tracing::warn!(
                    remaining = coordinator.queued().await,
                    "Prefetch timed out, pending requests dropped"
                );
            }
        }
        Commands::Invalidate { symbol, data_type } => {
            let deleted = coordinator.invalidate_key(&symbol, data_type).await?;
            println!("{deleted}");
        }
        Commands::Registry { action } => match action {
            RegistryAction::Add { symbol } => {
                let added = coordinator.registry().add(&symbol).await?;
                if added {
                    for data_type in DataType::all() {
                        coordinator.invalidate_key(&symbol, data_type).await?;
                    }
                }
                print_json(&added)?;
            }
            RegistryAction::Remove { symbol } => {
                print_json(&coordinator.registry().remove(&symbol).await?)?;
            }
            RegistryAction::List => {
                print_json(&coordinator.registry().list().await)?;
            }
        },
        Commands::Health => {
            let report = coordinator.health_check().await;
            print_json(&report)?;
            if !report.backend_ok {
                anyhow::bail!("backend {} is not reachable", report.backend);
            }
        }
        Commands::Daemon => run_daemon(&coordinator, &config).await,
    }

    coordinator.shutdown().await;
    tracing::info!("Market feed collector 종료");

    Ok(())
}

async fn run_daemon(coordinator: &Coordinator, config: &AppConfig) {
    let watch = &config.watchlist;
    tracing::info!(
        symbols = watch.symbols.len(),
        interval_secs = watch.interval_secs,
        "=== 데몬 모드 시작 ==="
    );

    coordinator.start().await;

    let mut interval = tokio::time::interval(watch.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("종료 신호 수신, 데몬 종료 중...");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = coordinator.registry().reload().await {
                    tracing::error!("레지스트리 재로드 실패: {}", e);
                }

                let stats = watchlist::refresh_watchlist(coordinator, watch).await;
                stats.log_summary("관심 종목 프리페치");
                coordinator.stats().log_summary("daemon");
            }
        }
    }
}

fn parse_symbols(raw: &str) -> Result<Vec<String>, CollectorError> {
    let symbols = watchlist::parse_symbols(raw);
    if symbols.is_empty() {
        return Err(CollectorError::InvalidArgument(
            "at least one symbol is required".to_string(),
        ));
    }
    Ok(symbols)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CollectorError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
