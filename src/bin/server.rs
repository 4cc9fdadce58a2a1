//! RFT 서버 - Reliable Fragment Transfer
//!
//! 클라이언트가 올린 파일을 `<이름>_copy<확장자>`로 저장하고
//! 같은 클라이언트에 되돌려 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin rft-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 포트(9000)에서 ./storage에 저장
//!   cargo run --release --bin rft-server -- --dir storage
//!
//!   # 손실 많은 링크, 지수 백오프
//!   cargo run --release --bin rft-server -- -p 9100 --retries 12 --backoff exponential --idle 30000

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rft::{Config, FileStore, Server};

/// 서버 실행 옵션
struct ServerOptions {
    bind_ip: IpAddr,
    dir: PathBuf,
    config: Config,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dir: PathBuf::from("storage"),
            config: Config::default(),
        }
    }
}

fn print_help() {
    println!(
        r#"RFT Server - Reliable Fragment Transfer 서버

UDP 위의 ACK 확인형 파일 에코 서버
- 받은 파일을 새 이름으로 저장 후 클라이언트에 에코
- 프래그먼트별 ACK + NACK 재요청 + 재전송 예산

사용법:
  cargo run --release --bin rft-server -- [OPTIONS]

옵션:
  -b, --bind <IP>         바인드 IP (기본: 0.0.0.0)
  -p, --port <PORT>       수신 포트 (기본: 9000)
  -d, --dir <PATH>        저장 디렉터리 (기본: storage)
  --suffix <TEXT>         저장 파일명 접미사 (기본: _copy)
  --retries <N>           프래그먼트당 최대 재전송 횟수 (기본: 5, 0 = 재전송 없음)
  --timeout <MS>          재전송 타임아웃 밀리초 (기본: 200)
  --backoff <MODE>        fixed | exponential (기본: fixed)
  --idle <MS>             수신 대기 최대 시간 밀리초 (기본: 5000, 재전송 기간 이상)
  --mtu <SIZE>            최대 데이터그램 크기, 헤더 포함 (기본: 1024)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#
    );
}

fn parse_args() -> Result<ServerOptions, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ServerOptions::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind" | "-b", Some(value)) => {
                options.bind_ip = value.parse()?;
                i += 1;
            }
            ("--port" | "-p", Some(value)) => {
                options.config.listen_port = value.parse()?;
                i += 1;
            }
            ("--dir" | "-d", Some(value)) => {
                options.dir = PathBuf::from(value);
                i += 1;
            }
            ("--suffix", Some(value)) => {
                options.config.copy_suffix = value.clone();
                i += 1;
            }
            ("--retries", Some(value)) => {
                options.config.max_retries = value.parse()?;
                i += 1;
            }
            ("--timeout", Some(value)) => {
                options.config.retransmit_timeout_ms = value.parse()?;
                i += 1;
            }
            ("--idle", Some(value)) => {
                options.config.idle_timeout_ms = value.parse()?;
                i += 1;
            }
            ("--backoff", Some(value)) => {
                options.config.backoff = value.parse()?;
                i += 1;
            }
            ("--mtu", Some(value)) => {
                options.config.max_datagram_size = value.parse()?;
                i += 1;
            }
            ("--help" | "-h", _) => {
                print_help();
                std::process::exit(0);
            }
            (other, _) => {
                return Err(format!("알 수 없는 인자 또는 값 누락: {other}").into());
            }
        }
        i += 1;
    }

    options.config.validate()?;
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = parse_args()?;
    let config = options.config;
    let bind_addr = SocketAddr::new(options.bind_ip, config.listen_port);

    info!("RFT Server starting...");
    info!("Bind address: {}", bind_addr);
    info!("Storage directory: {:?}", options.dir);
    info!(
        "Datagram size: {} bytes (fragment {} bytes)",
        config.max_datagram_size,
        config.fragment_size()
    );
    info!(
        "Retransmit: {} retries, {} ms, {:?} backoff",
        config.max_retries, config.retransmit_timeout_ms, config.backoff
    );

    let socket = UdpSocket::bind(bind_addr).await?;
    let server = Server::new(config, Arc::new(socket), FileStore::new(options.dir))?;
    let handle = server.handle();

    // Ctrl-C로 정지
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal_handle.stop();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await?;

    let stats = handle.stats();
    info!("Server stopped");
    info!("  Files stored: {}", stats.files_stored);
    info!(
        "  Inbound: {} completed, {} failed",
        stats.inbound_completed, stats.inbound_failed
    );
    info!(
        "  Outbound: {} completed, {} failed",
        stats.outbound_completed, stats.outbound_failed
    );
    info!("  Malformed frames: {}", stats.malformed_frames);

    Ok(())
}
