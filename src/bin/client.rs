//! RFT 클라이언트 - Reliable Fragment Transfer
//!
//! 파일을 서버에 올리고 서버가 되돌려 준 에코를 `received_<이름>`으로 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin rft-client -- [OPTIONS] <FILE>
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin rft-client -- --server 127.0.0.1:9000 notes.txt
//!
//!   # 에코를 downloads 디렉터리에 저장, 재전송 없이
//!   cargo run --release --bin rft-client -- -s 10.0.0.2:9000 -o downloads --retries 0 photo.jpg

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rft::{Client, Config, FileStore};

/// 클라이언트 실행 옵션
struct ClientOptions {
    server_addr: SocketAddr,
    output_dir: PathBuf,
    file: Option<PathBuf>,
    config: Config,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let config = Config::default();
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], config.listen_port)),
            output_dir: PathBuf::from("."),
            file: None,
            config,
        }
    }
}

fn print_help() {
    println!(
        r#"RFT Client - Reliable Fragment Transfer 클라이언트

파일을 서버로 업로드하고 서버의 에코를 받아 저장

사용법:
  cargo run --release --bin rft-client -- [OPTIONS] <FILE>

옵션:
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  -o, --output <PATH>     에코 저장 디렉터리 (기본: 현재 디렉터리)
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

fn parse_args() -> Result<ClientOptions, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = ClientOptions::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--server" | "-s", Some(value)) => {
                options.server_addr = value.parse()?;
                i += 1;
            }
            ("--output" | "-o", Some(value)) => {
                options.output_dir = PathBuf::from(value);
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
            (arg, _) if !arg.starts_with('-') && options.file.is_none() => {
                options.file = Some(PathBuf::from(arg));
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
    let Some(file) = options.file else {
        print_help();
        return Err("전송할 파일 경로 필요".into());
    };

    info!("RFT Client starting...");
    info!("Server address: {}", options.server_addr);
    info!("Output directory: {:?}", options.output_dir);

    let client = Client::connect(options.config, options.server_addr).await?;
    info!("Local address: {}", client.local_addr()?);

    let start = Instant::now();
    let output = FileStore::new(options.output_dir);
    match client.send_file(&file, &output).await {
        Ok(path) => {
            let elapsed = start.elapsed();
            info!("Echo complete!");
            info!("  Saved to: {:?}", path);
            info!("  Time: {:.2}s", elapsed.as_secs_f64());
            Ok(())
        }
        Err(e) if e.is_terminal() => {
            error!("Transfer failed permanently: {}", e);
            error!("  Peer stopped responding; check the server or raise --retries/--idle");
            Err(e.into())
        }
        Err(e) => {
            error!("Transfer failed: {}", e);
            Err(e.into())
        }
    }
}
