//! WFP 피어 - Windowed Fragment Protocol
//!
//! 같은 프로그램이 listen과 connect를 모두 수행하는 대칭 피어
//! - 표준 입력 명령으로 엔진 제어
//! - 수신 메시지와 디버그 이벤트를 그대로 출력
//!
//! 사용법:
//!   cargo run --release --bin wfp-peer -- [OPTIONS]
//!
//! 예시:
//!   # 9000 포트에서 대기
//!   cargo run --release --bin wfp-peer -- --port 9000
//!
//!   # 다른 피어에 연결
//!   cargo run --release --bin wfp-peer -- --peer 127.0.0.1 9000

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use wfp::{Config, Engine, Event};

/// 피어 설정
#[derive(Default)]
struct PeerConfig {
    port: Option<String>,
    peer: Option<(String, String)>,
    config: Config,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{} (--help 참고)", msg);
    std::process::exit(2);
}

fn parse_args() -> PeerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = PeerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--peer" | "-c" => {
                if i + 2 < args.len() {
                    config.peer = Some((args[i + 1].clone(), args[i + 2].clone()));
                    i += 2;
                } else {
                    usage_error("--peer 에는 IP와 포트가 필요함");
                }
            }
            "--fragment-size" | "-f" => {
                if i + 1 < args.len() {
                    config.config.fragment_size = args[i + 1]
                        .parse()
                        .unwrap_or_else(|_| usage_error("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--download-dir" | "-d" => {
                if i + 1 < args.len() {
                    let dir = PathBuf::from(&args[i + 1]);
                    config.config = config.config.with_download_dir(dir);
                    i += 1;
                }
            }
            "--lan" => {
                let dir = config.config.download_dir.clone();
                config.config = Config::lan().with_download_dir(dir);
            }
            "--unstable" => {
                let dir = config.config.download_dir.clone();
                config.config = Config::unstable_network().with_download_dir(dir);
            }
            "--help" | "-h" => {
                println!(
                    r#"WFP Peer - Windowed Fragment Protocol 피어

UDP 위의 ACK 윈도우 조각 전송 프로토콜
- 3-way 핸드셰이크, 역할 자동 결정
- 20개 프래그먼트마다 ACK, 단계별 최대 42회 재전송

사용법:
  cargo run --release --bin wfp-peer -- [OPTIONS]

옵션:
  -p, --port <PORT>          listen 포트
  -c, --peer <IP> <PORT>     시작하자마자 연결할 피어
  -f, --fragment-size <N>    프래그먼트 크기 (1..=1446, 기본: 1446)
  -d, --download-dir <PATH>  수신 파일 저장 디렉터리 (기본: .)
  --lan                      LAN 프리셋 (짧은 재전송 간격)
  --unstable                 불안정 네트워크 프리셋 (작은 프래그먼트)
  -h, --help                 이 도움말 출력

명령 (표준 입력):
  /bind <PORT>               포트 listen
  /connect <IP> <PORT>       피어에 연결
  /disconnect                연결 해제
  /close                     연결 해제 및 listen 중지
  /file <PATH>               파일 전송
  /frag <N>                  프래그먼트 크기 변경
  /corrupt on|off            다음 전송의 첫 프래그먼트 변조
  /stats                     전송 통계 출력
  /quit                      종료
  그 외                      텍스트 메시지 전송
"#
                );
                std::process::exit(0);
            }
            other => eprintln!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    config
}

/// 명령 한 줄 처리, 종료 요청이면 false
async fn handle_line(engine: &Engine, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let result = match parts.next() {
        None => Ok(()),
        Some("/quit") => return false,
        Some("/bind") => engine.bind(parts.next().unwrap_or_default()).await.map(|_| ()),
        Some("/connect") => {
            let ip = parts.next().unwrap_or_default();
            let port = parts.next().unwrap_or_default();
            engine.connect_to_host(ip, port).await
        }
        Some("/disconnect") => engine.disconnect().await,
        Some("/close") => engine.close().await,
        Some("/file") => {
            let path = line.trim_start()["/file".len()..].trim();
            engine.send_file(path).await
        }
        Some("/frag") => match parts.next().map(str::parse::<usize>) {
            Some(Ok(size)) => engine.set_fragment_size(size).await,
            _ => {
                println!("usage: /frag <N>");
                Ok(())
            }
        },
        Some("/corrupt") => match parts.next() {
            Some("on") => engine.enable_corruption_test(true).await,
            Some("off") => engine.enable_corruption_test(false).await,
            _ => {
                println!("usage: /corrupt on|off");
                Ok(())
            }
        },
        Some("/stats") => {
            println!("{}", engine.stats().summary());
            Ok(())
        }
        Some(_) => engine.send_text(line.to_string()).await,
    };

    if let Err(e) = result {
        warn!("명령 실패: {}", e);
    }
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG 우선)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let peer_config = parse_args();
    info!("WFP Peer starting...");
    info!("Fragment size: {}", peer_config.config.fragment_size);
    info!("Download dir: {:?}", peer_config.config.download_dir);

    let (engine, mut events) = Engine::start(peer_config.config)?;

    if let Some(port) = &peer_config.port {
        if let Err(e) = engine.bind(port).await {
            warn!("listen 실패: {}", e);
        }
    }
    if let Some((ip, port)) = &peer_config.peer {
        if let Err(e) = engine.connect_to_host(ip, port).await {
            warn!("연결 실패: {}", e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&engine, line.trim_end()).await {
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Some(Event::Message(text)) => println!("[message] {}", text),
                Some(Event::Debug(line)) => println!("[debug] {}", line),
                Some(Event::Failed(phase)) => println!("[failed] {} gave up", phase),
                None => break,
            },
        }
    }

    engine.stop().await;
    // 마지막 이벤트 출력
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        if let Event::Debug(line) = event {
            println!("[debug] {}", line);
        }
    }

    println!("{}", engine.stats().summary());
    Ok(())
}
