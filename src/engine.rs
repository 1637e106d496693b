//! 엔진 (소켓 + 세션 구동)
//!
//! - 단일 tokio 태스크가 UDP 소켓, 세션, 타이머를 모두 소유
//! - 외부 호출은 명령 채널로 전달되고 oneshot으로 결과를 돌려받음
//! - 세션 이벤트는 mpsc 채널로 내보냄

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::session::{Event, Output, Session};
use crate::stats::TransferStats;
use crate::{Config, Error, Result};

/// 이벤트 채널 수신기 타입
pub type EventReceiver = mpsc::Receiver<Event>;

type Reply<T> = oneshot::Sender<Result<T>>;

/// 내부 명령
enum Command {
    Bind { port: String, reply: Reply<SocketAddr> },
    Connect { ip: String, port: String, reply: Reply<()> },
    Disconnect,
    Close,
    SendText { data: Bytes, reply: Reply<()> },
    SendFile { path: PathBuf, reply: Reply<()> },
    SetFragmentSize { size: usize, reply: Reply<()> },
    CorruptionTest(bool),
    Stop,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// 엔진 내부 상태 (단일 태스크에서만 접근)
struct Reactor {
    session: Session,
    socket: Option<UdpSocket>,
    /// bind로 열어둔 포트 (연결 해제 후 다시 listen)
    listen_port: Option<u16>,
    events_tx: mpsc::Sender<Event>,
    stats: Arc<RwLock<TransferStats>>,
}

impl Reactor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, buf_size: usize) {
        let mut buf = vec![0u8; buf_size];

        loop {
            let deadline = self.session.next_deadline();

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Stop) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                received = recv_datagram(self.socket.as_ref(), &mut buf) => match received {
                    Ok((len, from)) => {
                        self.session.handle_datagram(&buf[..len], from, now());
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        trace!("피어 포트 닫힘: {}", e);
                    }
                    Err(e) => {
                        warn!("수신 에러: {}", e);
                    }
                },
                _ = sleep_until(deadline) => {
                    self.session.on_timer(now());
                }
            }

            self.flush().await;
        }

        self.session.disconnect();
        self.listen_port = None;
        self.flush().await;
        info!("WFP engine stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Bind { port, reply } => {
                let result = self.bind(&port).await;
                let _ = reply.send(result);
            }
            Command::Connect { ip, port, reply } => {
                let result = self.connect(&ip, &port);
                let _ = reply.send(result);
            }
            Command::Disconnect => self.session.disconnect(),
            Command::Close => {
                self.listen_port = None;
                self.session.disconnect();
                self.session.report("Server stopped.");
            }
            Command::SendText { data, reply } => {
                let _ = reply.send(self.session.send_text(data, now()));
            }
            Command::SendFile { path, reply } => {
                let result = self.send_file(path).await;
                let _ = reply.send(result);
            }
            Command::SetFragmentSize { size, reply } => {
                let _ = reply.send(self.session.set_fragment_size(size));
            }
            Command::CorruptionTest(enabled) => self.session.enable_corruption_test(enabled),
            Command::Stop => {}
        }
    }

    async fn bind(&mut self, port: &str) -> Result<SocketAddr> {
        let Ok(port_num) = port.trim().parse::<u16>() else {
            self.session.report("Can't convert your port to a number!");
            return Err(Error::InvalidPort(port.to_string()));
        };

        if self.socket.is_some() {
            self.listen_port = None;
            self.session.disconnect();
            self.session.report("Stopped server to start with new port.");
            self.flush().await;
        }

        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port_num)).await {
            Ok(socket) => {
                let local = socket.local_addr()?;
                info!("WFP listening on {}", local);
                self.listen_port = Some(local.port());
                self.socket = Some(socket);
                self.session.report("Server successfully started!");
                Ok(local)
            }
            Err(source) => {
                self.session.report("Couldn't bind selected port!");
                Err(Error::Bind {
                    port: port_num,
                    source,
                })
            }
        }
    }

    fn connect(&mut self, ip: &str, port: &str) -> Result<()> {
        let Ok(ip) = ip.trim().parse::<IpAddr>() else {
            self.session.report("Invalid IP address!");
            return Err(Error::InvalidAddress(ip.to_string()));
        };
        let Ok(port_num) = port.trim().parse::<u16>() else {
            self.session.report("Can't convert your port to a number!");
            return Err(Error::InvalidPort(port.to_string()));
        };

        self.session.connect(SocketAddr::new(ip, port_num))
    }

    async fn send_file(&mut self, path: PathBuf) -> Result<()> {
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                self.session
                    .report(format!("Couldn't read file {}: {}", path.display(), e));
                return Err(e.into());
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.session.send_file(&name, data, now())
    }

    /// 세션 출력 전부 실행 후 통계 게시
    async fn flush(&mut self) {
        while let Some(output) = self.session.poll_output() {
            match output {
                Output::Transmit(bytes) => self.transmit(&bytes).await,
                Output::Connect(peer) => self.connect_socket(peer).await,
                Output::Close => self.close_socket().await,
                Output::Event(event) => {
                    let _ = self.events_tx.send(event).await;
                }
            }
        }

        *self.stats.write() = self.session.stats().clone();
    }

    async fn transmit(&self, bytes: &[u8]) {
        let Some(socket) = &self.socket else {
            trace!("소켓 없음, {} bytes 버림", bytes.len());
            return;
        };
        if let Err(e) = socket.send(bytes).await {
            warn!("전송 실패: {}", e);
        }
    }

    async fn connect_socket(&mut self, peer: SocketAddr) {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let local: SocketAddr = match peer {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                match UdpSocket::bind(local).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        self.session.on_transport_error(&e);
                        return;
                    }
                }
            }
        };

        let result = socket.connect(peer).await;
        self.socket = Some(socket);

        match result {
            Ok(()) => {
                debug!("소켓 연결: {}", peer);
                self.session.on_transport_connected(now());
            }
            Err(e) => self.session.on_transport_error(&e),
        }
    }

    async fn close_socket(&mut self) {
        self.socket = None;

        let Some(port) = self.listen_port else {
            return;
        };
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => {
                debug!("포트 {} 다시 listen", port);
                self.socket = Some(socket);
            }
            Err(e) => {
                warn!("포트 {} 재바인딩 실패: {}", port, e);
                self.listen_port = None;
                self.session
                    .report(format!("Couldn't listen on port {} again: {}", port, e));
            }
        }
    }
}

async fn recv_datagram(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// 엔진 핸들 (외부에서 제어용)
#[derive(Clone)]
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
    stats: Arc<RwLock<TransferStats>>,
    running: Arc<AtomicBool>,
}

impl Engine {
    /// 새 엔진 생성 및 시작
    ///
    /// tokio 런타임 안에서 호출해야 함. 반환된 이벤트 수신기는 계속 비워줘야
    /// 엔진이 멈추지 않음.
    pub fn start(config: Config) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(1000);
        let (events_tx, events_rx) = mpsc::channel::<Event>(config.event_channel_capacity.max(1));

        let stats = Arc::new(RwLock::new(TransferStats::new()));
        let running = Arc::new(AtomicBool::new(true));
        let buf_size = config.recv_buffer_size;

        let reactor = Reactor {
            session: Session::new(config),
            socket: None,
            listen_port: None,
            events_tx,
            stats: stats.clone(),
        };

        let running_main = running.clone();
        tokio::spawn(async move {
            reactor.run(cmd_rx, buf_size).await;
            running_main.store(false, Ordering::SeqCst);
        });

        info!("WFP engine started");

        let engine = Self {
            cmd_tx,
            stats,
            running,
        };
        Ok((engine, events_rx))
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::ChannelError)?;
        rx.await.map_err(|_| Error::ChannelError)?
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::ChannelError)
    }

    /// 포트 listen 시작, 실제 바인딩 주소 반환
    ///
    /// `"0"`이면 OS가 포트를 고름
    pub async fn bind(&self, port: &str) -> Result<SocketAddr> {
        let port = port.to_string();
        self.request(|reply| Command::Bind { port, reply }).await
    }

    /// 피어에 능동 연결
    pub async fn connect_to_host(&self, ip: &str, port: &str) -> Result<()> {
        let (ip, port) = (ip.to_string(), port.to_string());
        self.request(|reply| Command::Connect { ip, port, reply }).await
    }

    /// 연결 해제 (bind한 포트는 계속 listen)
    pub async fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect).await
    }

    /// 연결 해제 및 listen 중지
    pub async fn close(&self) -> Result<()> {
        self.command(Command::Close).await
    }

    /// 텍스트 메시지 전송 예약
    pub async fn send_text(&self, text: impl Into<Bytes>) -> Result<()> {
        let data = text.into();
        self.request(|reply| Command::SendText { data, reply }).await
    }

    /// 파일 전송 예약
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.request(|reply| Command::SendFile { path, reply }).await
    }

    pub async fn set_fragment_size(&self, size: usize) -> Result<()> {
        self.request(|reply| Command::SetFragmentSize { size, reply })
            .await
    }

    /// 다음 전송의 첫 프래그먼트 변조 (손상 테스트)
    pub async fn enable_corruption_test(&self, enabled: bool) -> Result<()> {
        self.command(Command::CorruptionTest(enabled)).await
    }

    /// 통계 반환
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    /// 정지
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
