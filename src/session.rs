//! 세션 상태 머신
//!
//! 소켓을 직접 다루지 않음. 입력(데이터그램, 타이머 만료, 외부 호출)마다
//! 상태를 바꾸고 `Output`을 쌓아두면 엔진이 순서대로 꺼내 실행함.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──transport up──▶ HandshakeSent ──SynAck──▶ Established
//!   │                                                                         ▲
//!   └──Handshake 수신──▶ Connecting ──transport up──▶ SynSent ──Ack(Handshake)─┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::check_fragment_size;
use crate::packet::{AckKind, Packet, PayloadKind};
use crate::receiver::{Completed, DataOutcome, ReceiveContext};
use crate::sender::{Outgoing, Payload};
use crate::stats::TransferStats;
use crate::timer::{Expiry, TimerKind, Timers};
use crate::{Config, Error, Result, MAX_FRAGMENT_SIZE};

/// 세션 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uninitiated,
    /// 능동 연결한 쪽
    Initiator,
    /// Handshake를 받고 역으로 연결한 쪽
    Responder,
}

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    HandshakeSent,
    SynSent,
    Established,
}

/// 재시도 한도가 있는 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Syn,
    Init,
    Data,
}

impl Phase {
    fn timer(self) -> TimerKind {
        match self {
            Phase::Handshake => TimerKind::Handshake,
            Phase::Syn => TimerKind::Syn,
            Phase::Init => TimerKind::Init,
            Phase::Data => TimerKind::Data,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Handshake => "Handshake",
            Phase::Syn => "SynAck",
            Phase::Init => "INIT",
            Phase::Data => "DATA",
        };
        f.write_str(name)
    }
}

/// 외부로 나가는 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// 디버그/상태 메시지
    Debug(String),
    /// 완전히 조립된 텍스트 메시지
    Message(String),
    /// 재시도 한도 초과 등으로 단계가 포기됨
    Failed(Phase),
}

/// 엔진이 실행할 부수효과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// 연결된 피어로 데이터그램 전송
    Transmit(Vec<u8>),
    /// 전송 계층을 피어에 연결
    Connect(SocketAddr),
    /// 전송 계층 닫기
    Close,
    Event(Event),
}

/// 두 피어 사이의 논리 세션
pub struct Session {
    config: Config,
    role: Role,
    state: ConnectionState,
    peer: Option<SocketAddr>,
    timers: Timers,
    outgoing: Outgoing,
    incoming: Option<ReceiveContext>,
    /// 즉시 완료된 빈 전송의 종류 (ACK 손실로 Init이 다시 오면 재확인만)
    last_empty: Option<PayloadKind>,
    stats: TransferStats,
    outputs: VecDeque<Output>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Self {
            timers: Timers::new(&config),
            outgoing: Outgoing::new(config.ack_window),
            config,
            role: Role::Uninitiated,
            state: ConnectionState::Idle,
            peer: None,
            incoming: None,
            last_empty: None,
            stats: TransferStats::new(),
            outputs: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn fragment_size(&self) -> usize {
        self.config.fragment_size
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn timer_running(&self, kind: TimerKind) -> bool {
        self.timers.is_running(kind)
    }

    /// 단계별 현재 재시도 횟수
    pub fn retries(&self, phase: Phase) -> u32 {
        self.timers.fires(phase.timer())
    }

    /// 다음 출력 꺼내기
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    /// 가장 가까운 타이머 마감 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// 디버그 스트림으로 보고
    pub fn report(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        self.outputs.push_back(Output::Event(Event::Debug(line)));
    }

    fn emit(&mut self, event: Event) {
        self.outputs.push_back(Output::Event(event));
    }

    fn transmit(&mut self, packet: &Packet) {
        trace!("{:?} -> {:?}", packet.packet_type(), self.peer);
        self.transmit_raw(packet.to_bytes());
    }

    fn transmit_raw(&mut self, bytes: Vec<u8>) {
        self.stats.record_sent(bytes.len());
        self.outputs.push_back(Output::Transmit(bytes));
    }

    // ─────────────────────────────────────────────────────────────────
    // 외부 호출
    // ─────────────────────────────────────────────────────────────────

    /// 능동 연결 시작 (Initiator)
    pub fn connect(&mut self, peer: SocketAddr) -> Result<()> {
        if self.peer.is_some() {
            self.report("Socket is connected, disconnect first!");
            return Err(Error::AlreadyConnected);
        }

        self.role = Role::Initiator;
        self.state = ConnectionState::Connecting;
        self.peer = Some(peer);
        self.report(format!("Connecting to {}...", peer));
        self.outputs.push_back(Output::Connect(peer));
        Ok(())
    }

    /// 전송 계층 연결 완료
    pub fn on_transport_connected(&mut self, now: Instant) {
        let Some(peer) = self.peer else {
            return;
        };
        self.report("Socket connected.");

        match self.role {
            Role::Initiator => {
                self.transmit(&Packet::Handshake);
                self.timers.start(TimerKind::Handshake, now);
                self.state = ConnectionState::HandshakeSent;
                self.report(format!("Handshake sent to {}.", peer));
            }
            Role::Responder => {
                self.transmit(&Packet::SynAck);
                self.timers.start(TimerKind::Syn, now);
                self.state = ConnectionState::SynSent;
                self.report(format!("SynAck sent to {}.", peer));
            }
            Role::Uninitiated => {}
        }
    }

    /// 전송 계층 연결 실패
    pub fn on_transport_error(&mut self, err: &std::io::Error) {
        self.report(format!("Couldn't connect socket: {}", err));
        self.disconnect();
    }

    /// 연결 해제 및 세션 초기화
    pub fn disconnect(&mut self) {
        if self.peer.is_some() {
            self.report("Socket disconnected.");
        }
        let active = if self.outgoing.awaiting_init_ack() {
            Some(Phase::Init)
        } else if self.outgoing.is_idle() {
            None
        } else {
            Some(Phase::Data)
        };
        // Init 대기 중인 페이로드는 아직 큐 맨 앞에 있음
        let dropped = self.outgoing.queued() + usize::from(active == Some(Phase::Data));
        if dropped > 0 {
            self.report(format!("Dropped {} pending transfer(s).", dropped));
        }
        if let Some(phase) = active {
            self.stats.failed_transfers += 1;
            self.emit(Event::Failed(phase));
        }
        self.reset();
        self.outputs.push_back(Output::Close);
    }

    /// 모든 타이머 정지, 카운터/버퍼/역할 초기화
    fn reset(&mut self) {
        self.timers.stop_all();
        self.outgoing.clear();
        self.incoming = None;
        self.last_empty = None;
        self.role = Role::Uninitiated;
        self.state = ConnectionState::Idle;
        self.peer = None;
    }

    /// 텍스트 메시지 전송 예약
    pub fn send_text(&mut self, text: impl Into<Bytes>, now: Instant) -> Result<()> {
        let payload = Payload::text(text, self.config.fragment_size);
        self.enqueue(payload, now)
    }

    /// 파일 전송 예약
    pub fn send_file(&mut self, name: &str, data: impl Into<Bytes>, now: Instant) -> Result<()> {
        let payload = Payload::file(name, data, self.config.fragment_size);
        self.enqueue(payload, now)
    }

    fn enqueue(&mut self, payload: Payload, now: Instant) -> Result<()> {
        if self.peer.is_none() {
            self.report("Not connected, connect first!");
            return Err(Error::NotConnected);
        }

        self.report(format!(
            "Queued {} (crc32 {:08X}).",
            payload.describe(),
            crc32fast::hash(&payload.data)
        ));
        self.outgoing.enqueue(payload);
        self.start_next_transfer(now);
        Ok(())
    }

    /// 프래그먼트 크기 변경 (이후 큐에 들어가는 페이로드부터 적용)
    pub fn set_fragment_size(&mut self, size: usize) -> Result<()> {
        if let Err(e) = check_fragment_size(size) {
            self.report(format!(
                "Maximum fragment size is {}, fragment size not set!",
                MAX_FRAGMENT_SIZE
            ));
            return Err(e);
        }
        self.config.fragment_size = size;
        self.report(format!("Fragment size set to: {}", size));
        Ok(())
    }

    /// 다음 전송의 첫 프래그먼트 변조 무장/해제
    pub fn enable_corruption_test(&mut self, enabled: bool) {
        self.outgoing.set_corruption_test(enabled);
        if enabled {
            self.report("Corruption test armed for the next transfer.");
        } else {
            self.report("Corruption test disarmed.");
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // 데이터그램 수신
    // ─────────────────────────────────────────────────────────────────

    /// 수신 데이터그램 처리
    ///
    /// 체크섬은 여기서 한 번만 검증됨
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) {
        self.stats.record_received(bytes.len());

        if let Some(peer) = self.peer {
            if from != peer {
                trace!("연결되지 않은 주소 {} 의 데이터그램 무시", from);
                return;
            }
        }

        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e @ Error::ChecksumMismatch { .. }) => {
                self.stats.checksum_failures += 1;
                self.report(format!("Dropped corrupted datagram from {}: {}", from, e));
                return;
            }
            Err(e) => {
                self.stats.malformed_packets += 1;
                self.report(format!("Dropped malformed datagram from {}: {}", from, e));
                return;
            }
        };
        trace!("{:?} <- {}", packet.packet_type(), from);

        if self.peer.is_none() {
            self.on_unconnected(packet, from);
            return;
        }
        if self.state == ConnectionState::Connecting {
            trace!("전송 계층 연결 전, {:?} 무시", packet.packet_type());
            return;
        }

        match packet {
            Packet::Handshake => self.on_handshake(now),
            Packet::SynAck => self.on_syn_ack(now),
            Packet::Ack(AckKind::Handshake) => self.on_handshake_ack(now),
            Packet::Ack(AckKind::Init) => self.on_init_ack(now),
            Packet::Ack(AckKind::Data) => self.on_data_ack(now),
            Packet::Init {
                fragment_count,
                window_size,
                kind,
            } => self.on_init(fragment_count, window_size, kind),
            Packet::Data {
                window_seq,
                payload,
            } => self.on_data(window_seq, payload, now),
            Packet::Error(reason) => self.on_peer_error(reason, now),
        }
    }

    fn on_unconnected(&mut self, packet: Packet, from: SocketAddr) {
        match packet {
            Packet::Handshake => {
                self.role = Role::Responder;
                self.state = ConnectionState::Connecting;
                self.peer = Some(from);
                self.report(format!("Handshake received from {}, connecting back.", from));
                self.outputs.push_back(Output::Connect(from));
            }
            other => self.report(format!(
                "Not connected, dropped {:?} from {}.",
                other.packet_type(),
                from
            )),
        }
    }

    fn on_handshake(&mut self, now: Instant) {
        self.transmit(&Packet::SynAck);
        self.timers.start(TimerKind::Syn, now);

        if self.state == ConnectionState::Established {
            debug!("re-handshake 응답");
        } else {
            self.state = ConnectionState::SynSent;
            self.report("Handshake received, SynAck sent.");
        }
    }

    fn on_syn_ack(&mut self, now: Instant) {
        self.timers.stop(TimerKind::Handshake);
        self.transmit(&Packet::Ack(AckKind::Handshake));
        self.timers.start(TimerKind::Liveness, now);
        if !self.timers.is_running(TimerKind::Rehandshake) {
            self.timers.start(TimerKind::Rehandshake, now);
        }
        self.mark_established(now);
    }

    fn on_handshake_ack(&mut self, now: Instant) {
        self.timers.stop(TimerKind::Syn);
        self.timers.start(TimerKind::Liveness, now);
        self.mark_established(now);
    }

    fn mark_established(&mut self, now: Instant) {
        if self.state == ConnectionState::Established {
            debug!("연결 생존 확인");
            return;
        }

        self.state = ConnectionState::Established;
        if let Some(peer) = self.peer {
            info!("연결 수립: {} ({:?})", peer, self.role);
            self.report(format!("Connection established with {}.", peer));
        }
        self.start_next_transfer(now);
    }

    // ─────────────────────────────────────────────────────────────────
    // 송신 전송
    // ─────────────────────────────────────────────────────────────────

    fn start_next_transfer(&mut self, now: Instant) {
        if self.state != ConnectionState::Established {
            return;
        }
        let Some((init, description)) = self.outgoing.begin_next() else {
            return;
        };

        let count = match &init {
            Packet::Init { fragment_count, .. } => *fragment_count,
            _ => 0,
        };
        self.transmit(&init);
        self.timers.start(TimerKind::Init, now);
        self.report(format!("INIT sent for {}: {} fragment(s).", description, count));
    }

    fn on_init_ack(&mut self, now: Instant) {
        let Some(batch) = self.outgoing.on_init_ack() else {
            debug!("오래된 INIT ACK 무시");
            return;
        };
        let total = batch.total_fragments();
        let corrupt = batch.corruption_pending();

        self.timers.stop(TimerKind::Init);
        self.report(format!(
            "INIT acknowledged, sending {} fragment(s){}.",
            total,
            if corrupt { " (corruption test armed)" } else { "" }
        ));
        self.send_batch(now, false);
    }

    /// 현재 배치 전송 (데이터 재전송 타이머 핸들러 겸용)
    fn send_batch(&mut self, now: Instant, retransmit: bool) {
        let Some(batch) = self.outgoing.batch_mut() else {
            return;
        };
        if batch.is_complete() {
            self.finish_transfer(now);
            return;
        }

        let index = batch.batch_index();
        let datagrams = batch.encode_current();
        let count = datagrams.len() as u64;

        for bytes in datagrams {
            self.transmit_raw(bytes);
        }
        self.stats.fragments_sent += count;

        if retransmit {
            // 재시도 타이머는 poll 시점에 이미 재무장됨
            self.stats.retransmitted_fragments += count;
            self.report(format!("Resent batch {} ({} fragment(s)).", index, count));
        } else {
            self.timers.start(TimerKind::Data, now);
            self.report(format!("Sent batch {} ({} fragment(s)).", index, count));
        }
    }

    fn on_data_ack(&mut self, now: Instant) {
        let Some(batch) = self.outgoing.batch_mut() else {
            debug!("오래된 DATA ACK 무시");
            return;
        };
        batch.advance();
        self.timers.stop(TimerKind::Data);
        self.send_batch(now, false);
    }

    fn finish_transfer(&mut self, now: Instant) {
        self.timers.stop(TimerKind::Data);
        if let Some(payload) = self.outgoing.finish() {
            self.stats.transfers_sent += 1;
            info!("전송 완료: {}", payload.describe());
            self.report(format!(
                "Transfer complete: {} (crc32 {:08X}).",
                payload.describe(),
                crc32fast::hash(&payload.data)
            ));
        }
        self.start_next_transfer(now);
    }

    /// 현재 송신 전송 포기 후 다음 페이로드로 진행
    fn abort_transfer(&mut self, phase: Phase, reason: &str, now: Instant) {
        self.timers.stop(TimerKind::Init);
        self.timers.stop(TimerKind::Data);

        if let Some(payload) = self.outgoing.abort() {
            self.stats.failed_transfers += 1;
            warn!("전송 실패: {} ({})", payload.describe(), reason);
            self.report(format!("Transfer of {} failed: {}.", payload.describe(), reason));
            self.emit(Event::Failed(phase));
        }
        self.start_next_transfer(now);
    }

    fn on_peer_error(&mut self, reason: String, now: Instant) {
        self.report(format!("Peer reported error: {}", reason));

        if self.outgoing.awaiting_init_ack() {
            self.abort_transfer(Phase::Init, "rejected by peer", now);
        } else if !self.outgoing.is_idle() {
            self.abort_transfer(Phase::Data, "rejected by peer", now);
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // 수신 전송
    // ─────────────────────────────────────────────────────────────────

    fn on_init(&mut self, fragment_count: u32, window_size: u8, kind: PayloadKind) {
        // ACK 손실로 재전송된 Init이면 다시 ACK만 보냄
        if fragment_count == 0 && self.last_empty.as_ref() == Some(&kind) {
            self.transmit(&Packet::Ack(AckKind::Init));
            debug!("빈 전송 INIT 재확인");
            return;
        }
        self.last_empty = None;

        if let Some(ctx) = &self.incoming {
            if ctx.total_received() == 0
                && ctx.total_expected() == fragment_count
                && ctx.kind() == &kind
            {
                self.transmit(&Packet::Ack(AckKind::Init));
                debug!("중복 INIT 재확인");
                return;
            }
            if ctx.total_received() > 0 {
                self.report("Previous incoming transfer abandoned.");
            }
        }
        self.incoming = None;
        self.timers.stop(TimerKind::IdleWindow);

        match ReceiveContext::open(fragment_count, window_size, kind.clone(), &self.config.download_dir)
        {
            Ok(ctx) => {
                self.transmit(&Packet::Ack(AckKind::Init));
                self.report(format!(
                    "INIT received for {}: {} fragment(s), window {}.",
                    kind, fragment_count, window_size
                ));
                if ctx.is_finished() {
                    self.last_empty = Some(kind);
                    self.complete_incoming(ctx);
                } else {
                    self.incoming = Some(ctx);
                }
            }
            Err(e) => {
                self.stats.failed_transfers += 1;
                warn!("수신 시작 실패: {} ({})", kind, e);
                self.report(format!("Couldn't start receiving {}: {}", kind, e));
                self.transmit(&Packet::Error(format!("receive aborted: {}", e)));
            }
        }
    }

    fn on_data(&mut self, window_seq: u8, payload: Bytes, now: Instant) {
        self.last_empty = None;
        if self.incoming.is_none() {
            // ACK를 못 받은 송신자가 마지막 배치를 다시 보내는 경우
            if window_seq == 0 {
                self.transmit(&Packet::Ack(AckKind::Data));
                self.report("DATA without active transfer, acknowledged again.");
            }
            return;
        }
        let Some(ctx) = self.incoming.as_mut() else {
            return;
        };

        let outcome = ctx.accept(window_seq, payload);
        let (received, expected) = (ctx.total_received(), ctx.total_expected());
        let finished = ctx.is_finished();

        match outcome {
            Ok(DataOutcome::Stored) => {
                self.stats.fragments_received += 1;
                self.timers.start(TimerKind::IdleWindow, now);
            }
            Ok(DataOutcome::Duplicate) => {
                self.stats.duplicate_fragments += 1;
                self.timers.start(TimerKind::IdleWindow, now);
            }
            Ok(DataOutcome::OutOfRange { limit }) => {
                self.report(format!(
                    "Dropped fragment with sequence {} (window holds {}).",
                    window_seq, limit
                ));
            }
            Ok(DataOutcome::WindowFlushed) => {
                self.stats.fragments_received += 1;
                self.timers.stop(TimerKind::IdleWindow);
                self.transmit(&Packet::Ack(AckKind::Data));

                if finished {
                    if let Some(ctx) = self.incoming.take() {
                        self.complete_incoming(ctx);
                    }
                } else {
                    self.report(format!(
                        "Window complete ({}/{} fragments), DATA acknowledged.",
                        received, expected
                    ));
                }
            }
            Err(e) => {
                self.incoming = None;
                self.timers.stop(TimerKind::IdleWindow);
                self.stats.failed_transfers += 1;
                warn!("수신 데이터 기록 실패: {}", e);
                self.report(format!("Couldn't write received data: {}", e));
                self.transmit(&Packet::Error(format!("receive aborted: {}", e)));
            }
        }
    }

    fn complete_incoming(&mut self, ctx: ReceiveContext) {
        match ctx.finish() {
            Ok(Completed::Message { text, crc32 }) => {
                self.stats.transfers_received += 1;
                self.report(format!(
                    "Message received ({} bytes, crc32 {:08X}).",
                    text.len(),
                    crc32
                ));
                self.emit(Event::Message(text));
            }
            Ok(Completed::File { path, len, crc32 }) => {
                self.stats.transfers_received += 1;
                info!("파일 수신 완료: {:?}", path);
                self.report(format!(
                    "File saved: {} ({} bytes, crc32 {:08X}).",
                    path.display(),
                    len,
                    crc32
                ));
            }
            Err(e) => {
                self.stats.failed_transfers += 1;
                self.report(format!("Couldn't finish incoming transfer: {}", e));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // 타이머
    // ─────────────────────────────────────────────────────────────────

    /// 만료된 타이머 전부 처리
    pub fn on_timer(&mut self, now: Instant) {
        while let Some((kind, expiry)) = self.timers.poll(now) {
            match (kind, expiry) {
                (TimerKind::Handshake, Expiry::Retry(n)) => {
                    self.transmit(&Packet::Handshake);
                    self.report(format!("Handshake retry {}/{}.", n, self.config.max_retries));
                }
                (TimerKind::Handshake, Expiry::Exhausted) => {
                    self.fail_connection(Phase::Handshake);
                }
                (TimerKind::Syn, Expiry::Retry(n)) => {
                    self.transmit(&Packet::SynAck);
                    self.report(format!("SynAck retry {}/{}.", n, self.config.max_retries));
                }
                (TimerKind::Syn, Expiry::Exhausted) => {
                    if self.state == ConnectionState::Established {
                        // 생존 타이머가 최종 판단
                        self.report("SynAck never acknowledged, waiting for liveness timeout.");
                        self.emit(Event::Failed(Phase::Syn));
                    } else {
                        self.fail_connection(Phase::Syn);
                    }
                }
                (TimerKind::Init, Expiry::Retry(n)) => {
                    if let Some(init) = self.outgoing.pending_init() {
                        self.transmit(&init);
                        self.report(format!("INIT retry {}/{}.", n, self.config.max_retries));
                    }
                }
                (TimerKind::Init, Expiry::Exhausted) => {
                    let reason = format!("no INIT ack after {} retries", self.config.max_retries);
                    self.abort_transfer(Phase::Init, &reason, now);
                }
                (TimerKind::Data, Expiry::Retry(_)) => {
                    self.send_batch(now, true);
                }
                (TimerKind::Data, Expiry::Exhausted) => {
                    let reason = format!("no DATA ack after {} retries", self.config.max_retries);
                    self.abort_transfer(Phase::Data, &reason, now);
                }
                (TimerKind::Liveness, _) => {
                    warn!("연결 타임아웃: {:?}", self.peer);
                    self.report("Connection timed out, peer unreachable.");
                    self.disconnect();
                }
                (TimerKind::Rehandshake, _) => {
                    debug!("주기적 re-handshake");
                    self.transmit(&Packet::Handshake);
                }
                (TimerKind::IdleWindow, _) => {
                    if let Some(ctx) = self.incoming.as_mut() {
                        let dropped = ctx.discard_window();
                        if dropped > 0 {
                            self.stats.discarded_windows += 1;
                            self.report(format!(
                                "Window stalled, discarded {} fragment(s).",
                                dropped
                            ));
                        }
                    }
                }
                (
                    TimerKind::Handshake | TimerKind::Syn | TimerKind::Init | TimerKind::Data,
                    Expiry::Fired,
                ) => {
                    debug!("재시도 타이머 {:?} 가 단발 만료를 냄, 무시", kind);
                }
            }
        }
    }

    fn fail_connection(&mut self, phase: Phase) {
        warn!("{} 재시도 한도 초과", phase);
        self.report(format!(
            "{} failed after {} retries, giving up.",
            phase, self.config.max_retries
        ));
        self.emit(Event::Failed(phase));
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use crate::checksum;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// 두 세션 사이의 가상 링크
    struct Link {
        a: Session,
        b: Session,
        now: Instant,
        to_a: VecDeque<Vec<u8>>,
        to_b: VecDeque<Vec<u8>>,
        a_events: Vec<Event>,
        b_events: Vec<Event>,
        /// A가 보낸 모든 패킷 (디코딩 가능한 것만)
        a_sent: Vec<Packet>,
        up: bool,
    }

    const A: u16 = 4000;
    const B: u16 = 5000;

    impl Link {
        fn new(a: Config, b: Config) -> Self {
            Self {
                a: Session::new(a),
                b: Session::new(b),
                now: Instant::now(),
                to_a: VecDeque::new(),
                to_b: VecDeque::new(),
                a_events: Vec::new(),
                b_events: Vec::new(),
                a_sent: Vec::new(),
                up: true,
            }
        }

        fn established() -> Self {
            let mut link = Self::new(Config::default(), Config::default());
            link.a.connect(addr(B)).unwrap();
            link.pump();
            link
        }

        fn pump(&mut self) {
            loop {
                let mut progressed = false;

                while let Some(output) = self.a.poll_output() {
                    progressed = true;
                    match output {
                        Output::Transmit(bytes) => {
                            if let Ok(packet) = Packet::from_bytes(&bytes) {
                                self.a_sent.push(packet);
                            }
                            if self.up {
                                self.to_b.push_back(bytes);
                            }
                        }
                        Output::Connect(_) => self.a.on_transport_connected(self.now),
                        Output::Close => {}
                        Output::Event(e) => self.a_events.push(e),
                    }
                }
                while let Some(output) = self.b.poll_output() {
                    progressed = true;
                    match output {
                        Output::Transmit(bytes) => {
                            if self.up {
                                self.to_a.push_back(bytes);
                            }
                        }
                        Output::Connect(_) => self.b.on_transport_connected(self.now),
                        Output::Close => {}
                        Output::Event(e) => self.b_events.push(e),
                    }
                }
                while let Some(bytes) = self.to_b.pop_front() {
                    progressed = true;
                    self.b.handle_datagram(&bytes, addr(A), self.now);
                }
                while let Some(bytes) = self.to_a.pop_front() {
                    progressed = true;
                    self.a.handle_datagram(&bytes, addr(B), self.now);
                }

                if !progressed {
                    break;
                }
            }
        }

        fn advance(&mut self, d: Duration) {
            self.now += d;
            self.a.on_timer(self.now);
            self.b.on_timer(self.now);
            self.pump();
        }

        fn messages(events: &[Event]) -> Vec<String> {
            events
                .iter()
                .filter_map(|e| match e {
                    Event::Message(m) => Some(m.clone()),
                    _ => None,
                })
                .collect()
        }

        fn has_debug(events: &[Event], needle: &str) -> bool {
            events
                .iter()
                .any(|e| matches!(e, Event::Debug(line) if line.contains(needle)))
        }
    }

    #[test]
    fn test_handshake_assigns_roles() {
        let link = Link::established();

        assert_eq!(link.a.role(), Role::Initiator);
        assert_eq!(link.b.role(), Role::Responder);
        assert_eq!(link.a.state(), ConnectionState::Established);
        assert_eq!(link.b.state(), ConnectionState::Established);
        assert_eq!(link.b.peer(), Some(addr(A)));

        assert!(!link.a.timer_running(TimerKind::Handshake));
        assert!(!link.b.timer_running(TimerKind::Syn));
        assert!(link.a.timer_running(TimerKind::Liveness));
        assert!(link.a.timer_running(TimerKind::Rehandshake));
        assert!(link.b.timer_running(TimerKind::Liveness));
    }

    #[test]
    fn test_hello_world_transfer() {
        let mut link = Link::established();
        link.a.set_fragment_size(10).unwrap();
        link.a_sent.clear();

        link.a.send_text("HELLO WORLD", link.now).unwrap();
        link.pump();

        assert_eq!(
            link.a_sent[0],
            Packet::Init {
                fragment_count: 2,
                window_size: 20,
                kind: PayloadKind::Text
            }
        );
        assert_eq!(
            link.a_sent[1],
            Packet::Data {
                window_seq: 0,
                payload: Bytes::from_static(b"HELLO WORL")
            }
        );
        assert_eq!(
            link.a_sent[2],
            Packet::Data {
                window_seq: 1,
                payload: Bytes::from_static(b"D")
            }
        );
        assert_eq!(Link::messages(&link.b_events), vec!["HELLO WORLD".to_string()]);
        assert!(link.a.outgoing.is_idle());
        assert!(!link.a.timer_running(TimerKind::Data));
        assert_eq!(link.a.stats().transfers_sent, 1);
    }

    #[test]
    fn test_multi_batch_transfer_and_queue() {
        let mut link = Link::established();
        link.a.set_fragment_size(10).unwrap();

        let long: String = (0..1001).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        link.a.send_text(long.clone(), link.now).unwrap();
        link.a.send_text("second", link.now).unwrap();
        link.pump();

        assert_eq!(Link::messages(&link.b_events), vec![long, "second".to_string()]);
        assert_eq!(link.a.stats().transfers_sent, 2);
    }

    #[test]
    fn test_send_before_established_waits() {
        let mut link = Link::new(Config::default(), Config::default());
        link.a.connect(addr(B)).unwrap();
        link.a.send_text("early", link.now).unwrap();
        link.pump();

        assert_eq!(Link::messages(&link.b_events), vec!["early".to_string()]);
    }

    #[test]
    fn test_handshake_retry_bound() {
        let mut session = Session::new(Config::default());
        let t0 = Instant::now();
        session.connect(addr(B)).unwrap();

        let mut handshakes = 0;
        let mut failures = 0;
        let mut drain = |session: &mut Session, now: Instant| {
            while let Some(output) = session.poll_output() {
                match output {
                    Output::Connect(_) => session.on_transport_connected(now),
                    Output::Transmit(bytes) => {
                        assert_eq!(Packet::from_bytes(&bytes).unwrap(), Packet::Handshake);
                        handshakes += 1;
                    }
                    Output::Event(Event::Failed(Phase::Handshake)) => failures += 1,
                    _ => {}
                }
            }
        };

        drain(&mut session, t0);
        for sec in 1..=120 {
            let now = t0 + Duration::from_secs(sec);
            session.on_timer(now);
            drain(&mut session, now);
        }

        // 최초 1회 + 재시도 42회
        assert_eq!(handshakes, 43);
        assert_eq!(failures, 1);
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(session.role(), Role::Uninitiated);
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn test_corruption_test_recovers_by_retransmit() {
        let mut link = Link::established();
        link.a.set_fragment_size(10).unwrap();
        link.a.enable_corruption_test(true);

        link.a.send_text("abcdefghijklmnopqrstuvwxy", link.now).unwrap();
        link.pump();

        // 첫 프래그먼트가 버려져 윈도우 미완성
        assert!(Link::messages(&link.b_events).is_empty());
        assert_eq!(link.b.stats().checksum_failures, 1);
        assert!(link.b.timer_running(TimerKind::IdleWindow));

        // 1초: 수신측 윈도우 폐기
        link.advance(Duration::from_secs(1));
        assert_eq!(link.b.stats().discarded_windows, 1);

        // 3초: 송신측 배치 재전송 (깨끗함)
        link.advance(Duration::from_secs(2));
        assert_eq!(
            Link::messages(&link.b_events),
            vec!["abcdefghijklmnopqrstuvwxy".to_string()]
        );
        assert_eq!(link.a.stats().retransmitted_fragments, 3);
        assert_eq!(link.b.stats().checksum_failures, 1);
        assert!(!link.a.outgoing.corruption_armed());
    }

    #[test]
    fn test_rehandshake_keeps_connection_alive() {
        let mut link = Link::established();
        for _ in 0..200 {
            link.advance(Duration::from_secs(1));
        }
        assert_eq!(link.a.state(), ConnectionState::Established);
        assert_eq!(link.b.state(), ConnectionState::Established);
    }

    #[test]
    fn test_liveness_timeout_disconnects() {
        let mut link = Link::established();
        link.up = false;

        for _ in 0..71 {
            link.advance(Duration::from_secs(1));
        }
        assert_eq!(link.a.state(), ConnectionState::Established);

        link.advance(Duration::from_secs(1));
        assert_eq!(link.a.state(), ConnectionState::Idle);
        assert_eq!(link.b.state(), ConnectionState::Idle);
        assert!(Link::has_debug(&link.a_events, "timed out"));
        assert_eq!(link.a.next_deadline(), None);
    }

    #[test]
    fn test_fragment_size_limit() {
        let mut session = Session::new(Config::default());
        assert!(matches!(
            session.set_fragment_size(1447),
            Err(Error::FragmentSizeOutOfRange { .. })
        ));
        assert_eq!(session.fragment_size(), 1446);
        assert!(session.set_fragment_size(0).is_err());
        assert!(session.set_fragment_size(512).is_ok());
        assert_eq!(session.fragment_size(), 512);
    }

    #[test]
    fn test_input_errors_leave_state_unchanged() {
        let mut session = Session::new(Config::default());
        assert!(matches!(
            session.send_text("x", Instant::now()),
            Err(Error::NotConnected)
        ));

        session.connect(addr(B)).unwrap();
        assert!(matches!(
            session.connect(addr(B + 1)),
            Err(Error::AlreadyConnected)
        ));
        assert_eq!(session.peer(), Some(addr(B)));
    }

    #[test]
    fn test_out_of_range_fragment_does_not_corrupt() {
        let mut link = Link::established();
        let now = link.now;
        let from = addr(A);

        let init = Packet::Init {
            fragment_count: 3,
            window_size: 20,
            kind: PayloadKind::Text,
        };
        link.b.handle_datagram(&init.to_bytes(), from, now);

        let data = |seq: u8, payload: &'static [u8]| {
            Packet::Data {
                window_seq: seq,
                payload: Bytes::from_static(payload),
            }
            .to_bytes()
        };
        link.b.handle_datagram(&data(0, b"a"), from, now);
        link.b.handle_datagram(&data(5, b"zzz"), from, now);
        link.b.handle_datagram(&data(1, b"b"), from, now);
        link.b.handle_datagram(&data(1, b"b"), from, now);
        link.b.handle_datagram(&data(2, b"c"), from, now);
        link.pump();

        assert_eq!(Link::messages(&link.b_events), vec!["abc".to_string()]);
        assert!(Link::has_debug(&link.b_events, "sequence 5"));
        assert_eq!(link.b.stats().duplicate_fragments, 1);
    }

    #[test]
    fn test_damaged_packet_causes_no_transition() {
        let mut session = Session::new(Config::default());
        let mut bytes = Packet::Handshake.to_bytes();
        bytes[0] ^= 0x40;

        session.handle_datagram(&bytes, addr(A), Instant::now());
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(session.peer(), None);
        assert_eq!(session.stats().checksum_failures, 1);

        let unknown = checksum::seal(vec![0x03]);
        session.handle_datagram(&unknown, addr(A), Instant::now());
        assert_eq!(session.stats().malformed_packets, 1);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_stranger_datagrams_ignored() {
        let mut link = Link::established();
        let init = Packet::Init {
            fragment_count: 1,
            window_size: 20,
            kind: PayloadKind::Text,
        };
        link.b.handle_datagram(&init.to_bytes(), addr(9999), link.now);
        link.pump();
        assert!(link.b.incoming.is_none());
    }

    #[test]
    fn test_file_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = Config::default().with_download_dir(dir.path());
        let mut link = Link::new(Config::default(), receiver);
        link.a.connect(addr(B)).unwrap();
        link.pump();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        link.a.set_fragment_size(100).unwrap();
        link.a.send_file("data.bin", data.clone(), link.now).unwrap();
        link.pump();

        assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), data);
        assert!(Link::has_debug(&link.b_events, "File saved"));
        assert!(Link::messages(&link.b_events).is_empty());
    }

    #[test]
    fn test_unwritable_destination_aborts_sender() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let receiver = Config::default().with_download_dir(missing);
        let mut link = Link::new(Config::default(), receiver);
        link.a.connect(addr(B)).unwrap();
        link.pump();

        link.a.send_file("data.bin", vec![1u8; 10], link.now).unwrap();
        link.a.send_text("after", link.now).unwrap();
        link.pump();

        assert!(link.a_events.contains(&Event::Failed(Phase::Init)));
        assert_eq!(link.a.stats().failed_transfers, 1);
        assert_eq!(Link::messages(&link.b_events), vec!["after".to_string()]);
    }

    #[test]
    fn test_empty_message_delivered() {
        let mut link = Link::established();
        link.a.send_text(Bytes::new(), link.now).unwrap();
        link.pump();

        assert_eq!(Link::messages(&link.b_events), vec![String::new()]);
        assert!(link.a.outgoing.is_idle());
    }

    #[test]
    fn test_disconnect_resets_everything() {
        let mut link = Link::established();
        link.a.send_text("pending", link.now).unwrap();
        link.a.disconnect();

        assert_eq!(link.a.state(), ConnectionState::Idle);
        assert_eq!(link.a.role(), Role::Uninitiated);
        assert_eq!(link.a.next_deadline(), None);
        for phase in [Phase::Handshake, Phase::Syn, Phase::Init, Phase::Data] {
            assert_eq!(link.a.retries(phase), 0);
        }
        assert!(link.a.outgoing.is_idle());
        assert_eq!(link.a.outgoing.queued(), 0);
    }

    /// 상대 없이 세션 하나만 구동하는 하네스
    struct Solo {
        session: Session,
        remote: SocketAddr,
        t0: Instant,
        log: Vec<Output>,
    }

    impl Solo {
        fn new(remote: SocketAddr) -> Self {
            Self {
                session: Session::new(Config::default()),
                remote,
                t0: Instant::now(),
                log: Vec::new(),
            }
        }

        /// SynAck까지 받아 연결된 Initiator
        fn initiator() -> Self {
            let mut solo = Self::new(addr(B));
            solo.session.connect(addr(B)).unwrap();
            solo.drain(solo.t0);
            solo.feed(&Packet::SynAck, solo.t0);
            assert_eq!(solo.session.state(), ConnectionState::Established);
            solo.log.clear();
            solo
        }

        /// Handshake를 받고 SynAck을 보낸 Responder
        fn responder() -> Self {
            let mut solo = Self::new(addr(A));
            solo.feed(&Packet::Handshake, solo.t0);
            assert_eq!(solo.session.state(), ConnectionState::SynSent);
            solo
        }

        fn drain(&mut self, now: Instant) {
            while let Some(output) = self.session.poll_output() {
                if let Output::Connect(_) = output {
                    self.session.on_transport_connected(now);
                }
                self.log.push(output);
            }
        }

        fn feed(&mut self, packet: &Packet, now: Instant) {
            self.session.handle_datagram(&packet.to_bytes(), self.remote, now);
            self.drain(now);
        }

        /// 1초 단위로 진행, keepalive면 30초마다 SynAck 주입
        fn run(&mut self, secs: u64, keepalive: bool) {
            for sec in 1..=secs {
                let now = self.t0 + Duration::from_secs(sec);
                if keepalive && sec % 30 == 0 {
                    self.feed(&Packet::SynAck, now);
                }
                self.session.on_timer(now);
                self.drain(now);
            }
        }

        fn failures(&self) -> Vec<Phase> {
            self.log
                .iter()
                .filter_map(|o| match o {
                    Output::Event(Event::Failed(phase)) => Some(*phase),
                    _ => None,
                })
                .collect()
        }

        fn failure_at(&self, phase: Phase) -> usize {
            self.log
                .iter()
                .position(|o| *o == Output::Event(Event::Failed(phase)))
                .unwrap()
        }

        fn has_debug(&self, needle: &str) -> bool {
            self.log
                .iter()
                .any(|o| matches!(o, Output::Event(Event::Debug(line)) if line.contains(needle)))
        }
    }

    fn packets(outputs: &[Output]) -> Vec<Packet> {
        outputs
            .iter()
            .filter_map(|o| match o {
                Output::Transmit(bytes) => Packet::from_bytes(bytes).ok(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_data_retry_exhaustion_moves_to_next_payload() {
        let mut solo = Solo::initiator();
        let t0 = solo.t0;
        solo.session.send_text("first", t0).unwrap();
        solo.session.send_text("second", t0).unwrap();
        solo.feed(&Packet::Ack(AckKind::Init), t0);

        // 3초 x 42회 재시도 = 129초, 생존 타이머(72초)는 SynAck으로 갱신
        solo.run(140, true);

        assert_eq!(solo.failures(), vec![Phase::Data]);
        let idx = solo.failure_at(Phase::Data);

        let before = packets(&solo.log[..idx]);
        let data_sent = before
            .iter()
            .filter(|p| matches!(p, Packet::Data { .. }))
            .count();
        assert_eq!(data_sent, 43);

        let after = packets(&solo.log[idx..]);
        assert!(matches!(
            after.first(),
            Some(Packet::Init {
                fragment_count: 1,
                kind: PayloadKind::Text,
                ..
            })
        ));
        assert!(!after.iter().any(|p| matches!(p, Packet::Data { .. })));

        assert_eq!(solo.session.stats().failed_transfers, 1);
        assert_eq!(solo.session.state(), ConnectionState::Established);
        assert!(solo.session.outgoing.awaiting_init_ack());
    }

    #[test]
    fn test_init_retry_exhaustion_moves_to_next_payload() {
        let mut solo = Solo::initiator();
        let t0 = solo.t0;
        solo.session.send_text("first", t0).unwrap();
        solo.session.send_text("second", t0).unwrap();

        solo.run(60, true);

        assert_eq!(solo.failures(), vec![Phase::Init]);
        let idx = solo.failure_at(Phase::Init);

        let inits_before = packets(&solo.log[..idx])
            .iter()
            .filter(|p| matches!(p, Packet::Init { .. }))
            .count();
        assert_eq!(inits_before, 43);

        let after = packets(&solo.log[idx..]);
        assert!(matches!(after.first(), Some(Packet::Init { .. })));
        assert_eq!(solo.session.outgoing.queued(), 1);
        assert_eq!(solo.session.stats().failed_transfers, 1);
        assert_eq!(solo.session.state(), ConnectionState::Established);
    }

    #[test]
    fn test_syn_retry_exhaustion_before_established() {
        let mut solo = Solo::responder();
        solo.run(60, false);

        assert_eq!(solo.failures(), vec![Phase::Syn]);
        let idx = solo.failure_at(Phase::Syn);
        let syn_acks = packets(&solo.log[..idx])
            .iter()
            .filter(|p| **p == Packet::SynAck)
            .count();
        assert_eq!(syn_acks, 43);
        assert!(packets(&solo.log[idx..]).is_empty());

        assert_eq!(solo.session.state(), ConnectionState::Idle);
        assert_eq!(solo.session.role(), Role::Uninitiated);
        assert_eq!(solo.session.next_deadline(), None);
        assert!(solo.log.contains(&Output::Close));
    }

    #[test]
    fn test_liveness_timeout_fails_active_transfer() {
        let mut solo = Solo::initiator();
        let t0 = solo.t0;
        solo.session.send_text("first", t0).unwrap();
        solo.session.send_text("second", t0).unwrap();
        solo.feed(&Packet::Ack(AckKind::Init), t0);

        // 데이터 재시도가 끝나기 전에 72초 생존 타이머가 만료됨
        solo.run(80, false);

        assert_eq!(solo.failures(), vec![Phase::Data]);
        assert!(solo.has_debug("timed out"));
        assert!(solo.has_debug("Dropped 2 pending transfer(s)."));
        assert_eq!(solo.session.stats().failed_transfers, 1);
        assert_eq!(solo.session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_resent_empty_init_delivered_once() {
        let mut link = Link::established();
        let empty = Packet::Init {
            fragment_count: 0,
            window_size: 20,
            kind: PayloadKind::Text,
        }
        .to_bytes();

        let drain_b = |link: &mut Link| {
            let (mut acks, mut messages) = (0, 0);
            while let Some(output) = link.b.poll_output() {
                match output {
                    Output::Transmit(bytes)
                        if Packet::from_bytes(&bytes).unwrap() == Packet::Ack(AckKind::Init) =>
                    {
                        acks += 1
                    }
                    Output::Event(Event::Message(_)) => messages += 1,
                    _ => {}
                }
            }
            (acks, messages)
        };

        // 첫 ACK가 유실되어 같은 Init이 다시 옴
        link.b.handle_datagram(&empty, addr(A), link.now);
        link.b.handle_datagram(&empty, addr(A), link.now);
        assert_eq!(drain_b(&mut link), (2, 1));

        // 다른 전송이 끝난 뒤의 빈 메시지는 새 전송
        link.a.send_text("next", link.now).unwrap();
        link.pump();
        assert_eq!(Link::messages(&link.b_events), vec!["next".to_string()]);

        link.b.handle_datagram(&empty, addr(A), link.now);
        assert_eq!(drain_b(&mut link), (1, 1));
    }
}
