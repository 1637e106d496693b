//! 전송 통계

use std::time::{Duration, Instant};

/// 세션 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 송신 패킷 수
    pub packets_sent: u64,

    /// 수신 패킷 수 (버려진 것 포함)
    pub packets_received: u64,

    /// 송신 바이트 (체크섬 포함)
    pub bytes_sent: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// 체크섬 불일치로 버려진 패킷
    pub checksum_failures: u64,

    /// 해석 불가로 버려진 패킷
    pub malformed_packets: u64,

    /// 송신 Data 프래그먼트 수 (재전송 포함)
    pub fragments_sent: u64,

    /// 재전송된 프래그먼트 수
    pub retransmitted_fragments: u64,

    /// 수신 Data 프래그먼트 수 (첫 도착만)
    pub fragments_received: u64,

    /// 중복 수신 프래그먼트 수
    pub duplicate_fragments: u64,

    /// 정체로 폐기된 윈도우 수
    pub discarded_windows: u64,

    /// 완료된 송신 전송 수
    pub transfers_sent: u64,

    /// 완료된 수신 전송 수
    pub transfers_received: u64,

    /// 실패/포기된 전송 수
    pub failed_transfers: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            checksum_failures: 0,
            malformed_packets: 0,
            fragments_sent: 0,
            retransmitted_fragments: 0,
            fragments_received: 0,
            duplicate_fragments: 0,
            discarded_windows: 0,
            transfers_sent: 0,
            transfers_received: 0,
            failed_transfers: 0,
        }
    }

    /// 패킷 송신 기록
    pub fn record_sent(&mut self, len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
    }

    /// 패킷 수신 기록
    pub fn record_received(&mut self, len: usize) {
        self.packets_received += 1;
        self.bytes_received += len as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.fragments_sent == 0 {
            return 0.0;
        }
        self.retransmitted_fragments as f64 / self.fragments_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Packets: {} sent / {} recv | Send: {:.1} KB/s | Transfers: {} sent / {} recv / {} failed | Retransmit: {:.1}% | Checksum drops: {}",
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.packets_received,
            self.send_throughput() / 1024.0,
            self.transfers_sent,
            self.transfers_received,
            self.failed_transfers,
            self.retransmit_ratio() * 100.0,
            self.checksum_failures,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
