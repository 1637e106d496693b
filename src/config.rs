//! 프로토콜 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result, ACK_WINDOW, MAX_FRAGMENT_SIZE, MAX_RETRIES};

/// WFP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 프래그먼트 크기 (바이트, 최대 1446)
    pub fragment_size: usize,

    /// ACK 윈도우 크기 (배치당 프래그먼트 수)
    pub ack_window: u8,

    /// 재전송 타이머별 최대 재시도 횟수
    pub max_retries: u32,

    /// Handshake 재전송 간격
    pub handshake_retry_interval: Duration,

    /// SynAck 재전송 간격
    pub syn_retry_interval: Duration,

    /// Init 재전송 간격
    pub init_retry_interval: Duration,

    /// Data 배치 재전송 간격
    pub data_retry_interval: Duration,

    /// 연결 생존 타임아웃
    /// 이 시간 동안 handshake 응답이 없으면 연결 종료
    pub liveness_timeout: Duration,

    /// 주기적 재-handshake 간격
    pub rehandshake_interval: Duration,

    /// 수신 윈도우 정체 감지 시간
    pub idle_window_timeout: Duration,

    /// 수신 파일 저장 디렉터리
    pub download_dir: PathBuf,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 이벤트 채널 용량
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fragment_size: MAX_FRAGMENT_SIZE,
            ack_window: ACK_WINDOW,
            max_retries: MAX_RETRIES,
            handshake_retry_interval: Duration::from_secs(1),
            syn_retry_interval: Duration::from_secs(1),
            init_retry_interval: Duration::from_secs(1),
            data_retry_interval: Duration::from_secs(3),
            liveness_timeout: Duration::from_secs(72),
            rehandshake_interval: Duration::from_secs(60),
            idle_window_timeout: Duration::from_secs(1),
            download_dir: PathBuf::from("."),
            recv_buffer_size: 65535,
            event_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 수신 파일 저장 위치 지정
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// 설정값 범위 검증
    pub fn validate(&self) -> Result<()> {
        check_fragment_size(self.fragment_size)?;
        if self.ack_window == 0 {
            return Err(Error::InvalidWindowSize(self.ack_window));
        }
        Ok(())
    }

    /// 같은 LAN 안의 피어용 설정
    pub fn lan() -> Self {
        Self {
            handshake_retry_interval: Duration::from_millis(250),
            syn_retry_interval: Duration::from_millis(250),
            init_retry_interval: Duration::from_millis(250),
            data_retry_interval: Duration::from_millis(750),
            idle_window_timeout: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            fragment_size: 1024,          // 작은 프래그먼트
            ack_window: 10,               // 배치 손실 비용 감소
            data_retry_interval: Duration::from_secs(2),
            idle_window_timeout: Duration::from_millis(1500),
            ..Self::default()
        }
    }
}

/// 프래그먼트 크기 범위 확인 (1..=1446)
pub fn check_fragment_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_FRAGMENT_SIZE {
        return Err(Error::FragmentSizeOutOfRange {
            size,
            max: MAX_FRAGMENT_SIZE,
        });
    }
    Ok(())
}
