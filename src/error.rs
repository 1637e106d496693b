//! 에러 타입 정의

use thiserror::Error;

/// WFP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("포트 번호로 변환할 수 없음: {0:?}")]
    InvalidPort(String),

    #[error("IP 주소로 변환할 수 없음: {0:?}")]
    InvalidAddress(String),

    #[error("포트 {port} 바인딩 실패: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("이미 연결됨, 먼저 연결을 끊어야 함")]
    AlreadyConnected,

    #[error("연결되지 않음")]
    NotConnected,

    #[error("프래그먼트 크기 범위 초과: {size} (1..={max})")]
    FragmentSizeOutOfRange { size: usize, max: usize },

    #[error("패킷 길이 부족: {len} bytes")]
    Truncated { len: usize },

    #[error("알 수 없는 패킷 타입: {0}")]
    UnknownPacketType(u8),

    #[error("알 수 없는 ACK 종류: {0}")]
    UnknownAckKind(u8),

    #[error("체크섬 불일치: expected {expected:04X}, got {got:04X}")]
    ChecksumMismatch { expected: u16, got: u16 },

    #[error("유효하지 않은 윈도우 크기: {0}")]
    InvalidWindowSize(u8),

    #[error("채널 에러")]
    ChannelError,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
