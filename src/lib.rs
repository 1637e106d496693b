//! # WFP (Windowed Fragment Protocol)
//!
//! UDP 기반 ACK 윈도우 조각 전송 프로토콜
//!
//! ## 핵심 특징
//! - **대칭 피어**: 같은 프로그램이 listen/connect 모두 수행
//! - **3-way 핸드셰이크**: Handshake → SynAck → Ack, 역할 자동 결정
//! - **윈도우 배치 전송**: 최대 20개 프래그먼트마다 ACK 한 번
//! - **CRC-16 무결성**: 손상된 데이터그램은 조용히 폐기
//! - **재시도 한도**: 단계별 최대 42회 재전송 후 포기
//! - **생존 확인**: 주기적 re-handshake, 72초 무응답 시 연결 종료
//!
//! ## 구조
//! - [`session::Session`]: 소켓 없는 상태 머신 (테스트 가능)
//! - [`engine::Engine`]: tokio UDP 소켓 위에서 세션을 구동하는 핸들

pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod timer;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use packet::{AckKind, Packet, PacketType, PayloadKind};
pub use session::{ConnectionState, Event, Phase, Role, Session};
pub use stats::TransferStats;

/// 최대 프래그먼트 페이로드 크기 (바이트)
pub const MAX_FRAGMENT_SIZE: usize = 1446;

/// ACK 하나당 프래그먼트 수
pub const ACK_WINDOW: u8 = 20;

/// 단계별 최대 재전송 횟수
pub const MAX_RETRIES: u32 = 42;

/// Init 패킷에 실리는 파일명 최대 길이 (바이트)
pub const MAX_FILE_NAME_LEN: usize = 42;
