//! 패킷 정의 및 인코딩/디코딩
//!
//! 모든 패킷은 `[tag] + 본문 + checksum(2)` 형태의 고정 바이너리 프레임.
//! 정수는 전부 little-endian.
//!
//! | 패킷      | 레이아웃                                                   |
//! |-----------|------------------------------------------------------------|
//! | Handshake | `[tag]`                                                    |
//! | SynAck    | `[tag]`                                                    |
//! | Ack       | `[tag][ack_kind]`                                          |
//! | Init      | `[tag][fragment_count:u32][window:u8][0x01 또는 파일명]`   |
//! | Data      | `[tag][window_seq:u8][payload]`                            |
//! | Error     | `[tag][reason utf-8]`                                      |

use std::fmt;

use bytes::Bytes;

use crate::checksum::{self, CHECKSUM_LEN};
use crate::{Error, Result, MAX_FILE_NAME_LEN};

/// Init 패킷의 텍스트 메시지 표식
pub const TEXT_MARKER: u8 = 0x01;

/// 패킷 타입 (단일 바이트 태그, 비트 플래그 아님)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 1,
    SynAck = 2,
    Ack = 4,
    Init = 8,
    Data = 16,
    Error = 32,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(PacketType::Handshake),
            2 => Ok(PacketType::SynAck),
            4 => Ok(PacketType::Ack),
            8 => Ok(PacketType::Init),
            16 => Ok(PacketType::Data),
            32 => Ok(PacketType::Error),
            other => Err(Error::UnknownPacketType(other)),
        }
    }
}

/// ACK 종류 (Ack 패킷의 두 번째 바이트)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckKind {
    Handshake = 1,
    Init = 8,
    Data = 16,
}

impl TryFrom<u8> for AckKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AckKind::Handshake),
            8 => Ok(AckKind::Init),
            16 => Ok(AckKind::Data),
            other => Err(Error::UnknownAckKind(other)),
        }
    }
}

/// 전송 페이로드 종류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    /// 텍스트 메시지
    Text,
    /// 파일 (전송된 파일명)
    File(String),
}

impl PayloadKind {
    /// Init 패킷에 들어가는 표식 바이트
    fn marker(&self) -> Vec<u8> {
        match self {
            PayloadKind::Text => vec![TEXT_MARKER],
            PayloadKind::File(name) => truncate_name(name).as_bytes().to_vec(),
        }
    }

    fn from_marker(marker: &[u8]) -> Self {
        if marker == [TEXT_MARKER] {
            PayloadKind::Text
        } else {
            PayloadKind::File(String::from_utf8_lossy(marker).into_owned())
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "message"),
            PayloadKind::File(name) => write!(f, "file \"{}\"", name),
        }
    }
}

/// 디코딩된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake,
    SynAck,
    Ack(AckKind),
    Init {
        fragment_count: u32,
        window_size: u8,
        kind: PayloadKind,
    },
    Data {
        window_seq: u8,
        payload: Bytes,
    },
    Error(String),
}

impl Packet {
    /// 패킷 타입 반환
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Handshake => PacketType::Handshake,
            Packet::SynAck => PacketType::SynAck,
            Packet::Ack(_) => PacketType::Ack,
            Packet::Init { .. } => PacketType::Init,
            Packet::Data { .. } => PacketType::Data,
            Packet::Error(_) => PacketType::Error,
        }
    }

    /// 체크섬을 포함한 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.body_len() + CHECKSUM_LEN);
        buf.push(self.packet_type() as u8);

        match self {
            Packet::Handshake | Packet::SynAck => {}
            Packet::Ack(kind) => buf.push(*kind as u8),
            Packet::Init {
                fragment_count,
                window_size,
                kind,
            } => {
                buf.extend_from_slice(&fragment_count.to_le_bytes());
                buf.push(*window_size);
                buf.extend_from_slice(&kind.marker());
            }
            Packet::Data {
                window_seq,
                payload,
            } => {
                buf.push(*window_seq);
                buf.extend_from_slice(payload);
            }
            Packet::Error(reason) => buf.extend_from_slice(reason.as_bytes()),
        }

        checksum::seal(buf)
    }

    /// 바이트에서 역직렬화
    ///
    /// 체크섬이 먼저 검증되고, 통과한 경우에만 본문을 해석함
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (body, expected, got) =
            checksum::split(bytes).ok_or(Error::Truncated { len: bytes.len() })?;
        if expected != got {
            return Err(Error::ChecksumMismatch { expected, got });
        }

        let (&tag, rest) = body.split_first().ok_or(Error::Truncated { len: bytes.len() })?;
        let truncated = || Error::Truncated { len: bytes.len() };

        match PacketType::try_from(tag)? {
            PacketType::Handshake => Ok(Packet::Handshake),
            PacketType::SynAck => Ok(Packet::SynAck),
            PacketType::Ack => {
                let &kind = rest.first().ok_or_else(truncated)?;
                Ok(Packet::Ack(AckKind::try_from(kind)?))
            }
            PacketType::Init => {
                if rest.len() < 5 {
                    return Err(truncated());
                }
                let fragment_count = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
                Ok(Packet::Init {
                    fragment_count,
                    window_size: rest[4],
                    kind: PayloadKind::from_marker(&rest[5..]),
                })
            }
            PacketType::Data => {
                let (&window_seq, payload) = rest.split_first().ok_or_else(truncated)?;
                Ok(Packet::Data {
                    window_seq,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            PacketType::Error => Ok(Packet::Error(String::from_utf8_lossy(rest).into_owned())),
        }
    }

    fn body_len(&self) -> usize {
        1 + match self {
            Packet::Handshake | Packet::SynAck => 0,
            Packet::Ack(_) => 1,
            Packet::Init { kind, .. } => 5 + kind.marker().len(),
            Packet::Data { payload, .. } => 1 + payload.len(),
            Packet::Error(reason) => reason.len(),
        }
    }
}

/// 파일명을 UTF-8 문자 경계 기준으로 42바이트 이내로 자름
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_FILE_NAME_LEN {
        return name;
    }
    let mut end = MAX_FILE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
