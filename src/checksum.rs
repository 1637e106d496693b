//! 16비트 체크섬 (CRC-16/CCITT-FALSE)
//!
//! 모든 패킷의 마지막 2바이트는 앞의 전체 바이트에 대한 체크섬 (little-endian)

/// 체크섬 트레일러 길이
pub const CHECKSUM_LEN: usize = 2;

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// 바이트열의 CRC-16 계산
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(INIT, |crc, &b| {
        let idx = ((crc >> 8) ^ b as u16) as usize;
        (crc << 8) ^ TABLE[idx]
    })
}

/// 체크섬 트레일러 추가
pub fn seal(mut bytes: Vec<u8>) -> Vec<u8> {
    let sum = crc16(&bytes);
    bytes.extend_from_slice(&sum.to_le_bytes());
    bytes
}

/// 트레일러 분리 후 (본문, 기대값, 실제값) 반환
///
/// 트레일러조차 없는 길이면 `None`
pub fn split(bytes: &[u8]) -> Option<(&[u8], u16, u16)> {
    if bytes.len() < CHECKSUM_LEN {
        return None;
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    Some((body, expected, crc16(body)))
}

/// 체크섬 검증
pub fn verify(bytes: &[u8]) -> bool {
    matches!(split(bytes), Some((_, expected, got)) if expected == got)
}
