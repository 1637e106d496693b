//! 송신측 전송 상태
//!
//! - 페이로드 큐 (한 번에 하나씩 전송)
//! - 프래그먼트 분할 및 윈도우 단위 배치
//! - 손상 테스트용 단발 변조

use std::collections::VecDeque;

use bytes::Bytes;
use rand::Rng;

use crate::packet::{Packet, PayloadKind};

/// 송신 프래그먼트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 윈도우 내 순번 (0..window)
    pub window_seq: u8,
    pub data: Bytes,
}

/// 페이로드를 프래그먼트로 분할
///
/// 순번은 전체 개수와 무관하게 `window`마다 0으로 돌아감
pub fn split_fragments(payload: &Bytes, fragment_size: usize, window: u8) -> Vec<Fragment> {
    let window = window.max(1) as usize;
    (0..payload.len())
        .step_by(fragment_size.max(1))
        .enumerate()
        .map(|(idx, offset)| {
            let end = (offset + fragment_size).min(payload.len());
            Fragment {
                window_seq: (idx % window) as u8,
                data: payload.slice(offset..end),
            }
        })
        .collect()
}

/// 전송 대기 페이로드
#[derive(Debug, Clone)]
pub struct Payload {
    pub kind: PayloadKind,
    pub data: Bytes,
    /// 큐에 들어갈 때의 프래그먼트 크기
    pub fragment_size: usize,
}

impl Payload {
    pub fn text(data: impl Into<Bytes>, fragment_size: usize) -> Self {
        Self {
            kind: PayloadKind::Text,
            data: data.into(),
            fragment_size,
        }
    }

    pub fn file(name: impl Into<String>, data: impl Into<Bytes>, fragment_size: usize) -> Self {
        Self {
            kind: PayloadKind::File(name.into()),
            data: data.into(),
            fragment_size,
        }
    }

    pub fn fragment_count(&self) -> usize {
        self.data.len().div_ceil(self.fragment_size.max(1))
    }

    /// Init 패킷 생성
    pub fn init_packet(&self, window: u8) -> Packet {
        Packet::Init {
            fragment_count: self.fragment_count() as u32,
            window_size: window,
            kind: self.kind.clone(),
        }
    }

    /// 로그용 설명
    pub fn describe(&self) -> String {
        format!("{} ({} bytes)", self.kind, self.data.len())
    }
}

/// 첫 프래그먼트 변조 표시
#[derive(Debug, Clone, Copy)]
struct CorruptionMark {
    byte: usize,
    mask: u8,
}

/// 현재 전송 중인 배치
#[derive(Debug)]
pub struct SendBatch {
    payload: Payload,
    fragments: Vec<Fragment>,
    window: usize,
    batch_index: usize,
    corruption: Option<CorruptionMark>,
}

impl SendBatch {
    pub fn new(payload: Payload, window: u8, corrupt: bool) -> Self {
        let fragments = split_fragments(&payload.data, payload.fragment_size, window);

        let corruption = match fragments.first() {
            Some(first) if corrupt && !first.data.is_empty() => {
                let mut rng = rand::thread_rng();
                Some(CorruptionMark {
                    byte: rng.gen_range(0..first.data.len()),
                    mask: rng.gen_range(1..=u8::MAX),
                })
            }
            _ => None,
        };

        Self {
            payload,
            fragments,
            window: window.max(1) as usize,
            batch_index: 0,
            corruption,
        }
    }

    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    pub fn total_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// 현재 배치의 프래그먼트 (`[batch*window, batch*window + window)`)
    pub fn current(&self) -> &[Fragment] {
        let start = (self.batch_index * self.window).min(self.fragments.len());
        let end = (start + self.window).min(self.fragments.len());
        &self.fragments[start..end]
    }

    /// 남은 배치가 없으면 전송 완료
    pub fn is_complete(&self) -> bool {
        self.current().is_empty()
    }

    /// 다음 배치로 이동
    pub fn advance(&mut self) {
        self.batch_index += 1;
    }

    /// 손상 테스트 표시가 아직 남아있는지
    pub fn corruption_pending(&self) -> bool {
        self.corruption.is_some()
    }

    /// 현재 배치를 전송 바이트로 인코딩
    ///
    /// 변조 표시는 전체 전송에서 단 한 번만 적용됨
    pub fn encode_current(&mut self) -> Vec<Vec<u8>> {
        let first_batch = self.batch_index == 0;
        let mut mark = if first_batch { self.corruption.take() } else { None };

        self.current()
            .iter()
            .map(|fragment| {
                let mut bytes = Packet::Data {
                    window_seq: fragment.window_seq,
                    payload: fragment.data.clone(),
                }
                .to_bytes();

                // tag + seq 다음이 페이로드
                if let Some(m) = mark.take() {
                    bytes[2 + m.byte] ^= m.mask;
                }
                bytes
            })
            .collect()
    }
}

/// 송신 진행 상태
#[derive(Debug)]
enum Stage {
    Idle,
    AwaitingInitAck,
    Sending(SendBatch),
}

/// 송신 큐 및 진행 중 전송
#[derive(Debug)]
pub struct Outgoing {
    queue: VecDeque<Payload>,
    stage: Stage,
    window: u8,
    corruption_armed: bool,
}

impl Outgoing {
    pub fn new(window: u8) -> Self {
        Self {
            queue: VecDeque::new(),
            stage: Stage::Idle,
            window: window.max(1),
            corruption_armed: false,
        }
    }

    pub fn enqueue(&mut self, payload: Payload) {
        self.queue.push_back(payload);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Idle)
    }

    pub fn awaiting_init_ack(&self) -> bool {
        matches!(self.stage, Stage::AwaitingInitAck)
    }

    pub fn set_corruption_test(&mut self, armed: bool) {
        self.corruption_armed = armed;
    }

    pub fn corruption_armed(&self) -> bool {
        self.corruption_armed
    }

    /// 대기 중인 다음 페이로드의 전송 시작
    ///
    /// 유휴 상태일 때만 Init 패킷을 돌려줌
    pub fn begin_next(&mut self) -> Option<(Packet, String)> {
        if !self.is_idle() {
            return None;
        }
        let next = self.queue.front()?;
        let init = next.init_packet(self.window);
        let description = next.describe();
        self.stage = Stage::AwaitingInitAck;
        Some((init, description))
    }

    /// 재전송용 Init 패킷
    pub fn pending_init(&self) -> Option<Packet> {
        match self.stage {
            Stage::AwaitingInitAck => self.queue.front().map(|p| p.init_packet(self.window)),
            _ => None,
        }
    }

    /// Init ACK 수신: 큐에서 꺼내 프래그먼트 분할 시작
    ///
    /// 손상 테스트는 변조할 바이트가 실제로 정해졌을 때만 소모됨
    /// (빈 페이로드는 다음 전송으로 넘김)
    pub fn on_init_ack(&mut self) -> Option<&mut SendBatch> {
        if !self.awaiting_init_ack() {
            return None;
        }
        let payload = self.queue.pop_front()?;
        let batch = SendBatch::new(payload, self.window, self.corruption_armed);
        if batch.corruption_pending() {
            self.corruption_armed = false;
        }
        self.stage = Stage::Sending(batch);
        self.batch_mut()
    }

    pub fn batch_mut(&mut self) -> Option<&mut SendBatch> {
        match &mut self.stage {
            Stage::Sending(batch) => Some(batch),
            _ => None,
        }
    }

    /// 전송 완료 처리
    pub fn finish(&mut self) -> Option<Payload> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Sending(batch) => Some(batch.payload),
            _ => None,
        }
    }

    /// 진행 중 전송 포기
    pub fn abort(&mut self) -> Option<Payload> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::Idle => None,
            Stage::AwaitingInitAck => self.queue.pop_front(),
            Stage::Sending(batch) => Some(batch.payload),
        }
    }

    /// 큐와 진행 상태 모두 제거
    pub fn clear(&mut self) {
        self.queue.clear();
        self.stage = Stage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_fragments_hello_world() {
        let payload = Bytes::from_static(b"HELLO WORLD");
        let fragments = split_fragments(&payload, 10, 20);

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].window_seq, 0);
        assert_eq!(fragments[0].data.as_ref(), b"HELLO WORL");
        assert_eq!(fragments[1].window_seq, 1);
        assert_eq!(fragments[1].data.as_ref(), b"D");
    }

    #[test]
    fn test_window_seq_cycles() {
        let payload = Bytes::from(vec![7u8; 45]);
        let fragments = split_fragments(&payload, 1, 20);

        assert_eq!(fragments.len(), 45);
        assert_eq!(fragments[19].window_seq, 19);
        assert_eq!(fragments[20].window_seq, 0);
        assert_eq!(fragments[44].window_seq, 4);
    }

    #[test]
    fn test_fragment_count_is_ceiling() {
        for (len, expected) in [(0, 0), (1, 1), (9, 1), (10, 1), (11, 2), (200, 20), (201, 21)] {
            let payload = Payload::text(vec![0u8; len], 10);
            assert_eq!(payload.fragment_count(), expected, "len {}", len);
            assert_eq!(split_fragments(&payload.data, 10, 20).len(), expected);
        }
    }

    #[test]
    fn test_batches_slice_by_window() {
        let payload = Payload::text(vec![1u8; 45], 1);
        let mut batch = SendBatch::new(payload, 20, false);

        assert_eq!(batch.current().len(), 20);
        batch.advance();
        assert_eq!(batch.current().len(), 20);
        batch.advance();
        assert_eq!(batch.current().len(), 5);
        assert!(!batch.is_complete());
        batch.advance();
        assert!(batch.is_complete());
    }

    #[test]
    fn test_corruption_is_one_shot() {
        let payload = Payload::text(b"HELLO WORLD".to_vec(), 10);
        let mut clean = SendBatch::new(payload.clone(), 20, false);
        let mut batch = SendBatch::new(payload, 20, true);
        assert!(batch.corruption_pending());

        let expected = clean.encode_current();
        let first = batch.encode_current();
        assert!(!batch.corruption_pending());

        // 첫 프래그먼트의 정확히 한 바이트만 다름
        let diff: usize = first[0]
            .iter()
            .zip(expected[0].iter())
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(diff, 1);
        assert_eq!(first[1], expected[1]);

        // 재전송은 깨끗함
        assert_eq!(batch.encode_current(), expected);
    }

    #[test]
    fn test_outgoing_drains_one_at_a_time() {
        let mut outgoing = Outgoing::new(20);
        outgoing.enqueue(Payload::text(b"first".to_vec(), 10));
        outgoing.enqueue(Payload::text(b"second".to_vec(), 10));

        let (init, _) = outgoing.begin_next().unwrap();
        assert!(matches!(init, Packet::Init { fragment_count: 1, window_size: 20, .. }));
        assert!(outgoing.begin_next().is_none());
        assert_eq!(outgoing.queued(), 2);

        assert!(outgoing.on_init_ack().is_some());
        assert_eq!(outgoing.queued(), 1);
        assert!(outgoing.on_init_ack().is_none());

        let done = outgoing.finish().unwrap();
        assert_eq!(done.data.as_ref(), b"first");
        assert!(outgoing.begin_next().is_some());
    }

    #[test]
    fn test_corruption_flag_consumed_by_init_ack() {
        let mut outgoing = Outgoing::new(20);
        outgoing.set_corruption_test(true);
        outgoing.enqueue(Payload::text(b"abc".to_vec(), 10));
        outgoing.begin_next();

        let batch = outgoing.on_init_ack().unwrap();
        assert!(batch.corruption_pending());
        assert!(!outgoing.corruption_armed());
    }

    #[test]
    fn test_empty_payload_keeps_corruption_armed() {
        let mut outgoing = Outgoing::new(20);
        outgoing.set_corruption_test(true);
        outgoing.enqueue(Payload::text(Vec::new(), 10));
        outgoing.enqueue(Payload::text(b"abc".to_vec(), 10));

        outgoing.begin_next();
        let batch = outgoing.on_init_ack().unwrap();
        assert!(!batch.corruption_pending());
        assert!(batch.is_complete());
        assert!(outgoing.corruption_armed());
        outgoing.finish();

        outgoing.begin_next();
        let batch = outgoing.on_init_ack().unwrap();
        assert!(batch.corruption_pending());
        assert!(!outgoing.corruption_armed());
    }
}
