//! 수신측 재조립
//!
//! - Init으로 수신 컨텍스트 생성
//! - 윈도우 단위 재정렬 버퍼
//! - 윈도우가 차면 순서대로 싱크(메시지 버퍼 또는 파일)에 기록

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::packet::PayloadKind;
use crate::{Error, Result};

/// 파일명이 비었거나 쓸 수 없을 때의 기본 이름
pub const DEFAULT_FILE_NAME: &str = "received.bin";

/// 데이터 프래그먼트 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// 저장됨, 윈도우 미완성
    Stored,
    /// 이미 받은 슬롯 (덮어쓰기만, 카운트 없음)
    Duplicate,
    /// 윈도우 범위 밖, 버려짐
    OutOfRange { limit: u32 },
    /// 윈도우 완성, 싱크에 기록됨
    WindowFlushed,
}

/// 완료된 수신
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    Message { text: String, crc32: u32 },
    File { path: PathBuf, len: u64, crc32: u32 },
}

enum Sink {
    Message(BytesMut),
    File { path: PathBuf, file: File },
}

/// 수신 컨텍스트 (전송 하나당)
pub struct ReceiveContext {
    kind: PayloadKind,
    total_expected: u32,
    window_size: u8,
    slots: Vec<Option<Bytes>>,
    total_received: u32,
    window_received: u32,
    flushed: u32,
    bytes_written: u64,
    hasher: crc32fast::Hasher,
    sink: Sink,
}

impl ReceiveContext {
    /// Init 수신 시 컨텍스트 생성
    ///
    /// 파일이면 `download_dir` 아래에 출력 파일을 연다
    pub fn open(
        total_expected: u32,
        window_size: u8,
        kind: PayloadKind,
        download_dir: &Path,
    ) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::InvalidWindowSize(window_size));
        }

        let sink = match &kind {
            PayloadKind::Text => Sink::Message(BytesMut::new()),
            PayloadKind::File(name) => {
                let path = download_dir.join(sanitize_file_name(name));
                let file = File::create(&path)?;
                debug!("수신 파일 생성: {:?}", path);
                Sink::File { path, file }
            }
        };

        Ok(Self {
            kind,
            total_expected,
            window_size,
            slots: vec![None; window_size as usize],
            total_received: 0,
            window_received: 0,
            flushed: 0,
            bytes_written: 0,
            hasher: crc32fast::Hasher::new(),
            sink,
        })
    }

    pub fn kind(&self) -> &PayloadKind {
        &self.kind
    }

    pub fn total_expected(&self) -> u32 {
        self.total_expected
    }

    pub fn total_received(&self) -> u32 {
        self.total_received
    }

    pub fn window_received(&self) -> u32 {
        self.window_received
    }

    /// 현재 윈도우에 들어올 수 있는 프래그먼트 수
    pub fn window_limit(&self) -> u32 {
        (self.window_size as u32).min(self.total_expected - self.flushed)
    }

    /// 윈도우 완성 기준
    ///
    /// 마지막 프래그먼트까지 받았으면 현재 윈도우 수신 개수로 축소
    fn threshold(&self) -> u32 {
        if self.total_received == self.total_expected {
            self.window_received
        } else {
            self.window_size as u32
        }
    }

    /// 모든 프래그먼트가 싱크에 기록되었는지
    pub fn is_finished(&self) -> bool {
        self.flushed == self.total_expected
    }

    /// 데이터 프래그먼트 삽입
    pub fn accept(&mut self, window_seq: u8, payload: Bytes) -> Result<DataOutcome> {
        let limit = self.window_limit();
        if window_seq as u32 >= limit {
            return Ok(DataOutcome::OutOfRange { limit });
        }

        let slot = &mut self.slots[window_seq as usize];
        let first_arrival = slot.is_none();
        *slot = Some(payload);

        if !first_arrival {
            return Ok(DataOutcome::Duplicate);
        }

        self.total_received += 1;
        self.window_received += 1;

        if self.window_received < self.threshold() {
            return Ok(DataOutcome::Stored);
        }

        self.flush_window()?;
        Ok(DataOutcome::WindowFlushed)
    }

    /// 정체된 윈도우 폐기
    ///
    /// 재전송된 배치가 처음부터 다시 채울 수 있게 함
    pub fn discard_window(&mut self) -> u32 {
        let dropped = self.window_received;
        self.total_received -= dropped;
        self.window_received = 0;
        self.slots.iter_mut().for_each(|slot| *slot = None);
        dropped
    }

    fn flush_window(&mut self) -> Result<()> {
        let count = self.window_received as usize;

        for slot in self.slots.iter_mut().take(count) {
            let Some(data) = slot.take() else {
                continue;
            };
            self.hasher.update(&data);
            self.bytes_written += data.len() as u64;

            match &mut self.sink {
                Sink::Message(buf) => buf.extend_from_slice(&data),
                Sink::File { file, .. } => file.write_all(&data)?,
            }
        }

        self.flushed += self.window_received;
        self.window_received = 0;
        Ok(())
    }

    /// 수신 종료: 파일 닫기 또는 메시지 반환
    pub fn finish(self) -> Result<Completed> {
        let crc32 = self.hasher.finalize();
        match self.sink {
            Sink::Message(buf) => Ok(Completed::Message {
                text: String::from_utf8_lossy(&buf).into_owned(),
                crc32,
            }),
            Sink::File { path, mut file } => {
                file.flush()?;
                file.sync_all()?;
                Ok(Completed::File {
                    path,
                    len: self.bytes_written,
                    crc32,
                })
            }
        }
    }
}

/// 전송된 파일명에서 경로 요소 제거
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_matches(char::from(0))
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        DEFAULT_FILE_NAME.to_string()
    } else {
        base.to_string()
    }
}
