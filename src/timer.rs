//! 재전송/생존 타이머
//!
//! 세션이 소유하는 독립 타이머 집합. 실제 sleep은 엔진 루프가 담당하고,
//! 여기서는 마감 시각과 재시도 횟수만 관리함.
//!
//! - 재시도 타이머 (handshake, syn, init, data): 만료마다 카운터 증가,
//!   `max_retries` 초과 시 포기
//! - 단발 타이머 (liveness, idle window)
//! - 주기 타이머 (re-handshake)

use std::time::{Duration, Instant};

use crate::Config;

/// 타이머 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Handshake,
    Syn,
    Init,
    Data,
    Liveness,
    Rehandshake,
    IdleWindow,
}

impl TimerKind {
    pub const ALL: [TimerKind; 7] = [
        TimerKind::Handshake,
        TimerKind::Syn,
        TimerKind::Init,
        TimerKind::Data,
        TimerKind::Liveness,
        TimerKind::Rehandshake,
        TimerKind::IdleWindow,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// 타이머 만료 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// 재전송 필요 (몇 번째 재시도인지)
    Retry(u32),
    /// 재시도 한도 초과, 타이머 정지됨
    Exhausted,
    /// 단발/주기 타이머 만료
    Fired,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Retry { cap: u32 },
    OneShot,
    Periodic,
}

#[derive(Debug, Clone)]
struct Timer {
    interval: Duration,
    mode: Mode,
    deadline: Option<Instant>,
    fires: u32,
}

impl Timer {
    fn new(interval: Duration, mode: Mode) -> Self {
        Self {
            interval,
            mode,
            deadline: None,
            fires: 0,
        }
    }
}

/// 세션 타이머 집합
#[derive(Debug, Clone)]
pub struct Timers {
    timers: Vec<Timer>,
}

impl Timers {
    pub fn new(config: &Config) -> Self {
        let retry = Mode::Retry {
            cap: config.max_retries,
        };
        let timers = TimerKind::ALL
            .iter()
            .map(|kind| match kind {
                TimerKind::Handshake => Timer::new(config.handshake_retry_interval, retry),
                TimerKind::Syn => Timer::new(config.syn_retry_interval, retry),
                TimerKind::Init => Timer::new(config.init_retry_interval, retry),
                TimerKind::Data => Timer::new(config.data_retry_interval, retry),
                TimerKind::Liveness => Timer::new(config.liveness_timeout, Mode::OneShot),
                TimerKind::Rehandshake => Timer::new(config.rehandshake_interval, Mode::Periodic),
                TimerKind::IdleWindow => Timer::new(config.idle_window_timeout, Mode::OneShot),
            })
            .collect();

        Self { timers }
    }

    /// 타이머 (재)시작, 재시도 카운터 초기화
    pub fn start(&mut self, kind: TimerKind, now: Instant) {
        let timer = &mut self.timers[kind.index()];
        timer.fires = 0;
        timer.deadline = Some(now + timer.interval);
    }

    /// 타이머 정지, 재시도 카운터 초기화
    pub fn stop(&mut self, kind: TimerKind) {
        let timer = &mut self.timers[kind.index()];
        timer.fires = 0;
        timer.deadline = None;
    }

    /// 전체 정지
    pub fn stop_all(&mut self) {
        for kind in TimerKind::ALL {
            self.stop(kind);
        }
    }

    pub fn is_running(&self, kind: TimerKind) -> bool {
        self.timers[kind.index()].deadline.is_some()
    }

    /// 현재까지의 만료 횟수
    pub fn fires(&self, kind: TimerKind) -> u32 {
        self.timers[kind.index()].fires
    }

    /// 가장 이른 마감 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|t| t.deadline).min()
    }

    /// 만료된 타이머 하나를 꺼냄
    ///
    /// 핸들러가 다른 타이머를 멈출 수 있으므로 한 번에 하나씩 처리해야 함
    pub fn poll(&mut self, now: Instant) -> Option<(TimerKind, Expiry)> {
        let (idx, _) = self
            .timers
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.deadline.map(|d| (i, d)))
            .filter(|&(_, d)| d <= now)
            .min_by_key(|&(_, d)| d)?;

        let kind = TimerKind::ALL[idx];
        let timer = &mut self.timers[idx];

        let expiry = match timer.mode {
            Mode::Retry { cap } => {
                timer.fires += 1;
                if timer.fires > cap {
                    timer.deadline = None;
                    Expiry::Exhausted
                } else {
                    timer.deadline = Some(now + timer.interval);
                    Expiry::Retry(timer.fires)
                }
            }
            Mode::OneShot => {
                timer.deadline = None;
                Expiry::Fired
            }
            Mode::Periodic => {
                timer.deadline = Some(now + timer.interval);
                Expiry::Fired
            }
        };

        Some((kind, expiry))
    }
}
