//! 전송 식별자, 상태, 재전송 타이머
//!
//! 송신/수신 상태 기계가 공유하는 타입들

use std::fmt;
use std::time::Duration;

use crate::config::{Backoff, Config};

/// 에코(다운로드) 전송 표시 비트
const ECHO_BIT: u32 = 0x8000_0000;

/// 전송 식별자 (32비트)
///
/// 최상위 비트가 0이면 클라이언트 → 서버 업로드,
/// 1이면 서버 → 클라이언트 에코 전송
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u32);

impl TransferId {
    pub fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }

    /// 임의의 업로드 식별자 생성
    pub fn random_upload() -> Self {
        Self(rand::random::<u32>() & !ECHO_BIT)
    }

    /// 이 업로드에 대응하는 에코 전송 식별자
    pub fn echo(self) -> Self {
        Self(self.0 | ECHO_BIT)
    }

    pub fn direction(self) -> Direction {
        if self.0 & ECHO_BIT == 0 {
            Direction::Upload
        } else {
            Direction::Download
        }
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// 전송 방향 (클라이언트 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// 전송 상태
///
/// 송신측: Sending → AwaitingFinAck → Complete
/// 수신측: Receiving → AwaitingFin → Complete
/// 어느 상태에서든 재전송 한도 초과 시 Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// DATA 전송 중, ACK 대기
    Sending,

    /// 모든 DATA가 ACK됨, 수신측 FIN 대기
    AwaitingFinAck,

    /// DATA 수신 중
    Receiving,

    /// 조립 완료 후 FIN 전송, FIN-ACK 대기
    AwaitingFin,

    Complete,

    Failed,
}

impl TransferState {
    /// 종료 상태 여부
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Sending => "SENDING",
            TransferState::AwaitingFinAck => "AWAITING_FIN_ACK",
            TransferState::Receiving => "RECEIVING",
            TransferState::AwaitingFin => "AWAITING_FIN",
            TransferState::Complete => "COMPLETE",
            TransferState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// 재전송 타이머 정책
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    base: Duration,
    max: Duration,
    backoff: Backoff,
    max_retries: u32,
}

impl RetransmitTimer {
    pub fn new(config: &Config) -> Self {
        Self {
            base: config.retransmit_timeout(),
            max: config.max_retransmit_timeout(),
            backoff: config.backoff,
            max_retries: config.max_retries,
        }
    }

    /// `retries`번 재전송된 프레임의 다음 타임아웃
    pub fn timeout(&self, retries: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(retries.min(16)).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor).min(self.max)
            }
        }
    }

    /// 재전송 한도 소진 여부
    pub fn exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }

    /// 상대가 한 프레임을 최대로 재전송하는 데 걸리는 전체 시간
    ///
    /// FIN 대기와 완료 후 linger 기간으로 쓰인다.
    pub fn retry_span(&self) -> Duration {
        (0..=self.max_retries)
            .map(|retries| self.timeout(retries))
            .fold(self.base, |acc, t| acc.saturating_add(t))
    }
}
