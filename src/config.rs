//! 프로토콜 설정

use std::str::FromStr;
use std::time::Duration;

use crate::frame::HEADER_LEN;
use crate::transfer::RetransmitTimer;
use crate::{Error, Result, DEFAULT_LISTEN_PORT, MAX_DATAGRAM_SIZE};

/// 재전송 타이머 백오프 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// 매 재전송마다 같은 타임아웃
    #[default]
    Fixed,

    /// 재전송마다 타임아웃 2배 (max_retransmit_timeout_ms 상한)
    Exponential,
}

impl FromStr for Backoff {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" | "exp" => Ok(Backoff::Exponential),
            other => Err(Error::InvalidConfig(format!("알 수 없는 backoff: {other}"))),
        }
    }
}

/// RFT 프로토콜 설정
///
/// 세션 시작 시 한 번 읽히며 이후 변경되지 않는다.
#[derive(Debug, Clone)]
pub struct Config {
    /// 데이터그램 최대 크기 (헤더 포함, 바이트)
    pub max_datagram_size: usize,

    /// 프래그먼트당 최대 재전송 횟수
    /// 0이면 재전송 없는 비신뢰 모드
    pub max_retries: u32,

    /// 재전송 타임아웃 (밀리초)
    pub retransmit_timeout_ms: u64,

    /// 지수 백오프 상한 (밀리초)
    pub max_retransmit_timeout_ms: u64,

    /// 백오프 방식
    pub backoff: Backoff,

    /// 동시에 ACK 대기 가능한 최대 프래그먼트 수
    pub send_window: usize,

    /// 수신측 NACK 간격 (밀리초)
    /// 이 시간 동안 DATA가 없으면 누락 목록 전송
    pub nack_interval_ms: u64,

    /// 수신 대기 최대 시간 (밀리초)
    pub idle_timeout_ms: u64,

    /// 서버 수신 포트
    pub listen_port: u16,

    /// 서버 저장 시 파일명에 붙이는 접미사
    pub copy_suffix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_datagram_size: MAX_DATAGRAM_SIZE,
            max_retries: 5,
            retransmit_timeout_ms: 200,
            max_retransmit_timeout_ms: 2000,
            backoff: Backoff::Fixed,
            send_window: 64,
            nack_interval_ms: 100,
            idle_timeout_ms: 5000,
            listen_port: DEFAULT_LISTEN_PORT,
            copy_suffix: "_copy".to_string(),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 프래그먼트 페이로드 최대 크기
    pub fn fragment_size(&self) -> usize {
        self.max_datagram_size.saturating_sub(HEADER_LEN)
    }

    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }

    pub fn max_retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.max_retransmit_timeout_ms.max(self.retransmit_timeout_ms))
    }

    pub fn nack_interval(&self) -> Duration {
        Duration::from_millis(self.nack_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_datagram_size <= HEADER_LEN {
            return Err(Error::InvalidConfig(format!(
                "max_datagram_size {}는 헤더 {} bytes보다 커야 함",
                self.max_datagram_size, HEADER_LEN
            )));
        }
        if self.max_datagram_size > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_datagram_size {} > {}",
                self.max_datagram_size,
                u16::MAX
            )));
        }
        if self.send_window == 0 {
            return Err(Error::InvalidConfig("send_window는 0일 수 없음".into()));
        }
        if self.retransmit_timeout_ms == 0 || self.nack_interval_ms == 0 {
            return Err(Error::InvalidConfig("타임아웃은 0일 수 없음".into()));
        }

        // 상대가 재전송을 다 쓰기 전에 수신측이 포기하면 안 된다
        let retry_span = RetransmitTimer::new(self).retry_span();
        if self.idle_timeout() < retry_span {
            return Err(Error::InvalidConfig(format!(
                "idle_timeout_ms {}가 재전송 기간 {} ms보다 짧음",
                self.idle_timeout_ms,
                retry_span.as_millis()
            )));
        }
        Ok(())
    }

    /// 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            max_retries: 3,
            retransmit_timeout_ms: 50,
            max_retransmit_timeout_ms: 400,
            nack_interval_ms: 30,
            idle_timeout_ms: 2000,
            ..Self::default()
        }
    }

    /// 손실이 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            max_retries: 12,
            retransmit_timeout_ms: 300,
            max_retransmit_timeout_ms: 5000,
            backoff: Backoff::Exponential,
            send_window: 16,
            nack_interval_ms: 150,
            idle_timeout_ms: 60_000,
            ..Self::default()
        }
    }

    /// 재전송 없는 설정 (손실 시 즉시 실패)
    pub fn unreliable() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}
