//! 에러 타입 정의

use thiserror::Error;

use crate::transfer::{TransferId, TransferState};

/// 프레임 디코딩 실패 원인
///
/// 수신측은 이 에러를 피어에게 알리지 않고 프레임을 버린다.
/// 복구는 송신측 재전송 타이머에 맡긴다.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("프레임이 잘림: {len} bytes (헤더 {header_len} bytes 필요)")]
    Truncated { len: usize, header_len: usize },

    #[error("유효하지 않은 매직 넘버: expected {expected:04X}, got {got:04X}")]
    InvalidMagic { expected: u16, got: u16 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("알 수 없는 프레임 타입: {0}")]
    UnknownFrameType(u8),

    #[error("페이로드 길이 불일치: header={declared}, actual={actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("프래그먼트 수가 0인 전송")]
    ZeroFragments,
}

/// RFT 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("데이터그램 크기 초과: {len} bytes > 최대 {max} bytes")]
    Oversize { len: usize, max: usize },

    #[error("잘못된 프레임: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("조립 불가: {received}/{expected} 프래그먼트만 수신")]
    IncompleteTransfer { received: u32, expected: u32 },

    #[error("재전송 한도 초과: transfer={transfer_id}, state={state}")]
    RetryBudgetExceeded {
        transfer_id: TransferId,
        state: TransferState,
    },

    #[error("전송 타임아웃: transfer={transfer_id}, state={state}")]
    Timeout {
        transfer_id: TransferId,
        state: TransferState,
    },

    #[error("전송 중단: transfer={transfer_id}")]
    Aborted { transfer_id: TransferId },

    #[error("파일을 찾을 수 없음: {0}")]
    FileNotFound(String),

    #[error("파일이 너무 큼: {len} bytes")]
    FileTooLarge { len: usize },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// 전송이 영구 실패했는지 여부 (재시도로 복구 불가)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::RetryBudgetExceeded { .. } | Error::Timeout { .. } | Error::Aborted { .. }
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
