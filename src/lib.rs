//! # RFT (Reliable Fragment Transfer)
//!
//! UDP 기반 ACK 확인형 파일 에코 전송 프로토콜
//!
//! ## 핵심 특징
//! - **프래그먼트 분할**: 파일을 데이터그램 크기에 맞는 프래그먼트로 분할, 순서 무관 조립
//! - **ACK + NACK**: 프래그먼트별 ACK, 누락 구간은 NACK으로 빠르게 재요청
//! - **재전송 예산**: 타이머 기반 재전송, 한도 초과 시 전송 실패
//! - **FIN / FIN-ACK**: 수신측 조립 완료를 송신측이 확인해야 전송 종료
//! - **에코**: 서버는 받은 파일을 새 이름으로 저장한 뒤 클라이언트에 되돌려 보냄
//!
//! 송신/수신 상태 기계([`TransferSender`], [`TransferReceiver`])는 소켓을 다루지 않으며
//! [`Client`]와 [`Server`]가 [`Transport`] 위에서 구동한다.

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod stats;
pub mod store;
pub mod transfer;
pub mod transport;

pub use chunk::{Chunker, Fragment, InsertOutcome, Reassembler};
pub use client::{Client, Echo};
pub use config::{Backoff, Config};
pub use error::{Error, FrameError, Result};
pub use frame::{Frame, FrameType, HEADER_LEN};
pub use receiver::TransferReceiver;
pub use sender::TransferSender;
pub use server::{Server, ServerHandle, TransferKey};
pub use stats::{ServerStats, TransferStats};
pub use store::FileStore;
pub use transfer::{Direction, TransferId, TransferState};
pub use transport::Transport;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (프레임 식별용)
pub const MAGIC_NUMBER: u16 = 0x5246; // "RF"

/// 기본 최대 데이터그램 크기 (헤더 포함, 바이트)
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// 기본 서버 포트
pub const DEFAULT_LISTEN_PORT: u16 = 9000;

/// 수신 버퍼 크기 (UDP 최대 데이터그램)
pub const RECV_BUFFER_SIZE: usize = 65535;
