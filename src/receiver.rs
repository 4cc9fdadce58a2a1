//! 수신 상태 기계
//!
//! - DATA마다 ACK (중복도 다시 ACK, 저장은 한 번)
//! - DATA가 끊기면 누락 목록을 NACK으로 요청
//! - 조립 완료 시 FIN, FIN-ACK를 받을 때까지 FIN 재전송

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::{InsertOutcome, Reassembler};
use crate::error::FrameError;
use crate::frame::{Frame, FrameType};
use crate::stats::TransferStats;
use crate::transfer::{RetransmitTimer, TransferId, TransferState};
use crate::{Config, Error, Result};

/// 수신측 전송
pub struct TransferReceiver {
    id: TransferId,
    total: u32,

    /// 조립 완료 후에는 None (조립된 데이터는 `data`로 이동)
    reassembler: Option<Reassembler>,

    /// 조립된 원본, 완료 후 한 번만 꺼낼 수 있음
    data: Option<Bytes>,

    /// FIN-ACK로 전달받은 파일명
    name: Option<String>,

    state: TransferState,
    timer: RetransmitTimer,

    nack_interval: Duration,
    idle_timeout: Duration,
    max_nack_entries: usize,

    last_activity: Instant,
    nack_deadline: Instant,

    fin_retries: u32,
    fin_deadline: Option<Instant>,

    /// Complete 이후 늦게 온 프레임을 흡수하는 기한
    linger_until: Option<Instant>,

    stats: TransferStats,
}

impl TransferReceiver {
    /// 새 전송의 첫 DATA 프레임으로 생성
    pub fn new(id: TransferId, total: u32, config: &Config, now: Instant) -> Result<Self> {
        config.validate()?;
        if total == 0 {
            return Err(FrameError::ZeroFragments.into());
        }

        Ok(Self {
            id,
            total,
            reassembler: Some(Reassembler::new(total)),
            data: None,
            name: None,
            state: TransferState::Receiving,
            timer: RetransmitTimer::new(config),
            nack_interval: config.nack_interval(),
            idle_timeout: config.idle_timeout(),
            max_nack_entries: (config.fragment_size() / 4).max(1),
            last_activity: now,
            nack_deadline: now + config.nack_interval(),
            fin_retries: 0,
            fin_deadline: None,
            linger_until: None,
            stats: TransferStats::new(total),
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn total_fragments(&self) -> u32 {
        self.total
    }

    /// 수신된 프래그먼트 수
    pub fn received_count(&self) -> u32 {
        match &self.reassembler {
            Some(reassembler) => reassembler.received_count(),
            None => self.total,
        }
    }

    /// 송신측이 알려준 파일명 (Complete 이후)
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 완료된 데이터 꺼내기
    ///
    /// Complete 상태에서 단 한 번만 Some을 반환한다.
    pub fn take_data(&mut self) -> Option<Bytes> {
        if self.state != TransferState::Complete {
            return None;
        }
        self.data.take()
    }

    /// 수신 프레임 처리, 응답 프레임 반환
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        if frame.transfer_id != self.id {
            return Vec::new();
        }

        match (frame.frame_type, self.state) {
            (FrameType::Data, TransferState::Receiving | TransferState::AwaitingFin) => {
                self.on_data(frame, now)
            }
            (FrameType::FinAck, TransferState::AwaitingFin) => {
                self.on_fin_ack(frame, now);
                Vec::new()
            }
            (frame_type, state) => {
                debug!(
                    "전송 {} 프레임 무시: {:?} (state={})",
                    self.id, frame_type, state
                );
                Vec::new()
            }
        }
    }

    fn on_data(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        if frame.total != self.total || frame.seq >= self.total {
            debug!(
                "전송 {} 범위 밖 DATA 무시: seq={}, total={}",
                self.id, frame.seq, frame.total
            );
            return Vec::new();
        }

        self.last_activity = now;
        self.nack_deadline = now + self.nack_interval;

        let outcome = match self.reassembler.as_mut() {
            Some(reassembler) => reassembler.insert(frame.seq, frame.payload.clone()),
            None => InsertOutcome::Duplicate,
        };
        match outcome {
            InsertOutcome::Inserted => self.stats.payload_bytes += frame.payload.len() as u64,
            InsertOutcome::Duplicate => self.stats.duplicates += 1,
            InsertOutcome::OutOfRange => return Vec::new(),
        }

        let mut frames = vec![Frame::ack(self.id, frame.seq, self.total)];
        self.stats.acks_sent += 1;

        let complete = self
            .reassembler
            .as_ref()
            .is_some_and(|reassembler| reassembler.is_complete());
        if self.state == TransferState::Receiving && complete {
            if let Some(fin) = self.finish_reassembly(now) {
                frames.push(fin);
            }
        }

        self.stats.frames_sent += frames.len() as u64;
        frames
    }

    fn finish_reassembly(&mut self, now: Instant) -> Option<Frame> {
        let reassembler = self.reassembler.take()?;
        match reassembler.assemble() {
            Ok(data) => {
                debug!(
                    "전송 {} 조립 완료: {} bytes, FIN 전송",
                    self.id,
                    data.len()
                );
                self.data = Some(data);
                self.state = TransferState::AwaitingFin;
                self.fin_deadline = Some(now + self.timer.timeout(0));
                Some(Frame::fin(self.id, self.total))
            }
            Err(e) => {
                warn!("전송 {} 조립 실패: {}", self.id, e);
                self.reassembler = Some(reassembler);
                None
            }
        }
    }

    fn on_fin_ack(&mut self, frame: &Frame, now: Instant) {
        self.name = std::str::from_utf8(&frame.payload)
            .ok()
            .filter(|name| !name.is_empty())
            .map(str::to_owned);

        self.state = TransferState::Complete;
        self.fin_deadline = None;
        self.linger_until = Some(now + self.timer.retry_span());
        self.stats.mark_finished(now);

        info!("전송 {} 수신 완료: {}", self.id, self.stats.summary());
    }

    /// 만료된 타이머 처리
    pub fn on_timeout(&mut self, now: Instant) -> Result<Vec<Frame>> {
        match self.state {
            TransferState::Receiving => {
                if now.duration_since(self.last_activity) >= self.idle_timeout {
                    let ratio = self
                        .reassembler
                        .as_ref()
                        .map_or(1.0, |reassembler| reassembler.receive_ratio());
                    warn!(
                        "전송 {} 수신 타임아웃: {}/{} 프래그먼트 ({:.1}%)",
                        self.id,
                        self.received_count(),
                        self.total,
                        ratio * 100.0
                    );
                    let state = self.fail(now);
                    return Err(Error::Timeout {
                        transfer_id: self.id,
                        state,
                    });
                }

                if now < self.nack_deadline {
                    return Ok(Vec::new());
                }
                self.nack_deadline = now + self.nack_interval;

                let missing = match &self.reassembler {
                    Some(reassembler) => reassembler.missing(self.max_nack_entries),
                    None => Vec::new(),
                };
                if missing.is_empty() {
                    return Ok(Vec::new());
                }

                debug!("전송 {} NACK 전송: {} 누락", self.id, missing.len());
                self.stats.nacks_sent += 1;
                self.stats.frames_sent += 1;
                Ok(vec![Frame::nack(self.id, self.total, &missing)])
            }
            TransferState::AwaitingFin => {
                match self.fin_deadline {
                    Some(deadline) if deadline <= now => {}
                    _ => return Ok(Vec::new()),
                }

                if self.timer.exhausted(self.fin_retries) {
                    warn!("전송 {} FIN 재전송 한도 초과", self.id);
                    let state = self.fail(now);
                    return Err(Error::RetryBudgetExceeded {
                        transfer_id: self.id,
                        state,
                    });
                }

                self.fin_retries += 1;
                self.fin_deadline = Some(now + self.timer.timeout(self.fin_retries));
                self.stats.retransmissions += 1;
                self.stats.frames_sent += 1;
                debug!("전송 {} FIN 재전송 #{}", self.id, self.fin_retries);
                Ok(vec![Frame::fin(self.id, self.total)])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Failed로 전환하고 버퍼 해제, 직전 상태 반환
    fn fail(&mut self, now: Instant) -> TransferState {
        let state = self.state;
        self.state = TransferState::Failed;
        self.reassembler = None;
        self.data = None;
        self.fin_deadline = None;
        self.stats.mark_finished(now);
        state
    }

    /// 다음 타이머 만료 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            TransferState::Receiving => {
                Some(self.nack_deadline.min(self.last_activity + self.idle_timeout))
            }
            TransferState::AwaitingFin => self.fin_deadline,
            TransferState::Complete => self.linger_until,
            _ => None,
        }
    }

    /// 상태를 정리해도 되는지 여부
    pub fn is_finished(&self, now: Instant) -> bool {
        match self.state {
            TransferState::Failed => true,
            TransferState::Complete => self.linger_until.map_or(true, |until| now >= until),
            _ => false,
        }
    }

    /// 명시적 중단, 메모리 버퍼만 버린다
    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        warn!("전송 {} 중단 (state={})", self.id, self.state);
        self.fail(Instant::now());
    }
}
