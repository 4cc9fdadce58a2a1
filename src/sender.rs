//! 송신 상태 기계
//!
//! - 프래그먼트별 재전송 타이머 (미확인 송신 테이블)
//! - 송신 윈도우로 미확인 프래그먼트 수 제한
//! - NACK 수신 시 즉시 재전송 (백오프 간격 유지, 재전송 예산은 타이머만 소모)
//! - FIN 수신 시 FIN-ACK 응답, 완료 후 linger 동안 재전송된 FIN에도 응답
//!
//! 소켓을 직접 다루지 않는다. 프레임과 시각을 받아 보낼 프레임을 돌려준다.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::Chunker;
use crate::frame::{Frame, FrameType, HEADER_LEN};
use crate::stats::TransferStats;
use crate::transfer::{RetransmitTimer, TransferId, TransferState};
use crate::{Config, Error, Result};

/// 미확인 프래그먼트
#[derive(Debug)]
struct Outstanding {
    payload: Bytes,

    /// 마지막 전송 시각
    sent_at: Instant,

    /// 타이머 재전송 횟수
    retries: u32,

    /// 재전송 타이머 만료 시각
    deadline: Instant,
}

/// 송신측 전송
pub struct TransferSender {
    id: TransferId,

    /// FIN-ACK에 실어 보낼 파일명
    name: Option<String>,

    chunker: Chunker,

    /// 아직 한 번도 보내지 않은 첫 순번
    next_seq: u32,

    outstanding: BTreeMap<u32, Outstanding>,

    acked: Vec<bool>,
    acked_count: u32,

    state: TransferState,
    timer: RetransmitTimer,
    send_window: usize,

    /// AwaitingFinAck 상태 만료 시각
    fin_deadline: Option<Instant>,

    /// Complete 이후 FIN에 재응답하는 기한
    linger_until: Option<Instant>,

    stats: TransferStats,
}

impl TransferSender {
    /// 새 송신 전송 생성
    pub fn new(
        id: TransferId,
        name: Option<String>,
        data: Bytes,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;

        if let Some(name) = &name {
            let len = HEADER_LEN + name.len();
            if len > config.max_datagram_size {
                return Err(Error::Oversize {
                    len,
                    max: config.max_datagram_size,
                });
            }
        }

        let chunker = Chunker::new(data, config.fragment_size())?;
        let total = chunker.total_fragments();

        let mut stats = TransferStats::new(total);
        stats.payload_bytes = chunker.data_len() as u64;

        Ok(Self {
            id,
            name,
            next_seq: 0,
            outstanding: BTreeMap::new(),
            acked: vec![false; total as usize],
            acked_count: 0,
            state: TransferState::Sending,
            timer: RetransmitTimer::new(config),
            send_window: config.send_window,
            fin_deadline: None,
            linger_until: None,
            stats,
            chunker,
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn total_fragments(&self) -> u32 {
        self.chunker.total_fragments()
    }

    pub fn acked_count(&self) -> u32 {
        self.acked_count
    }

    /// 미확인 송신 테이블 크기
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 윈도우가 허락하는 만큼 새 DATA 프레임 생성
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.state != TransferState::Sending {
            return frames;
        }

        let total = self.total_fragments();
        while self.outstanding.len() < self.send_window && self.next_seq < total {
            let Some(fragment) = self.chunker.get(self.next_seq) else {
                break;
            };

            frames.push(Frame::data(
                self.id,
                fragment.seq,
                total,
                fragment.payload.clone(),
            ));
            self.outstanding.insert(
                fragment.seq,
                Outstanding {
                    payload: fragment.payload,
                    sent_at: now,
                    retries: 0,
                    deadline: now + self.timer.timeout(0),
                },
            );
            self.stats.frames_sent += 1;
            self.next_seq += 1;
        }

        frames
    }

    /// 수신 프레임 처리, 응답 프레임 반환
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        if frame.transfer_id != self.id {
            return Vec::new();
        }

        match (frame.frame_type, self.state) {
            (FrameType::Ack, TransferState::Sending | TransferState::AwaitingFinAck) => {
                self.on_ack(frame.seq, now);
                Vec::new()
            }
            (FrameType::Nack, TransferState::Sending) => self.on_nack(frame, now),
            (FrameType::Fin, TransferState::Sending | TransferState::AwaitingFinAck) => {
                self.on_fin(now)
            }
            (FrameType::Fin, TransferState::Complete) => {
                // FIN-ACK 유실로 수신측이 FIN 재전송
                debug!("전송 {} FIN 재수신, FIN-ACK 재전송", self.id);
                self.stats.frames_sent += 1;
                vec![self.fin_ack()]
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

    fn on_ack(&mut self, seq: u32, now: Instant) {
        self.stats.acks_received += 1;

        if self.outstanding.remove(&seq).is_some() {
            self.acked[seq as usize] = true;
            self.acked_count += 1;
        }

        if self.state == TransferState::Sending && self.acked_count == self.total_fragments() {
            self.state = TransferState::AwaitingFinAck;
            self.fin_deadline = Some(now + self.timer.retry_span());
            debug!("전송 {} 모든 프래그먼트 ACK 완료, FIN 대기", self.id);
        }
    }

    fn on_nack(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        self.stats.nacks_received += 1;

        let total = self.total_fragments();
        let mut frames = Vec::new();

        // NACK 재전송은 재전송 예산과 타이머를 건드리지 않는다
        for seq in frame.nack_seqs() {
            let Some(entry) = self.outstanding.get_mut(&seq) else {
                continue;
            };
            let min_gap = self.timer.timeout(entry.retries) / 2;
            if now.duration_since(entry.sent_at) < min_gap {
                continue;
            }

            entry.sent_at = now;
            frames.push(Frame::data(self.id, seq, total, entry.payload.clone()));
        }

        if !frames.is_empty() {
            debug!("전송 {} NACK 재전송: {} 프래그먼트", self.id, frames.len());
        }
        self.stats.retransmissions += frames.len() as u64;
        self.stats.frames_sent += frames.len() as u64;
        frames
    }

    fn on_fin(&mut self, now: Instant) -> Vec<Frame> {
        // FIN은 수신측 조립 완료를 뜻하므로 유실된 ACK도 확인된 것으로 본다
        self.outstanding.clear();
        self.acked.iter_mut().for_each(|acked| *acked = true);
        self.acked_count = self.total_fragments();

        self.state = TransferState::Complete;
        self.fin_deadline = None;
        self.linger_until = Some(now + self.timer.retry_span());
        self.stats.mark_finished(now);
        self.stats.frames_sent += 1;

        info!("전송 {} 송신 완료: {}", self.id, self.stats.summary());
        vec![self.fin_ack()]
    }

    fn fin_ack(&self) -> Frame {
        Frame::fin_ack(self.id, self.total_fragments(), self.name.as_deref())
    }

    /// 만료된 타이머 처리
    ///
    /// 재전송 한도를 넘으면 Failed로 전환하고 `RetryBudgetExceeded` 반환.
    pub fn on_timeout(&mut self, now: Instant) -> Result<Vec<Frame>> {
        match self.state {
            TransferState::Sending => {
                let expired: Vec<u32> = self
                    .outstanding
                    .iter()
                    .filter(|(_, entry)| entry.deadline <= now)
                    .map(|(&seq, _)| seq)
                    .collect();

                let total = self.total_fragments();
                let mut frames = Vec::with_capacity(expired.len());
                for seq in expired {
                    let Some(entry) = self.outstanding.get_mut(&seq) else {
                        continue;
                    };
                    if self.timer.exhausted(entry.retries) {
                        warn!(
                            "전송 {} 프래그먼트 {} 재전송 한도 초과 ({}회)",
                            self.id, seq, entry.retries
                        );
                        return Err(self.fail(now));
                    }

                    entry.retries += 1;
                    entry.sent_at = now;
                    entry.deadline = now + self.timer.timeout(entry.retries);
                    frames.push(Frame::data(self.id, seq, total, entry.payload.clone()));

                    debug!("전송 {} 프래그먼트 {} 재전송 #{}", self.id, seq, entry.retries);
                }

                self.stats.retransmissions += frames.len() as u64;
                self.stats.frames_sent += frames.len() as u64;
                Ok(frames)
            }
            TransferState::AwaitingFinAck => match self.fin_deadline {
                Some(deadline) if deadline <= now => {
                    warn!("전송 {} FIN 대기 타임아웃", self.id);
                    Err(self.fail(now))
                }
                _ => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    fn fail(&mut self, now: Instant) -> Error {
        let state = self.state;
        self.state = TransferState::Failed;
        self.outstanding.clear();
        self.fin_deadline = None;
        self.stats.mark_finished(now);

        Error::RetryBudgetExceeded {
            transfer_id: self.id,
            state,
        }
    }

    /// 다음 타이머 만료 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            TransferState::Sending => self.outstanding.values().map(|e| e.deadline).min(),
            TransferState::AwaitingFinAck => self.fin_deadline,
            TransferState::Complete => self.linger_until,
            _ => None,
        }
    }

    /// 상태를 정리해도 되는지 여부 (실패 또는 linger 종료)
    pub fn is_finished(&self, now: Instant) -> bool {
        match self.state {
            TransferState::Failed => true,
            TransferState::Complete => self.linger_until.map_or(true, |until| now >= until),
            _ => false,
        }
    }

    /// 명시적 중단
    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        warn!("전송 {} 중단 (state={})", self.id, self.state);
        self.state = TransferState::Failed;
        self.outstanding.clear();
        self.fin_deadline = None;
        self.stats.mark_finished(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backoff;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            max_datagram_size: HEADER_LEN + 100,
            max_retries: 2,
            retransmit_timeout_ms: 100,
            ..Config::default()
        }
    }

    fn sender(len: usize) -> TransferSender {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        TransferSender::new(
            TransferId::from_u32(1),
            Some("a.bin".into()),
            data.into(),
            &config(),
        )
        .unwrap()
    }

    fn ack(seq: u32, total: u32) -> Frame {
        Frame::ack(TransferId::from_u32(1), seq, total)
    }

    #[test]
    fn test_initial_burst_respects_window() {
        let config = Config {
            send_window: 2,
            ..config()
        };
        let mut sender =
            TransferSender::new(TransferId::from_u32(1), None, vec![0u8; 450].into(), &config)
                .unwrap();
        let now = Instant::now();

        let frames = sender.poll_transmit(now);
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert!(sender.poll_transmit(now).is_empty());

        sender.handle_frame(&ack(0, 5), now);
        let frames = sender.poll_transmit(now);
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_single_loss_one_retransmission() {
        let mut sender = sender(250);
        let start = Instant::now();
        let frames = sender.poll_transmit(start);
        assert_eq!(frames.len(), 3);

        // 프래그먼트 1 유실
        sender.handle_frame(&ack(0, 3), start);
        sender.handle_frame(&ack(2, 3), start);
        assert_eq!(sender.outstanding_len(), 1);

        assert!(sender.on_timeout(start + Duration::from_millis(50)).unwrap().is_empty());

        let retransmit = sender.on_timeout(start + Duration::from_millis(100)).unwrap();
        assert_eq!(retransmit.len(), 1);
        assert_eq!(retransmit[0].seq, 1);
        assert_eq!(retransmit[0].payload, frames[1].payload);

        sender.handle_frame(&ack(1, 3), start + Duration::from_millis(110));
        assert_eq!(sender.state(), TransferState::AwaitingFinAck);
        assert_eq!(sender.stats().retransmissions, 1);

        let reply = sender.handle_frame(
            &Frame::fin(TransferId::from_u32(1), 3),
            start + Duration::from_millis(120),
        );
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].frame_type, FrameType::FinAck);
        assert_eq!(reply[0].payload.as_ref(), b"a.bin");
        assert_eq!(sender.state(), TransferState::Complete);
    }

    #[test]
    fn test_permanent_loss_fails() {
        let mut sender = sender(50);
        let mut now = Instant::now();
        sender.poll_transmit(now);

        for _ in 0..2 {
            now += Duration::from_millis(100);
            assert_eq!(sender.on_timeout(now).unwrap().len(), 1);
        }

        now += Duration::from_millis(100);
        let err = sender.on_timeout(now).unwrap_err();
        assert!(matches!(
            err,
            Error::RetryBudgetExceeded {
                state: TransferState::Sending,
                ..
            }
        ));
        assert_eq!(sender.state(), TransferState::Failed);
        assert_eq!(sender.outstanding_len(), 0);
        assert!(sender.is_finished(now));
        assert_eq!(sender.stats().retransmissions, 2);
    }

    #[test]
    fn test_zero_budget_fails_on_first_timeout() {
        let config = Config {
            max_retries: 0,
            ..config()
        };
        let mut sender =
            TransferSender::new(TransferId::from_u32(1), None, Bytes::new(), &config).unwrap();
        let now = Instant::now();
        assert_eq!(sender.poll_transmit(now).len(), 1);
        assert!(sender.on_timeout(now + Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_fin_while_sending_completes() {
        // 모든 ACK가 유실되어도 FIN이 오면 완료
        let mut sender = sender(250);
        let now = Instant::now();
        sender.poll_transmit(now);

        let reply = sender.handle_frame(&Frame::fin(TransferId::from_u32(1), 3), now);
        assert_eq!(reply[0].frame_type, FrameType::FinAck);
        assert_eq!(sender.state(), TransferState::Complete);
        assert_eq!(sender.acked_count(), 3);
    }

    #[test]
    fn test_linger_answers_repeated_fin() {
        let mut sender = sender(10);
        let now = Instant::now();
        sender.poll_transmit(now);
        sender.handle_frame(&ack(0, 1), now);
        sender.handle_frame(&Frame::fin(TransferId::from_u32(1), 1), now);

        let again = sender.handle_frame(&Frame::fin(TransferId::from_u32(1), 1), now);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].frame_type, FrameType::FinAck);

        assert!(!sender.is_finished(now));
        let linger = sender.next_deadline().unwrap();
        assert!(sender.is_finished(linger));
    }

    #[test]
    fn test_nack_triggers_retransmit() {
        let mut sender = sender(250);
        let start = Instant::now();
        sender.poll_transmit(start);

        let nack = Frame::nack(TransferId::from_u32(1), 3, &[1, 2]);

        // 너무 이른 NACK은 무시
        assert!(sender.handle_frame(&nack, start + Duration::from_millis(10)).is_empty());

        let frames = sender.handle_frame(&nack, start + Duration::from_millis(60));
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(sender.stats().retransmissions, 2);
        assert_eq!(sender.stats().nacks_received, 2);
    }

    #[test]
    fn test_repeated_nacks_keep_timer_budget() {
        let config = Config::lossy_network();
        let id = TransferId::from_u32(1);
        let mut sender = TransferSender::new(id, None, vec![7u8; 10].into(), &config).unwrap();
        let start = Instant::now();
        sender.poll_transmit(start);

        let timer = RetransmitTimer::new(&config);
        let budget: Duration = (0..=config.max_retries).map(|r| timer.timeout(r)).sum();

        // 수신측이 nack_interval마다 NACK을 보내도 타이머 일정대로만 실패
        let nack = Frame::nack(id, 1, &[0]);
        let mut now = start;
        let mut nack_resends = 0;
        let failed_at = loop {
            now += config.nack_interval();
            nack_resends += sender.handle_frame(&nack, now).len();
            if sender.on_timeout(now).is_err() {
                break now;
            }
            assert!(now - start < budget * 2, "전송이 끝나지 않음");
        };

        assert!(failed_at - start >= budget);
        assert!(nack_resends > 0);
        assert_eq!(
            sender.stats().retransmissions,
            (config.max_retries as usize + nack_resends) as u64
        );
    }

    #[test]
    fn test_nack_gap_follows_backoff() {
        let config = Config {
            backoff: Backoff::Exponential,
            max_retransmit_timeout_ms: 10_000,
            ..config()
        };
        let id = TransferId::from_u32(1);
        let mut sender = TransferSender::new(id, None, vec![1u8; 10].into(), &config).unwrap();
        let start = Instant::now();
        sender.poll_transmit(start);

        // 타이머 재전송 2회 후 타임아웃은 400ms, NACK 간격은 200ms
        sender.on_timeout(start + Duration::from_millis(100)).unwrap();
        let last = start + Duration::from_millis(300);
        assert_eq!(sender.on_timeout(last).unwrap().len(), 1);

        let nack = Frame::nack(id, 1, &[0]);
        assert!(sender.handle_frame(&nack, last + Duration::from_millis(150)).is_empty());
        assert_eq!(
            sender.handle_frame(&nack, last + Duration::from_millis(200)).len(),
            1
        );
    }

    #[test]
    fn test_awaiting_fin_times_out() {
        let mut sender = sender(10);
        let now = Instant::now();
        sender.poll_transmit(now);
        sender.handle_frame(&ack(0, 1), now);
        assert_eq!(sender.state(), TransferState::AwaitingFinAck);

        let deadline = sender.next_deadline().unwrap();
        assert!(sender.on_timeout(deadline - Duration::from_millis(1)).unwrap().is_empty());
        assert!(matches!(
            sender.on_timeout(deadline),
            Err(Error::RetryBudgetExceeded {
                state: TransferState::AwaitingFinAck,
                ..
            })
        ));
    }

    #[test]
    fn test_foreign_and_duplicate_acks_ignored() {
        let mut sender = sender(250);
        let now = Instant::now();
        sender.poll_transmit(now);

        sender.handle_frame(&Frame::ack(TransferId::from_u32(9), 0, 3), now);
        assert_eq!(sender.acked_count(), 0);

        sender.handle_frame(&ack(0, 3), now);
        sender.handle_frame(&ack(0, 3), now);
        sender.handle_frame(&ack(77, 3), now);
        assert_eq!(sender.acked_count(), 1);
    }

    #[test]
    fn test_name_too_long_is_oversize() {
        let name = "x".repeat(200);
        let result = TransferSender::new(TransferId::from_u32(1), Some(name), Bytes::new(), &config());
        assert!(matches!(result, Err(Error::Oversize { .. })));
    }

    #[test]
    fn test_abort() {
        let mut sender = sender(250);
        sender.poll_transmit(Instant::now());
        sender.abort();
        assert_eq!(sender.state(), TransferState::Failed);
        assert_eq!(sender.outstanding_len(), 0);
        assert!(sender.poll_transmit(Instant::now()).is_empty());
    }
}
