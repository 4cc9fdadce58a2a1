//! 전송 통계

use std::time::{Duration, Instant};

/// 전송 하나의 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 총 프래그먼트 수
    pub total_fragments: u32,

    /// 페이로드 바이트 (송신측: 첫 전송분, 수신측: 저장분)
    pub payload_bytes: u64,

    /// 보낸 프레임 수 (재전송 포함)
    pub frames_sent: u64,

    /// 재전송된 DATA/FIN 수
    pub retransmissions: u64,

    /// 받은 ACK 수
    pub acks_received: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 중복 수신된 DATA 수
    pub duplicates: u64,

    /// 보낸 NACK 수
    pub nacks_sent: u64,

    /// 받은 NACK 수
    pub nacks_received: u64,

    /// 종료 시간
    pub finished_at: Option<Instant>,
}

impl TransferStats {
    pub fn new(total_fragments: u32) -> Self {
        Self {
            start_time: Instant::now(),
            total_fragments,
            payload_bytes: 0,
            frames_sent: 0,
            retransmissions: 0,
            acks_received: 0,
            acks_sent: 0,
            duplicates: 0,
            nacks_sent: 0,
            nacks_received: 0,
            finished_at: None,
        }
    }

    /// 경과 시간 (종료됐으면 종료 시점까지)
    pub fn elapsed(&self) -> Duration {
        match self.finished_at {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    pub fn mark_finished(&mut self, now: Instant) {
        self.finished_at.get_or_insert(now);
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.payload_bytes as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.frames_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Fragments: {} | Bytes: {} | Throughput: {:.2} MB/s | Retransmits: {} ({:.1}%) | Dups: {} | NACKs: {}/{}",
            self.elapsed().as_secs_f64(),
            self.total_fragments,
            self.payload_bytes,
            self.throughput() / 1_000_000.0,
            self.retransmissions,
            self.retransmit_ratio() * 100.0,
            self.duplicates,
            self.nacks_sent,
            self.nacks_received,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}

/// 서버 누적 통계
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// 저장된 파일 수
    pub files_stored: u64,

    /// 완료된 수신 전송 수
    pub inbound_completed: u64,

    /// 실패한 수신 전송 수
    pub inbound_failed: u64,

    /// 완료된 에코 전송 수
    pub outbound_completed: u64,

    /// 실패한 에코 전송 수
    pub outbound_failed: u64,

    /// 버려진 잘못된 프레임 수
    pub malformed_frames: u64,
}

impl ServerStats {
    pub fn summary(&self) -> String {
        format!(
            "Stored: {} | Inbound: {} ok / {} failed | Echo: {} ok / {} failed | Malformed: {}",
            self.files_stored,
            self.inbound_completed,
            self.inbound_failed,
            self.outbound_completed,
            self.outbound_failed,
            self.malformed_frames,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_ratio() {
        let mut stats = TransferStats::new(4);
        assert_eq!(stats.retransmit_ratio(), 0.0);
        stats.frames_sent = 10;
        stats.retransmissions = 2;
        assert!((stats.retransmit_ratio() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_elapsed_frozen_after_finish() {
        let mut stats = TransferStats::new(1);
        let end = stats.start_time + Duration::from_millis(250);
        stats.mark_finished(end);
        stats.mark_finished(end + Duration::from_secs(5));
        assert_eq!(stats.elapsed(), Duration::from_millis(250));
    }
}
