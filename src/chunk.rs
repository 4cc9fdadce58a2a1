//! 프래그먼트 분할과 재조립
//!
//! - Chunker: 파일 바이트를 프래그먼트 크기 이하 조각으로 분할 (송신측)
//! - Reassembler: 순서와 무관하게 도착한 조각을 순번대로 조립 (수신측)

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::{Error, Result};

/// 프래그먼트 (순번 + 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub seq: u32,
    pub payload: Bytes,
}

/// 파일 분할기
///
/// 빈 파일은 빈 프래그먼트 1개로 보낸다.
/// 길이가 프래그먼트 크기의 배수이면 끝에 빈 조각을 만들지 않는다.
#[derive(Debug, Clone)]
pub struct Chunker {
    data: Bytes,
    fragment_size: usize,
    total: u32,
}

impl Chunker {
    pub fn new(data: Bytes, fragment_size: usize) -> Result<Self> {
        if fragment_size == 0 {
            return Err(Error::InvalidConfig("fragment_size는 0일 수 없음".into()));
        }

        let count = data.len().div_ceil(fragment_size).max(1);
        let total = u32::try_from(count).map_err(|_| Error::FileTooLarge { len: data.len() })?;

        Ok(Self {
            data,
            fragment_size,
            total,
        })
    }

    /// 총 프래그먼트 수
    pub fn total_fragments(&self) -> u32 {
        self.total
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// 순번으로 프래그먼트 조회 (재전송용, 복사 없음)
    pub fn get(&self, seq: u32) -> Option<Fragment> {
        if seq >= self.total {
            return None;
        }
        let start = seq as usize * self.fragment_size;
        let end = (start + self.fragment_size).min(self.data.len());
        Some(Fragment {
            seq,
            payload: self.data.slice(start.min(end)..end),
        })
    }

    /// 전체 프래그먼트를 순서대로 내는 지연 반복자
    ///
    /// 호출할 때마다 처음부터 다시 시작한다.
    pub fn fragments(&self) -> Fragments<'_> {
        Fragments {
            chunker: self,
            next: 0,
        }
    }
}

/// [`Chunker::fragments`] 반복자
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    chunker: &'a Chunker,
    next: u32,
}

impl Iterator for Fragments<'_> {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        let fragment = self.chunker.get(self.next)?;
        self.next += 1;
        Some(fragment)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.chunker.total - self.next.min(self.chunker.total)) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

/// 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 새 프래그먼트 저장됨
    Inserted,

    /// 이미 받은 프래그먼트 (저장하지 않음)
    Duplicate,

    /// 범위를 벗어난 순번 (무시)
    OutOfRange,
}

/// 프래그먼트 재조립기
#[derive(Debug)]
pub struct Reassembler {
    total: u32,
    fragments: BTreeMap<u32, Bytes>,
    received_bytes: usize,
}

impl Reassembler {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            fragments: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    /// 프래그먼트 삽입 (도착 순서 무관, 한 번만 저장)
    pub fn insert(&mut self, seq: u32, payload: Bytes) -> InsertOutcome {
        if seq >= self.total {
            return InsertOutcome::OutOfRange;
        }
        if self.fragments.contains_key(&seq) {
            return InsertOutcome::Duplicate;
        }
        self.received_bytes += payload.len();
        self.fragments.insert(seq, payload);
        InsertOutcome::Inserted
    }

    /// 모든 순번 [0, total)을 받았는지 여부
    pub fn is_complete(&self) -> bool {
        self.fragments.len() as u32 == self.total
    }

    pub fn total_fragments(&self) -> u32 {
        self.total
    }

    pub fn received_count(&self) -> u32 {
        self.fragments.len() as u32
    }

    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    /// 누락된 순번 목록 (오름차순, 최대 `limit`개)
    pub fn missing(&self, limit: usize) -> Vec<u32> {
        (0..self.total)
            .filter(|seq| !self.fragments.contains_key(seq))
            .take(limit)
            .collect()
    }

    /// 수신률
    pub fn receive_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.received_count() as f64 / self.total as f64
    }

    /// 순번 오름차순으로 이어 붙인 원본 바이트
    pub fn assemble(&self) -> Result<Bytes> {
        if !self.is_complete() {
            return Err(Error::IncompleteTransfer {
                received: self.received_count(),
                expected: self.total,
            });
        }

        let mut data = BytesMut::with_capacity(self.received_bytes);
        for payload in self.fragments.values() {
            data.extend_from_slice(payload);
        }
        Ok(data.freeze())
    }
}
