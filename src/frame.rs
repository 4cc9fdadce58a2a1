//! 프레임 코덱
//!
//! 데이터그램 하나 = 고정 22바이트 헤더 + 가변 페이로드
//!
//! ```text
//! magic(u16) | version(u8) | transfer_id(u32) | seq(u32) | total(u32)
//! | frame_type(u8) | payload_len(u16) | crc32(u32) | payload
//! ```
//!
//! 모든 필드는 little-endian 고정 폭 (bincode 기본 인코딩).
//! CRC32는 crc32 필드를 0으로 둔 헤더와 페이로드 전체에 대해 계산한다.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::transfer::TransferId;
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 22;

/// 프레임 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// 파일 프래그먼트
    Data = 1,

    /// 프래그먼트 하나에 대한 수신 확인
    Ack = 2,

    /// 누락 프래그먼트 목록 (u32 LE 나열)
    Nack = 3,

    /// 수신측 조립 완료 알림
    Fin = 4,

    /// FIN 확인 (페이로드: 선택적 UTF-8 파일명)
    FinAck = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Ack),
            3 => Ok(FrameType::Nack),
            4 => Ok(FrameType::Fin),
            5 => Ok(FrameType::FinAck),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// 와이어 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameHeader {
    magic: u16,
    version: u8,
    transfer_id: u32,
    seq: u32,
    total: u32,
    frame_type: u8,
    payload_len: u16,
    crc32: u32,
}

/// 프로토콜 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transfer_id: TransferId,

    /// 프래그먼트 순번 (DATA/ACK에서만 의미 있음)
    pub seq: u32,

    /// 전송의 총 프래그먼트 수
    pub total: u32,

    pub frame_type: FrameType,

    pub payload: Bytes,
}

impl Frame {
    pub fn data(transfer_id: TransferId, seq: u32, total: u32, payload: Bytes) -> Self {
        Self {
            transfer_id,
            seq,
            total,
            frame_type: FrameType::Data,
            payload,
        }
    }

    pub fn ack(transfer_id: TransferId, seq: u32, total: u32) -> Self {
        Self {
            transfer_id,
            seq,
            total,
            frame_type: FrameType::Ack,
            payload: Bytes::new(),
        }
    }

    pub fn nack(transfer_id: TransferId, total: u32, missing: &[u32]) -> Self {
        let mut payload = BytesMut::with_capacity(missing.len() * 4);
        for &seq in missing {
            payload.put_u32_le(seq);
        }
        Self {
            transfer_id,
            seq: 0,
            total,
            frame_type: FrameType::Nack,
            payload: payload.freeze(),
        }
    }

    pub fn fin(transfer_id: TransferId, total: u32) -> Self {
        Self {
            transfer_id,
            seq: 0,
            total,
            frame_type: FrameType::Fin,
            payload: Bytes::new(),
        }
    }

    pub fn fin_ack(transfer_id: TransferId, total: u32, name: Option<&str>) -> Self {
        let payload = name
            .map(|name| Bytes::copy_from_slice(name.as_bytes()))
            .unwrap_or_default();
        Self {
            transfer_id,
            seq: 0,
            total,
            frame_type: FrameType::FinAck,
            payload,
        }
    }

    /// NACK 페이로드의 누락 순번 목록
    pub fn nack_seqs(&self) -> Vec<u32> {
        let mut buf = self.payload.clone();
        let mut seqs = Vec::with_capacity(buf.len() / 4);
        while buf.remaining() >= 4 {
            seqs.push(buf.get_u32_le());
        }
        seqs
    }

    /// 인코딩 후 데이터그램 크기
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    fn header(&self, crc32: u32) -> FrameHeader {
        FrameHeader {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            transfer_id: self.transfer_id.to_u32(),
            seq: self.seq,
            total: self.total,
            frame_type: self.frame_type as u8,
            payload_len: self.payload.len() as u16,
            crc32,
        }
    }

    /// 바이트로 직렬화
    ///
    /// 헤더 + 페이로드가 `max_datagram_size`를 넘으면 `Oversize`.
    pub fn encode(&self, max_datagram_size: usize) -> Result<Vec<u8>> {
        let len = self.encoded_len();
        let max = max_datagram_size.min(HEADER_LEN + u16::MAX as usize);
        if len > max {
            return Err(Error::Oversize { len, max });
        }

        let unsigned = bincode::serialize(&self.header(0))?;
        let crc32 = checksum(&unsigned, &self.payload);
        let header_bytes = bincode::serialize(&self.header(crc32))?;
        debug_assert_eq!(header_bytes.len(), HEADER_LEN);

        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                len: bytes.len(),
                header_len: HEADER_LEN,
            }
            .into());
        }

        let header: FrameHeader = bincode::deserialize(&bytes[..HEADER_LEN])?;

        if header.magic != MAGIC_NUMBER {
            return Err(FrameError::InvalidMagic {
                expected: MAGIC_NUMBER,
                got: header.magic,
            }
            .into());
        }
        if header.version != PROTOCOL_VERSION {
            return Err(FrameError::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            }
            .into());
        }

        let frame_type = FrameType::try_from(header.frame_type)?;

        let payload = &bytes[HEADER_LEN..];
        if header.payload_len as usize != payload.len() {
            return Err(FrameError::LengthMismatch {
                declared: header.payload_len as usize,
                actual: payload.len(),
            }
            .into());
        }
        if frame_type == FrameType::Nack && payload.len() % 4 != 0 {
            return Err(FrameError::LengthMismatch {
                declared: payload.len() / 4 * 4,
                actual: payload.len(),
            }
            .into());
        }

        let unsigned = bincode::serialize(&FrameHeader {
            crc32: 0,
            ..header.clone()
        })?;
        let crc32 = checksum(&unsigned, payload);
        if crc32 != header.crc32 {
            return Err(FrameError::CrcMismatch {
                expected: header.crc32,
                got: crc32,
            }
            .into());
        }

        Ok(Self {
            transfer_id: TransferId::from_u32(header.transfer_id),
            seq: header.seq,
            total: header.total,
            frame_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_DATAGRAM_SIZE;

    fn id() -> TransferId {
        TransferId::from_u32(0x0102_0304)
    }

    #[test]
    fn test_header_len_is_fixed() {
        let frame = Frame::ack(id(), 7, 9);
        let header = frame.header(0xDEAD_BEEF);
        assert_eq!(bincode::serialized_size(&header).unwrap() as usize, HEADER_LEN);
        assert_eq!(frame.encode(MAX_DATAGRAM_SIZE).unwrap().len(), HEADER_LEN);
    }

    #[test]
    fn test_data_frame_serialization() {
        let frame = Frame::data(id(), 3, 10, Bytes::from(vec![1, 2, 3, 4, 5]));
        let bytes = frame.encode(MAX_DATAGRAM_SIZE).unwrap();
        let restored = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, restored);
    }

    #[test]
    fn test_wire_layout() {
        let frame = Frame::data(id(), 2, 3, Bytes::from_static(b"ab"));
        let bytes = frame.encode(MAX_DATAGRAM_SIZE).unwrap();
        assert_eq!(&bytes[0..2], &MAGIC_NUMBER.to_le_bytes());
        assert_eq!(bytes[2], PROTOCOL_VERSION);
        assert_eq!(&bytes[3..7], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&bytes[7..11], &2u32.to_le_bytes());
        assert_eq!(&bytes[11..15], &3u32.to_le_bytes());
        assert_eq!(bytes[15], FrameType::Data as u8);
        assert_eq!(&bytes[16..18], &2u16.to_le_bytes());
        assert_eq!(&bytes[HEADER_LEN..], b"ab");
    }

    #[test]
    fn test_oversize_rejected() {
        let payload = Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE - HEADER_LEN + 1]);
        let frame = Frame::data(id(), 0, 1, payload);
        assert!(matches!(
            frame.encode(MAX_DATAGRAM_SIZE),
            Err(Error::Oversize { len, max }) if len == MAX_DATAGRAM_SIZE + 1 && max == MAX_DATAGRAM_SIZE
        ));

        let exact = Frame::data(id(), 0, 1, Bytes::from(vec![0u8; MAX_DATAGRAM_SIZE - HEADER_LEN]));
        assert_eq!(exact.encode(MAX_DATAGRAM_SIZE).unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = Frame::ack(id(), 0, 1).encode(MAX_DATAGRAM_SIZE).unwrap();
        let err = Frame::decode(&bytes[..HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(FrameError::Truncated { .. })));
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = Frame::data(id(), 0, 1, Bytes::from_static(b"hello"))
            .encode(MAX_DATAGRAM_SIZE)
            .unwrap();
        bytes.pop();
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedFrame(FrameError::LengthMismatch { declared: 5, actual: 4 })
        ));
    }

    #[test]
    fn test_unknown_frame_type() {
        let mut bytes = Frame::fin(id(), 1).encode(MAX_DATAGRAM_SIZE).unwrap();
        bytes[15] = 42;
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(FrameError::UnknownFrameType(42))));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut bytes = Frame::data(id(), 0, 1, Bytes::from_static(b"payload"))
            .encode(MAX_DATAGRAM_SIZE)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(FrameError::CrcMismatch { .. })));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Frame::ack(id(), 0, 1).encode(MAX_DATAGRAM_SIZE).unwrap();
        bytes[0] = 0;
        let err = Frame::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(FrameError::InvalidMagic { .. })));
    }

    #[test]
    fn test_nack_payload() {
        let frame = Frame::nack(id(), 100, &[3, 17, 99]);
        let restored = Frame::decode(&frame.encode(MAX_DATAGRAM_SIZE).unwrap()).unwrap();
        assert_eq!(restored.frame_type, FrameType::Nack);
        assert_eq!(restored.nack_seqs(), vec![3, 17, 99]);
    }

    #[test]
    fn test_fin_ack_carries_name() {
        let frame = Frame::fin_ack(id(), 3, Some("notes_copy.txt"));
        let restored = Frame::decode(&frame.encode(MAX_DATAGRAM_SIZE).unwrap()).unwrap();
        assert_eq!(restored.payload.as_ref(), b"notes_copy.txt");
        assert!(Frame::fin_ack(id(), 3, None).payload.is_empty());
    }
}
