//! 데이터그램 전송 계층 추상화
//!
//! 세션은 [`Transport`] 트레이트만 사용한다.
//! 기본 구현은 `tokio::net::UdpSocket`이며 테스트에서는 손실 주입 래퍼로 교체한다.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Instant;

use tokio::net::UdpSocket;

use crate::frame::Frame;
use crate::Result;

/// [`Transport::send_to`] 반환 future
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// [`Transport::recv_from`] 반환 future
pub type RecvFuture<'a> =
    Pin<Box<dyn Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a>>;

/// 최선 노력 유니캐스트 데이터그램 전송
pub trait Transport: Send + Sync + 'static {
    /// `target`으로 데이터그램 하나 전송
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a>;

    /// 데이터그램 하나 수신, (길이, 송신 주소) 반환
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        Box::pin(UdpSocket::send_to(self, buf, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        Box::pin(UdpSocket::recv_from(self, buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// 기한까지 수신 대기
///
/// 기한이 지나면 `Ok(None)`. 기한이 없으면 데이터그램이 올 때까지 대기한다.
pub async fn recv_until(
    transport: &dyn Transport,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> io::Result<Option<(usize, SocketAddr)>> {
    match deadline {
        Some(deadline) => {
            let deadline = tokio::time::Instant::from_std(deadline);
            match tokio::time::timeout_at(deadline, transport.recv_from(buf)).await {
                Ok(result) => result.map(Some),
                Err(_) => Ok(None),
            }
        }
        None => transport.recv_from(buf).await.map(Some),
    }
}

/// 프레임들을 인코딩해 `target`으로 순서대로 전송
pub async fn send_frames(
    transport: &dyn Transport,
    frames: &[Frame],
    target: SocketAddr,
    max_datagram_size: usize,
) -> Result<()> {
    for frame in frames {
        let bytes = frame.encode(max_datagram_size)?;
        transport.send_to(&bytes, target).await?;
    }
    Ok(())
}
