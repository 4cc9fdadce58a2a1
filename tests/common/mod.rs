//! 통합 테스트 공용 도우미

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use rft::transport::{RecvFuture, SendFuture};
use rft::{Config, FileStore, Frame, Server, ServerHandle, Transport, HEADER_LEN};

/// 프래그먼트 1024 바이트, 짧은 타이머
pub fn test_config() -> Config {
    Config {
        max_datagram_size: 1024 + HEADER_LEN,
        max_retries: 4,
        retransmit_timeout_ms: 50,
        max_retransmit_timeout_ms: 200,
        nack_interval_ms: 30,
        idle_timeout_ms: 2000,
        ..Config::default()
    }
}

type DropFilter = Box<dyn FnMut(&Frame) -> bool + Send>;

/// 송신 프레임을 필터로 골라 버리는 UDP 전송
pub struct LossyTransport {
    socket: UdpSocket,
    filter: Mutex<DropFilter>,
    dropped: AtomicUsize,
}

impl LossyTransport {
    /// `filter`가 true를 반환한 프레임은 보내지 않는다
    pub async fn bind(filter: impl FnMut(&Frame) -> bool + Send + 'static) -> Arc<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Arc::new(Self {
            socket,
            filter: Mutex::new(Box::new(filter)),
            dropped: AtomicUsize::new(0),
        })
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for LossyTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        let drop = match Frame::decode(buf) {
            Ok(frame) => {
                let mut filter = self.filter.lock();
                (&mut **filter)(&frame)
            }
            Err(_) => false,
        };
        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Box::pin(async move { Ok::<_, std::io::Error>(buf.len()) });
        }
        Box::pin(self.socket.send_to(buf, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        Box::pin(self.socket.recv_from(buf))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// 백그라운드에서 실행 중인 서버
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub task: JoinHandle<rft::Result<()>>,
}

impl TestServer {
    pub async fn shutdown(self) {
        self.handle.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}

pub async fn spawn_server(config: Config, dir: &Path) -> TestServer {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    spawn_server_on(config, Arc::new(socket), dir)
}

pub fn spawn_server_on(config: Config, transport: Arc<dyn Transport>, dir: &Path) -> TestServer {
    let server = Server::new(config, transport, FileStore::new(dir)).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(async move { server.run().await });
    TestServer { addr, handle, task }
}

/// 디렉터리가 없거나 비어 있는지
pub fn is_empty_dir(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// 임의 내용의 테스트 데이터
pub fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}
