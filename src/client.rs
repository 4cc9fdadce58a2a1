//! 클라이언트 세션
//!
//! 1. 파일을 업로드 (송신 상태 기계)
//! 2. 완료되면 같은 소켓으로 서버의 에코 전송을 수신 (수신 상태 기계)
//!
//! 업로드 전송은 에코 수신 중에도 linger 상태로 남아 재전송된 FIN에 응답한다.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

use crate::frame::{Frame, FrameType};
use crate::receiver::TransferReceiver;
use crate::sender::TransferSender;
use crate::stats::TransferStats;
use crate::store::{fallback_name, FileStore};
use crate::transfer::{TransferId, TransferState};
use crate::transport::{recv_until, send_frames, Transport};
use crate::{Config, Error, Result, RECV_BUFFER_SIZE};

/// 에코 결과
#[derive(Debug, Clone)]
pub struct Echo {
    /// 업로드 전송 식별자
    pub transfer_id: TransferId,

    /// 서버가 저장한 파일명
    pub name: Option<String>,

    /// 되돌려 받은 데이터
    pub data: Bytes,

    pub upload: TransferStats,
    pub download: TransferStats,
}

impl Echo {
    /// 로컬 저장 파일명 (`received_<서버 저장명>`)
    pub fn local_name(&self) -> String {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| fallback_name(self.transfer_id.echo()));
        format!("received_{name}")
    }
}

/// 파일 에코 클라이언트
pub struct Client {
    config: Config,
    transport: Arc<dyn Transport>,
    server_addr: SocketAddr,
}

impl Client {
    /// 임시 포트에 바인딩한 UDP 소켓으로 클라이언트 생성
    pub async fn connect(config: Config, server_addr: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Self::new(config, Arc::new(socket), server_addr)
    }

    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        server_addr: SocketAddr,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            server_addr,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// 파일을 보내고 에코를 `output`에 `received_<이름>`으로 저장
    pub async fn send_file(&self, path: &Path, output: &FileStore) -> Result<PathBuf> {
        let is_file = tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            error!("파일을 찾을 수 없음: {:?}", path);
            return Err(Error::FileNotFound(path.display().to_string()));
        }

        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        info!("파일 전송: {:?} ({} bytes)", path, data.len());
        let echo = self.echo(name.as_deref(), Bytes::from(data)).await?;

        let saved = output.store(&echo.data, &echo.local_name()).await?;
        info!("에코 저장: {:?}", saved);
        Ok(saved)
    }

    /// 데이터를 업로드하고 서버의 에코를 받아 반환
    pub async fn echo(&self, name: Option<&str>, data: Bytes) -> Result<Echo> {
        let id = TransferId::random_upload();
        let mut upload = TransferSender::new(id, name.map(str::to_owned), data, &self.config)?;

        info!(
            "전송 {} 업로드 시작: {} bytes, {} 프래그먼트 -> {}",
            id,
            upload.stats().payload_bytes,
            upload.total_fragments(),
            self.server_addr
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        self.run_upload(&mut upload, &mut buf).await?;

        let mut download = self.run_download(&mut upload, &mut buf).await?;
        let data = download
            .take_data()
            .ok_or(Error::IncompleteTransfer {
                received: download.received_count(),
                expected: download.total_fragments(),
            })?;

        Ok(Echo {
            transfer_id: id,
            name: download.name().map(str::to_owned),
            data,
            upload: upload.stats().clone(),
            download: download.stats().clone(),
        })
    }

    async fn run_upload(&self, upload: &mut TransferSender, buf: &mut [u8]) -> Result<()> {
        loop {
            let now = Instant::now();
            let mut frames = upload.on_timeout(now)?;
            frames.extend(upload.poll_transmit(now));
            self.send(&frames).await?;

            if upload.state() == TransferState::Complete {
                return Ok(());
            }

            let deadline = upload.next_deadline();
            let Some((len, from)) = recv_until(&*self.transport, buf, deadline).await? else {
                continue;
            };
            let Some(frame) = self.accept(&buf[..len], from) else {
                continue;
            };

            let replies = upload.handle_frame(&frame, Instant::now());
            self.send(&replies).await?;
        }
    }

    async fn run_download(
        &self,
        upload: &mut TransferSender,
        buf: &mut [u8],
    ) -> Result<TransferReceiver> {
        let echo_id = upload.id().echo();
        let wait_until = Instant::now() + self.config.idle_timeout();
        let mut download: Option<TransferReceiver> = None;

        loop {
            let now = Instant::now();

            // linger 중인 업로드는 타이머 처리할 것이 없다
            upload.on_timeout(now)?;

            match download.as_mut() {
                Some(receiver) => {
                    let frames = receiver.on_timeout(now)?;
                    self.send(&frames).await?;
                    if receiver.state() == TransferState::Complete {
                        break;
                    }
                }
                None if now >= wait_until => {
                    return Err(Error::Timeout {
                        transfer_id: echo_id,
                        state: TransferState::Receiving,
                    });
                }
                None => {}
            }

            let deadline = match &download {
                Some(receiver) => receiver.next_deadline(),
                None => Some(wait_until),
            };
            let Some((len, from)) = recv_until(&*self.transport, buf, deadline).await? else {
                continue;
            };
            let Some(frame) = self.accept(&buf[..len], from) else {
                continue;
            };

            if frame.transfer_id == upload.id() {
                let replies = upload.handle_frame(&frame, Instant::now());
                self.send(&replies).await?;
                continue;
            }
            if frame.transfer_id != echo_id {
                debug!("알 수 없는 전송 {} 프레임 무시", frame.transfer_id);
                continue;
            }

            if download.is_none() {
                if frame.frame_type != FrameType::Data {
                    continue;
                }
                match TransferReceiver::new(echo_id, frame.total, &self.config, Instant::now()) {
                    Ok(receiver) => {
                        info!("전송 {} 에코 수신 시작: {} 프래그먼트", echo_id, frame.total);
                        download = Some(receiver);
                    }
                    Err(e) => {
                        debug!("에코 첫 프레임 무시: {}", e);
                        continue;
                    }
                }
            }

            if let Some(receiver) = download.as_mut() {
                let replies = receiver.handle_frame(&frame, Instant::now());
                self.send(&replies).await?;
            }
        }

        download.ok_or(Error::Timeout {
            transfer_id: echo_id,
            state: TransferState::Receiving,
        })
    }

    /// 서버에서 온 올바른 프레임만 통과
    fn accept(&self, bytes: &[u8], from: SocketAddr) -> Option<Frame> {
        if from != self.server_addr {
            debug!("서버가 아닌 주소의 데이터그램 무시: {}", from);
            return None;
        }
        match Frame::decode(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("잘못된 프레임 버림: {}", e);
                None
            }
        }
    }

    async fn send(&self, frames: &[Frame]) -> Result<()> {
        send_frames(
            &*self.transport,
            frames,
            self.server_addr,
            self.config.max_datagram_size,
        )
        .await
    }
}
