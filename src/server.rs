//! 서버 세션
//!
//! 하나의 UDP 소켓에서 여러 클라이언트의 전송을 동시에 처리한다.
//! 전송 테이블은 (피어 주소, 전송 ID)를 키로 하는 `DashMap`이며
//! [`ServerHandle`]로 다른 태스크와 공유된다.
//!
//! 업로드 수신이 Complete가 되면 파일을 한 번 저장하고
//! 같은 피어로 에코 전송을 시작한다.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, FrameType};
use crate::receiver::TransferReceiver;
use crate::sender::TransferSender;
use crate::stats::ServerStats;
use crate::store::{derive_name, fallback_name, FileStore};
use crate::transfer::{Direction, TransferId, TransferState};
use crate::transport::{recv_until, send_frames, Transport};
use crate::{Config, Error, Result, RECV_BUFFER_SIZE};

/// 정지 플래그 확인 주기
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 전송 테이블 키
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub peer: SocketAddr,
    pub id: TransferId,
}

impl TransferKey {
    pub fn new(peer: SocketAddr, id: TransferId) -> Self {
        Self { peer, id }
    }
}

enum Slot {
    /// 클라이언트 업로드 수신
    Inbound(TransferReceiver),
    /// 에코 송신
    Outbound(TransferSender),
}

impl Slot {
    fn state(&self) -> TransferState {
        match self {
            Slot::Inbound(receiver) => receiver.state(),
            Slot::Outbound(sender) => sender.state(),
        }
    }

    fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Vec<Frame> {
        match self {
            Slot::Inbound(receiver) => receiver.handle_frame(frame, now),
            Slot::Outbound(sender) => {
                let mut frames = sender.handle_frame(frame, now);
                frames.extend(sender.poll_transmit(now));
                frames
            }
        }
    }

    fn service(&mut self, now: Instant) -> Result<Vec<Frame>> {
        match self {
            Slot::Inbound(receiver) => receiver.on_timeout(now),
            Slot::Outbound(sender) => {
                let mut frames = sender.on_timeout(now)?;
                frames.extend(sender.poll_transmit(now));
                Ok(frames)
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self {
            Slot::Inbound(receiver) => receiver.next_deadline(),
            Slot::Outbound(sender) => sender.next_deadline(),
        }
    }

    fn is_finished(&self, now: Instant) -> bool {
        match self {
            Slot::Inbound(receiver) => receiver.is_finished(now),
            Slot::Outbound(sender) => sender.is_finished(now),
        }
    }

    fn abort(&mut self) -> Error {
        match self {
            Slot::Inbound(receiver) => {
                receiver.abort();
                Error::Aborted {
                    transfer_id: receiver.id(),
                }
            }
            Slot::Outbound(sender) => {
                sender.abort();
                Error::Aborted {
                    transfer_id: sender.id(),
                }
            }
        }
    }
}

/// 새로 완료된 업로드
struct Completed {
    id: TransferId,
    name: Option<String>,
    data: Bytes,
}

/// 파일 에코 서버
pub struct Server {
    config: Config,
    transport: Arc<dyn Transport>,
    store: FileStore,
    transfers: Arc<DashMap<TransferKey, Slot>>,
    stats: Arc<RwLock<ServerStats>>,
    running: Arc<AtomicBool>,
}

impl Server {
    /// `0.0.0.0:<listen_port>`에 바인딩
    pub async fn bind(config: Config, store: FileStore) -> Result<Self> {
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, config.listen_port).into();
        let socket = UdpSocket::bind(addr).await?;
        Self::new(config, Arc::new(socket), store)
    }

    pub fn new(config: Config, transport: Arc<dyn Transport>, store: FileStore) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            store,
            transfers: Arc::new(DashMap::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// 다른 태스크에서 서버를 제어하기 위한 핸들
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            transfers: self.transfers.clone(),
            stats: self.stats.clone(),
            running: self.running.clone(),
        }
    }

    /// [`ServerHandle::stop`]이 호출될 때까지 데이터그램 처리
    pub async fn run(&self) -> Result<()> {
        info!(
            "서버 시작: {} (저장 경로 {:?})",
            self.local_addr()?,
            self.store.dir()
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            self.service_timers(now).await;

            let poll_deadline = now + POLL_INTERVAL;
            let deadline = self
                .next_deadline()
                .map_or(poll_deadline, |deadline| deadline.min(poll_deadline));

            match recv_until(&*self.transport, &mut buf, Some(deadline)).await {
                Ok(Some((len, from))) => self.handle_datagram(&buf[..len], from).await,
                Ok(None) => {}
                Err(e) => {
                    // ICMP port unreachable 등은 다음 데이터그램에 영향 없음
                    warn!("수신 에러: {}", e);
                }
            }
        }

        let remaining = self.transfers.len();
        if remaining > 0 {
            info!("서버 정지: 진행 중 전송 {}개 폐기", remaining);
            self.transfers.clear();
        }
        info!("서버 정지: {}", self.stats.read().summary());
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.transfers
            .iter()
            .filter_map(|entry| entry.value().next_deadline())
            .min()
    }

    /// 만료 타이머 처리 후 끝난 전송 제거
    async fn service_timers(&self, now: Instant) {
        let mut outgoing: Vec<(SocketAddr, Vec<Frame>)> = Vec::new();

        for mut entry in self.transfers.iter_mut() {
            let key = *entry.key();
            match entry.value_mut().service(now) {
                Ok(frames) if !frames.is_empty() => outgoing.push((key.peer, frames)),
                Ok(_) => {}
                Err(e) => {
                    warn!("전송 {} ({}) 실패: {}", key.id, key.peer, e);
                    let mut stats = self.stats.write();
                    match entry.value() {
                        Slot::Inbound(_) => stats.inbound_failed += 1,
                        Slot::Outbound(_) => stats.outbound_failed += 1,
                    }
                }
            }
        }

        self.transfers.retain(|key, slot| {
            let finished = slot.is_finished(now);
            if finished {
                debug!("전송 {} ({}) 정리 (state={})", key.id, key.peer, slot.state());
            }
            !finished
        });

        for (peer, frames) in outgoing {
            self.send(&frames, peer).await;
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{}의 잘못된 프레임 버림: {}", from, e);
                self.stats.write().malformed_frames += 1;
                return;
            }
        };

        let now = Instant::now();
        let key = TransferKey::new(from, frame.transfer_id);

        // DashMap 가드는 await 전에 해제
        let (replies, completed) = {
            let mut slot = match self.transfers.entry(key) {
                Entry::Occupied(occupied) => occupied.into_ref(),
                Entry::Vacant(vacant) => {
                    if frame.frame_type != FrameType::Data
                        || frame.transfer_id.direction() != Direction::Upload
                    {
                        debug!(
                            "알 수 없는 전송 {} ({}) 프레임 무시: {:?}",
                            frame.transfer_id, from, frame.frame_type
                        );
                        return;
                    }
                    match TransferReceiver::new(frame.transfer_id, frame.total, &self.config, now)
                    {
                        Ok(receiver) => {
                            info!(
                                "전송 {} 수신 시작: {} ({} 프래그먼트)",
                                frame.transfer_id, from, frame.total
                            );
                            vacant.insert(Slot::Inbound(receiver))
                        }
                        Err(e) => {
                            debug!("{}의 첫 DATA 무시: {}", from, e);
                            self.stats.write().malformed_frames += 1;
                            return;
                        }
                    }
                }
            };

            let before = slot.state();
            let replies = slot.handle_frame(&frame, now);
            let after = slot.state();

            let completed = match slot.value_mut() {
                Slot::Inbound(receiver) => receiver.take_data().map(|data| Completed {
                    id: receiver.id(),
                    name: receiver.name().map(str::to_owned),
                    data,
                }),
                Slot::Outbound(_) => {
                    if before != TransferState::Complete && after == TransferState::Complete {
                        self.stats.write().outbound_completed += 1;
                    }
                    None
                }
            };
            (replies, completed)
        };

        self.send(&replies, from).await;

        if let Some(completed) = completed {
            self.stats.write().inbound_completed += 1;
            self.start_echo(from, completed).await;
        }
    }

    /// 완료된 업로드 저장 후 에코 전송 시작
    async fn start_echo(&self, peer: SocketAddr, completed: Completed) {
        let original = completed
            .name
            .unwrap_or_else(|| fallback_name(completed.id));
        let name = derive_name(&original, &self.config.copy_suffix);

        let path = match self.store.store(&completed.data, &name).await {
            Ok(path) => path,
            Err(e) => {
                error!("전송 {} 저장 실패 ({}): {}", completed.id, name, e);
                return;
            }
        };
        self.stats.write().files_stored += 1;
        info!(
            "전송 {} 저장: {:?} ({} bytes)",
            completed.id,
            path,
            completed.data.len()
        );

        let echo_id = completed.id.echo();
        let mut sender =
            match TransferSender::new(echo_id, Some(name), completed.data, &self.config) {
                Ok(sender) => sender,
                Err(e) => {
                    error!("전송 {} 에코 생성 실패: {}", echo_id, e);
                    self.stats.write().outbound_failed += 1;
                    return;
                }
            };

        info!(
            "전송 {} 에코 시작: {} ({} 프래그먼트)",
            echo_id,
            peer,
            sender.total_fragments()
        );
        let frames = sender.poll_transmit(Instant::now());
        self.transfers
            .insert(TransferKey::new(peer, echo_id), Slot::Outbound(sender));

        self.send(&frames, peer).await;
    }

    async fn send(&self, frames: &[Frame], peer: SocketAddr) {
        if frames.is_empty() {
            return;
        }
        if let Err(e) = send_frames(
            &*self.transport,
            frames,
            peer,
            self.config.max_datagram_size,
        )
        .await
        {
            warn!("{}로 전송 실패: {}", peer, e);
        }
    }
}

/// 실행 중인 서버 제어 핸들
#[derive(Clone)]
pub struct ServerHandle {
    transfers: Arc<DashMap<TransferKey, Slot>>,
    stats: Arc<RwLock<ServerStats>>,
    running: Arc<AtomicBool>,
}

impl ServerHandle {
    /// 수신 루프 정지 요청, 다음 폴링 주기에 반영된다
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 테이블에 남아 있는 전송 수 (linger 포함)
    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// 진행 중인 전송 키 목록
    pub fn transfer_keys(&self) -> Vec<TransferKey> {
        self.transfers.iter().map(|entry| *entry.key()).collect()
    }

    /// 전송 중단
    ///
    /// 진행 중인 전송을 Failed로 만들면 true. 없거나 이미 끝났으면 false.
    pub fn abort(&self, key: &TransferKey) -> bool {
        let Some(mut slot) = self.transfers.get_mut(key) else {
            return false;
        };
        if slot.state().is_terminal() {
            return false;
        }

        let err = slot.abort();
        warn!("{} ({})", err, key.peer);

        let mut stats = self.stats.write();
        match slot.value() {
            Slot::Inbound(_) => stats.inbound_failed += 1,
            Slot::Outbound(_) => stats.outbound_failed += 1,
        }
        true
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.read().clone()
    }
}
