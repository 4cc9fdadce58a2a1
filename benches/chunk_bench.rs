//! 분할/조립 및 무손실 메모리 전송 벤치마크

use std::time::Instant;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::seq::SliceRandom;

use rft::{
    Chunker, Config, Frame, Reassembler, TransferId, TransferReceiver, TransferSender,
    TransferState,
};

const SIZES: [usize; 3] = [64 * 1024, 1024 * 1024, 8 * 1024 * 1024];

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

fn chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    let fragment_size = Config::default().fragment_size();

    for &size in &SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("split", size), &data, |b, data| {
            b.iter(|| {
                let chunker = Chunker::new(data.clone(), fragment_size).unwrap();
                chunker.fragments().map(|f| f.payload.len()).sum::<usize>()
            });
        });
    }
    group.finish();
}

fn reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let fragment_size = Config::default().fragment_size();

    for &size in &SIZES {
        let chunker = Chunker::new(payload(size), fragment_size).unwrap();
        let mut fragments: Vec<_> = chunker.fragments().collect();
        fragments.shuffle(&mut rand::thread_rng());
        let total = chunker.total_fragments();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("shuffled", size),
            &fragments,
            |b, fragments| {
                b.iter(|| {
                    let mut reassembler = Reassembler::new(total);
                    for fragment in fragments {
                        reassembler.insert(fragment.seq, fragment.payload.clone());
                    }
                    reassembler.assemble().unwrap()
                });
            },
        );
    }
    group.finish();
}

fn frame_codec(c: &mut Criterion) {
    let config = Config::default();
    let frame = Frame::data(
        TransferId::from_u32(1),
        7,
        100,
        payload(config.fragment_size()),
    );
    let encoded = frame.encode(config.max_datagram_size).unwrap();

    c.bench_function("frame_encode", |b| {
        b.iter(|| frame.encode(config.max_datagram_size).unwrap())
    });
    c.bench_function("frame_decode", |b| b.iter(|| Frame::decode(&encoded).unwrap()));
}

/// 소켓 없이 송신/수신 상태 기계만 구동
fn in_memory_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_transfer");
    let config = Config::default();
    let size = 1024 * 1024;
    let data = payload(size);

    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("1MB", |b| {
        b.iter(|| {
            let now = Instant::now();
            let id = TransferId::from_u32(1);
            let mut sender = TransferSender::new(id, None, data.clone(), &config).unwrap();
            let mut receiver =
                TransferReceiver::new(id, sender.total_fragments(), &config, now).unwrap();

            while sender.state() != TransferState::Complete {
                let mut replies = Vec::new();
                for frame in sender.poll_transmit(now) {
                    replies.extend(receiver.handle_frame(&frame, now));
                }
                for reply in replies {
                    for back in sender.handle_frame(&reply, now) {
                        receiver.handle_frame(&back, now);
                    }
                }
            }
            receiver.take_data().unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, chunking, reassembly, frame_codec, in_memory_transfer);
criterion_main!(benches);
