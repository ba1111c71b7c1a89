use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rquic::{BufferPool, CConf, Encoder, RuntimeTuning, Scheme, TransportInfo};
use std::sync::Arc;
use std::time::Duration;

const DCID: [u8; 4] = [0xD0, 0xC1, 0x1D, 0x04];

struct StubTransport;

impl TransportInfo for StubTransport {
    fn cwnd(&self) -> usize {
        1 << 20
    }
    fn smoothed_rtt(&self) -> Duration {
        Duration::from_millis(25)
    }
    fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(25)
    }
}

fn encoder(scheme: Scheme) -> Encoder {
    let conf = CConf {
        scheme,
        ratio_val: 32.0,
        dynamic: -1,
        ..CConf::default()
    };
    Encoder::with_seed(
        &conf,
        RuntimeTuning::default(),
        Arc::new(StubTransport),
        BufferPool::new(128, 2048),
        7,
    )
    .unwrap()
}

fn packet() -> Vec<u8> {
    let mut raw = vec![0x43u8];
    raw.extend_from_slice(&DCID);
    raw.extend_from_slice(&vec![0xAB; 1200]);
    raw
}

fn bench_process(c: &mut Criterion) {
    let template = packet();

    let mut enc = encoder(Scheme::Xor);
    c.bench_function("encoder_process_xor_1200B", |b| {
        b.iter(|| {
            let mut raw = template.clone();
            enc.process(&mut raw, DCID.len(), true).unwrap();
            black_box(&raw);
            enc.retrieve_coded_packets();
        })
    });

    let mut enc = encoder(Scheme::RlcSys);
    c.bench_function("encoder_process_rlc_1200B", |b| {
        b.iter(|| {
            let mut raw = template.clone();
            enc.process(&mut raw, DCID.len(), true).unwrap();
            black_box(&raw);
            enc.retrieve_coded_packets();
        })
    });
}

criterion_group!(benches, bench_process);
criterion_main!(benches);
