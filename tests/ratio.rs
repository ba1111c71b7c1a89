//! Live measurement-thread behavior of the adaptive ratio.

use rquic::{BufferPool, CConf, Encoder, RuntimeTuning, TransportInfo};
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

fn quic_packet(i: u8) -> Vec<u8> {
    let mut raw = vec![0x40u8];
    raw.extend_from_slice(&DCID);
    raw.extend_from_slice(&[i, i, i, i]);
    raw
}

#[test]
fn measurement_thread_reacts_to_loss_reports() {
    let conf = CConf {
        ratio_val: 10.0,
        dynamic: 1,
        t_period: Duration::from_millis(10),
        num_periods: 1,
        ..CConf::default()
    };
    let mut enc = Encoder::with_seed(
        &conf,
        RuntimeTuning::default(),
        Arc::new(StubTransport),
        BufferPool::new(64, 2048),
        7,
    )
    .unwrap();

    // Lossy periods: the ratio must come down from its initial value.
    for round in 0..5u8 {
        for j in 0..30u8 {
            let mut raw = quic_packet(round.wrapping_mul(30).wrapping_add(j));
            enc.process(&mut raw, DCID.len(), true).unwrap();
        }
        enc.ack_processed(10, 20, 0);
        std::thread::sleep(Duration::from_millis(15));
        enc.retrieve_coded_packets();
    }
    let lossy = enc.current_ratio();
    assert!(lossy < 10.0, "ratio should shrink under loss, got {lossy}");
    assert!(lossy >= rquic::MIN_RATIO);

    // Clean periods: the ratio climbs again.
    for round in 0..5u8 {
        for j in 0..30u8 {
            let mut raw = quic_packet(round.wrapping_mul(30).wrapping_add(j));
            enc.process(&mut raw, DCID.len(), true).unwrap();
        }
        enc.ack_processed(0, 30, 0);
        std::thread::sleep(Duration::from_millis(15));
        enc.retrieve_coded_packets();
    }
    let clean = enc.current_ratio();
    assert!(clean > lossy, "ratio should grow without loss, got {clean}");
    assert!(clean <= rquic::MAX_RATIO);

    enc.close();
}

#[test]
fn static_dynamic_toggle_is_clean() {
    let conf = CConf {
        dynamic: 1,
        t_period: Duration::from_millis(5),
        ..CConf::default()
    };
    let mut enc = Encoder::with_seed(
        &conf,
        RuntimeTuning::default(),
        Arc::new(StubTransport),
        BufferPool::new(16, 2048),
        7,
    )
    .unwrap();
    enc.make_ratio_static();
    enc.make_ratio_dynamic();
    enc.make_ratio_static();
    enc.make_ratio_dynamic();
    // Drop with the thread running: close must join it.
    enc.close();
}
