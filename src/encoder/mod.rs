// Copyright (c) 2024, The rQUIC Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Sender side: SRC tagging, coded-packet generation and adaptive
//! redundancy control.
//!
//! [`Encoder::process`] mutates each outgoing packet in place, inserting the
//! rQUIC header after the DCID, and stages ack-eliciting packets into the
//! generations under construction. Finished coded packets queue up until
//! [`Encoder::retrieve_coded_packets`] drains them toward the send queue.

mod ratio;
mod residual;

use crate::buffer::{BufferPool, PacketBuffer};
use crate::config::CConf;
use crate::error::{FecError, Result};
use crate::schemes::{RedunBuilder, PREFIX_RESERVE};
use crate::tuning::{PauseEncoding, RuntimeTuning};
use crate::wire::{
    self, Scheme, LEN_OF_SRC_LEN, MAX_PACKET_SIZE, SRC_HEADER_SIZE, TYPE_PROTECTED,
    TYPE_UNPROTECTED,
};
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use ratio::DynRatio;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Congestion-control inputs the encoder consumes from QUIC.
pub trait TransportInfo: Send + Sync {
    /// Congestion window in bytes.
    fn cwnd(&self) -> usize;
    fn smoothed_rtt(&self) -> Duration;
    /// The peer's maxAckDelay transport parameter.
    fn max_ack_delay(&self) -> Duration;
}

struct BuilderSlot {
    builder: RedunBuilder,
    gen_id: u8,
    /// Scales the first close threshold so freshly initialized slots close
    /// staggered and overlapping generations interleave. 1.0 after the
    /// first rotation.
    first_close_scale: f64,
}

pub struct Encoder {
    pkt_id: u8,
    next_gen_id: u8,
    /// Id of the newest staged SRC; flushed generations stamp it into
    /// their pre-header.
    last_src_id: u8,
    scheme: Scheme,
    overlap: u8,
    reduns: u8,
    slots: Vec<BuilderSlot>,
    prev_dcid: Option<Vec<u8>>,
    ratio: DynRatio,
    tuning: RuntimeTuning,
    transport: Arc<dyn TransportInfo>,
    pool: BufferPool,
    cod_queue: VecDeque<PacketBuffer>,
    paused: bool,
    coding_enabled: bool,
    rng: StdRng,
    src_scratch: Vec<u8>,
}

impl Encoder {
    pub fn new(
        conf: &CConf,
        tuning: RuntimeTuning,
        transport: Arc<dyn TransportInfo>,
        pool: BufferPool,
    ) -> Result<Encoder> {
        Encoder::build(conf, tuning, transport, pool, StdRng::from_entropy())
    }

    /// Like [`Encoder::new`] but with reproducible coefficient draws, for
    /// tests and simulation campaigns.
    pub fn with_seed(
        conf: &CConf,
        tuning: RuntimeTuning,
        transport: Arc<dyn TransportInfo>,
        pool: BufferPool,
        seed: u64,
    ) -> Result<Encoder> {
        Encoder::build(conf, tuning, transport, pool, StdRng::seed_from_u64(seed))
    }

    fn build(
        conf: &CConf,
        tuning: RuntimeTuning,
        transport: Arc<dyn TransportInfo>,
        pool: BufferPool,
        rng: StdRng,
    ) -> Result<Encoder> {
        conf.validate()?;
        let period = if conf.t_period.is_zero() {
            3 * transport.smoothed_rtt()
        } else {
            conf.t_period
        };
        let mut enc = Encoder {
            pkt_id: 0,
            next_gen_id: 0,
            last_src_id: 0,
            scheme: conf.scheme,
            overlap: conf.overlap,
            reduns: conf.reduns,
            slots: Vec::new(),
            prev_dcid: None,
            ratio: DynRatio::new(conf, period),
            tuning,
            transport,
            pool,
            cod_queue: VecDeque::new(),
            paused: false,
            coding_enabled: true,
            rng,
            src_scratch: Vec::new(),
        };
        enc.init_slots();
        Ok(enc)
    }

    /// rQUIC header bytes inserted in front of every protected packet.
    pub fn src_overhead() -> usize {
        SRC_HEADER_SIZE
    }

    /// Worst-case wire overhead of a coded packet beyond first byte + DCID.
    pub fn max_cod_overhead(&self) -> usize {
        let seed = self
            .slots
            .iter()
            .map(|s| s.builder.seed_max_field_size())
            .max()
            .unwrap_or(0);
        wire::OVERHEAD_NO_COEFF + seed
    }

    /// Tags one outgoing packet and stages it for coding.
    ///
    /// `raw` holds a fully packed QUIC packet: first byte, DCID, payload.
    /// The rQUIC header is spliced in right after the DCID. Generations
    /// that become full are sealed and their coded packets queued.
    pub fn process(
        &mut self,
        raw: &mut Vec<u8>,
        dcid_len: usize,
        ack_eliciting: bool,
    ) -> Result<()> {
        if raw.len() < 1 + dcid_len {
            return Err(FecError::Malformed("packet shorter than first byte + DCID"));
        }
        self.maybe_reduce_ratio();
        self.ratio.add_tx_count();

        let r_hdr_pos = 1 + dcid_len;
        self.track_dcid(&raw[1..r_hdr_pos]);

        if !ack_eliciting || !self.coding_enabled || self.pause_policy_holds() {
            raw.insert(r_hdr_pos, TYPE_UNPROTECTED);
            return Ok(());
        }

        // A SRC that cannot fit a coded payload lane is sent unprotected.
        let tail_len = raw.len() - r_hdr_pos;
        let record_len = LEN_OF_SRC_LEN + 1 + tail_len;
        let budget = self.pool.block_size().saturating_sub(PREFIX_RESERVE);
        if record_len > budget {
            error!(
                "{}",
                FecError::OversizedSrc {
                    len: record_len,
                    max: budget
                }
            );
            raw.insert(r_hdr_pos, TYPE_UNPROTECTED);
            return Ok(());
        }

        let last_gen = self.slots.last().expect("builder slots").gen_id;
        let hdr = [TYPE_PROTECTED, self.pkt_id, last_gen, self.overlap];
        raw.splice(r_hdr_pos..r_hdr_pos, hdr);

        // SRC record staged into the builders: [len][1st byte][payload].
        let lng = raw.len() - (dcid_len + SRC_HEADER_SIZE);
        let mut scratch = std::mem::take(&mut self.src_scratch);
        scratch.clear();
        scratch.resize(LEN_OF_SRC_LEN, 0);
        wire::pld_len_write(&mut scratch, lng);
        scratch.push(raw[0]);
        scratch.extend_from_slice(&raw[r_hdr_pos + SRC_HEADER_SIZE..]);

        for slot in self.slots.iter_mut() {
            slot.builder.add_src(&scratch, &raw[..r_hdr_pos], &mut self.rng);
        }
        self.src_scratch = scratch;
        self.last_src_id = self.pkt_id;

        // Seal every generation that is full, oldest slot first.
        let ratio = self.ratio.check();
        let mut i = 0;
        while i < self.slots.len() {
            let slot = &self.slots[i];
            if !slot.builder.is_empty()
                && slot.builder.ready_to_send(ratio * slot.first_close_scale)
            {
                let slot = self.slots.remove(i);
                debug!(
                    "generation {} sealed: genSize {} pkt.ID {}",
                    slot.gen_id,
                    slot.builder.gen_size(),
                    self.pkt_id
                );
                for pkt in slot.builder.finish(self.pkt_id, slot.gen_id) {
                    self.cod_queue.push_back(pkt);
                }
                self.push_fresh_slot(1.0);
            } else {
                i += 1;
            }
        }

        self.pkt_id = self.pkt_id.wrapping_add(1);
        Ok(())
    }

    /// Drains the queue of finished coded packets, oldest generation first.
    pub fn retrieve_coded_packets(&mut self) -> Vec<PacketBuffer> {
        self.cod_queue.drain(..).collect()
    }

    pub fn disable_coding(&mut self) {
        if self.coding_enabled {
            self.flush_builders();
            self.coding_enabled = false;
            info!("coding disabled");
        }
    }

    pub fn enable_coding(&mut self) {
        if !self.coding_enabled {
            self.coding_enabled = true;
            info!("coding enabled");
        }
    }

    /// Forwarded once per parsed ACK frame.
    pub fn ack_processed(&mut self, lost: u64, delivered: u64, unacked: u64) {
        self.ratio.ack_stats_update(lost, delivered, unacked);
    }

    pub fn current_ratio(&self) -> f64 {
        self.ratio.check()
    }

    pub fn make_ratio_static(&mut self) {
        self.ratio.make_static();
    }

    pub fn make_ratio_dynamic(&mut self) {
        self.ratio.make_dynamic();
    }

    /// Seals open generations, queues their coded packets and stops the
    /// measurement thread.
    pub fn close(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        let last_id = self.last_src_id;
        for slot in slots {
            if !slot.builder.is_empty() {
                for pkt in slot.builder.finish(last_id, slot.gen_id) {
                    self.cod_queue.push_back(pkt);
                }
            }
        }
        self.ratio.make_static();
    }

    // ------------------------------------------------------------ internals

    fn init_slots(&mut self) {
        self.slots.clear();
        let n = self.overlap.max(1);
        for k in 0..n {
            self.push_fresh_slot((k + 1) as f64 / n as f64);
        }
    }

    fn push_fresh_slot(&mut self, first_close_scale: f64) {
        let gen_id = self.next_gen_id;
        self.next_gen_id = self.next_gen_id.wrapping_add(1);
        self.slots.push(BuilderSlot {
            builder: RedunBuilder::new(self.scheme, self.reduns, &self.pool),
            gen_id,
            first_close_scale,
        });
    }

    fn track_dcid(&mut self, dcid: &[u8]) {
        match &self.prev_dcid {
            Some(prev) if prev == dcid => {}
            Some(_) => {
                debug!("DCID changed, flushing open generations");
                self.prev_dcid = Some(dcid.to_vec());
                self.flush_builders();
            }
            None => self.prev_dcid = Some(dcid.to_vec()),
        }
    }

    /// Seals whatever the open builders hold (with the DCID they captured)
    /// and re-initializes the slots.
    fn flush_builders(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        let last_id = self.last_src_id;
        for slot in slots {
            if !slot.builder.is_empty() {
                for pkt in slot.builder.finish(last_id, slot.gen_id) {
                    self.cod_queue.push_back(pkt);
                }
            }
        }
        self.init_slots();
    }

    /// Discards staged generations without emitting them.
    fn reset_builders(&mut self) {
        self.slots.clear();
        self.init_slots();
    }

    fn pause_policy_holds(&mut self) -> bool {
        let pause = match self.tuning.pause_encoding {
            PauseEncoding::Never => false,
            PauseEncoding::TillFirstLoss => !self.ratio.loss_seen(),
            PauseEncoding::WithResidualLoss => {
                !self.ratio.res_loss_appreciable(self.tuning.res_loss_factor)
            }
        };
        if pause && !self.paused {
            self.paused = true;
            info!("coding paused ({:?})", self.tuning.pause_encoding);
            // Staged coefficients must not survive into the resume.
            self.reset_builders();
        } else if !pause && self.paused {
            self.paused = false;
            info!("coding resumed ({:?})", self.tuning.pause_encoding);
        }
        pause
    }

    /// Step 1 of the per-packet contract: the ratio never exceeds the
    /// number of packets the congestion window can carry, optionally scaled
    /// down further by the receiver's buffering headroom.
    fn maybe_reduce_ratio(&mut self) {
        let mut pkts = (self.transport.cwnd() / MAX_PACKET_SIZE) as f64;
        if self.tuning.lim_rate_to_dec_buffer {
            let srtt = self.transport.smoothed_rtt();
            let bto = self.tuning.buffer_timeout(self.transport.max_ack_delay());
            if !srtt.is_zero() && bto < srtt {
                pkts *= bto.as_secs_f64() / srtt.as_secs_f64();
            }
        }
        if pkts < 1.0 {
            pkts = 1.0;
        }
        if self.ratio.maybe_reduce(pkts) {
            debug!("coding ratio capped by cwnd to {:.2}", pkts);
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.ratio.make_static();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::RuntimeTuning;

    struct StubTransport {
        cwnd: usize,
    }

    impl TransportInfo for StubTransport {
        fn cwnd(&self) -> usize {
            self.cwnd
        }
        fn smoothed_rtt(&self) -> Duration {
            Duration::from_millis(25)
        }
        fn max_ack_delay(&self) -> Duration {
            Duration::from_millis(25)
        }
    }

    fn encoder(conf: &CConf) -> Encoder {
        Encoder::with_seed(
            conf,
            RuntimeTuning::default(),
            Arc::new(StubTransport { cwnd: 1_000_000 }),
            BufferPool::new(64, 2048),
            1,
        )
        .unwrap()
    }

    fn quic_packet(dcid: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0x43u8];
        raw.extend_from_slice(dcid);
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn non_ack_eliciting_gets_a_single_type_byte() {
        let conf = CConf {
            dynamic: -1,
            ..CConf::default()
        };
        let mut enc = encoder(&conf);
        let dcid = [7u8; 4];
        let mut raw = quic_packet(&dcid, &[1, 2, 3]);
        let orig = raw.clone();
        enc.process(&mut raw, dcid.len(), false).unwrap();
        assert_eq!(raw.len(), orig.len() + 1);
        assert_eq!(raw[5], TYPE_UNPROTECTED);
        assert!(enc.retrieve_coded_packets().is_empty());
    }

    #[test]
    fn protected_packets_close_generations_at_the_ratio() {
        let conf = CConf {
            ratio_val: 4.0,
            dynamic: -1,
            ..CConf::default()
        };
        let mut enc = encoder(&conf);
        let dcid = [9u8; 4];
        for i in 0..4u8 {
            let mut raw = quic_packet(&dcid, &[i; 20]);
            enc.process(&mut raw, dcid.len(), true).unwrap();
            // [type, id, lastGen, overlap] after the DCID
            assert_eq!(&raw[5..9], &[TYPE_PROTECTED, i, 0, 1]);
        }
        let cods = enc.retrieve_coded_packets();
        assert_eq!(cods.len(), 1);
        let cod = cods[0].as_slice();
        assert_eq!(cod[0], 0x43);
        assert_eq!(&cod[1..5], &dcid);
        assert_eq!(cod[5], Scheme::Xor.cod_type());
        assert_eq!(cod[6], 3); // pkt id of the newest SRC
        assert_eq!(cod[7], 0); // generation id
        assert_eq!(cod[8], 4); // generation size
    }

    #[test]
    fn dcid_change_flushes_open_generations() {
        let conf = CConf {
            ratio_val: 10.0,
            dynamic: -1,
            ..CConf::default()
        };
        let mut enc = encoder(&conf);
        let mut raw = quic_packet(&[1u8; 4], &[0xAB; 16]);
        enc.process(&mut raw, 4, true).unwrap();
        assert!(enc.retrieve_coded_packets().is_empty());

        let mut raw = quic_packet(&[2u8; 4], &[0xCD; 16]);
        enc.process(&mut raw, 4, true).unwrap();
        let cods = enc.retrieve_coded_packets();
        assert_eq!(cods.len(), 1);
        // The flushed COD still carries the old DCID.
        assert_eq!(&cods[0].as_slice()[1..5], &[1u8; 4]);
        assert_eq!(cods[0].as_slice()[8], 1); // genSize
    }

    #[test]
    fn oversized_src_is_sent_unprotected() {
        let conf = CConf {
            dynamic: -1,
            ..CConf::default()
        };
        let mut enc = Encoder::with_seed(
            &conf,
            RuntimeTuning::default(),
            Arc::new(StubTransport { cwnd: 1_000_000 }),
            BufferPool::new(8, 256),
            1,
        )
        .unwrap();
        let dcid = [3u8; 4];
        let mut raw = quic_packet(&dcid, &[0u8; 400]);
        enc.process(&mut raw, dcid.len(), true).unwrap();
        assert_eq!(raw[5], TYPE_UNPROTECTED);
    }

    #[test]
    fn cwnd_cap_reduces_ratio() {
        let conf = CConf {
            ratio_val: 40.0,
            dynamic: -1,
            ..CConf::default()
        };
        let mut enc = Encoder::with_seed(
            &conf,
            RuntimeTuning::default(),
            Arc::new(StubTransport {
                cwnd: 5 * MAX_PACKET_SIZE,
            }),
            BufferPool::new(8, 2048),
            1,
        )
        .unwrap();
        let mut raw = quic_packet(&[1u8; 4], &[0; 10]);
        enc.process(&mut raw, 4, true).unwrap();
        assert_eq!(enc.current_ratio(), 5.0);
    }

    #[test]
    fn close_flushes_and_joins() {
        let conf = CConf {
            ratio_val: 10.0,
            dynamic: 1,
            t_period: Duration::from_millis(5),
            ..CConf::default()
        };
        let mut enc = encoder(&conf);
        let mut raw = quic_packet(&[1u8; 4], &[7; 12]);
        enc.process(&mut raw, 4, true).unwrap();
        enc.close();
        assert_eq!(enc.retrieve_coded_packets().len(), 1);
    }

    #[test]
    fn overlap_staggers_generation_closes() {
        let conf = CConf {
            scheme: Scheme::RlcSys,
            overlap: 2,
            ratio_val: 4.0,
            dynamic: -1,
            ..CConf::default()
        };
        let mut enc = encoder(&conf);
        let dcid = [5u8; 4];
        let mut close_points = Vec::new();
        for i in 0..8u8 {
            let mut raw = quic_packet(&dcid, &[i; 10]);
            enc.process(&mut raw, dcid.len(), true).unwrap();
            let cods = enc.retrieve_coded_packets();
            if !cods.is_empty() {
                close_points.push((i, cods.len()));
            }
        }
        // Slot 0 closes at half the ratio first, then every 4 SRCs.
        assert_eq!(close_points.first(), Some(&(1, 1)));
        assert!(close_points.len() >= 3);
    }
}
