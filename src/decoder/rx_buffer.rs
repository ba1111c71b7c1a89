//! Ordered receive buffer.
//!
//! Holds source packets (native and recovered) sorted by modular packet id
//! and releases them to QUIC once every older id has been delivered or
//! given up. A gap is given up when the waiting packet's generation falls
//! behind the straggler threshold, or when the buffer timeout fires.

use crate::buffer::PacketBuffer;
use crate::tuning::RuntimeTuning;
use crate::wire::{id_older, FLAG_CODED, FLAG_OBSOLETE};
use log::debug;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub(crate) struct RxEntry {
    pub buf: PacketBuffer,
    pub id: u8,
    /// Newest generation this packet belongs to; drives the straggler rule.
    pub gen: u8,
    pub flags: u8,
    pub rcv_time: Instant,
    /// rQUIC header bytes still present in `buf`, stripped on delivery.
    pub strip: usize,
    pub r_hdr_pos: usize,
}

pub(crate) struct RxBuffer {
    /// Oldest to newest under modular id comparison.
    list: VecDeque<RxEntry>,
    /// Unprotected packets bypass ordering entirely.
    ready: VecDeque<PacketBuffer>,
    /// One past the last delivered id; `None` until the first delivery.
    next_expected: Option<u8>,
    last_seen_gen: Option<u8>,
    alarm: Option<Instant>,
    /// While set, out-of-order packets still get a chance and the straggler
    /// threshold stays two generations back instead of one. Cleared by a
    /// timeout-forced release, restored by the next in-order delivery.
    ooo_grace: bool,
    bto: Duration,
    bto_only: bool,
}

impl RxBuffer {
    pub fn new(tuning: &RuntimeTuning, max_ack_delay: Duration) -> RxBuffer {
        RxBuffer {
            list: VecDeque::new(),
            ready: VecDeque::new(),
            next_expected: None,
            last_seen_gen: None,
            alarm: None,
            ooo_grace: true,
            bto: tuning.buffer_timeout(max_ack_delay),
            bto_only: tuning.bto_only,
        }
    }

    pub fn update_max_ack_delay(&mut self, tuning: &RuntimeTuning, max_ack_delay: Duration) {
        self.bto = tuning.buffer_timeout(max_ack_delay);
    }

    pub fn len(&self) -> usize {
        self.list.len() + self.ready.len()
    }

    /// Queues an unprotected packet for immediate delivery.
    pub fn push_ready(&mut self, buf: PacketBuffer) {
        self.ready.push_back(buf);
    }

    /// Inserts a source packet, walking from the tail until the predecessor
    /// is older or equal.
    pub fn insert(&mut self, entry: RxEntry) {
        match self.last_seen_gen {
            Some(g) if !id_older(g, entry.gen) => {}
            _ => self.last_seen_gen = Some(entry.gen),
        }
        let mut pos = self.list.len();
        while pos > 0 && id_older(entry.id, self.list[pos - 1].id) {
            pos -= 1;
        }
        self.list.insert(pos, entry);
    }

    /// Restores strict modular order after recovery has spliced packets in.
    pub fn order(&mut self) {
        for i in 1..self.list.len() {
            let mut j = i;
            while j > 0 && id_older(self.list[j].id, self.list[j - 1].id) {
                self.list.swap(j, j - 1);
                j -= 1;
            }
        }
    }

    /// Flags every buffered packet older than `xhold`; flagged entries are
    /// skipped on delivery and released on the next scan.
    pub fn drop_obsolete(&mut self, xhold: u8) {
        for e in self.list.iter_mut() {
            if id_older(e.id, xhold) {
                e.flags |= FLAG_OBSOLETE;
            }
        }
    }

    /// Deadline the connection loop should wake at, if a packet is waiting.
    pub fn alarm(&self) -> Option<Instant> {
        self.alarm
    }

    /// Next packet ready for QUIC, header already restored.
    pub fn pop_ready(&mut self, now: Instant) -> Option<PacketBuffer> {
        if let Some(buf) = self.ready.pop_front() {
            return Some(buf);
        }
        loop {
            let Some(head) = self.list.front() else {
                self.alarm = None;
                return None;
            };
            if head.flags & FLAG_OBSOLETE != 0 {
                debug!("buffer dropping obsolete pkt.ID {}", head.id);
                self.list.pop_front();
                continue;
            }
            let Some(expected) = self.next_expected else {
                // Nothing delivered yet, no gap to speak of.
                return Some(self.deliver(true));
            };
            if head.id == expected {
                return Some(self.deliver(true));
            }
            if id_older(head.id, expected) {
                // A straggler arriving after its gap was given up.
                debug!("buffer dropping late pkt.ID {}", head.id);
                self.list.pop_front();
                continue;
            }
            // Gap in front of head. Give it up once recovery cannot happen
            // anymore, or once the buffer timeout expires.
            if !self.bto_only {
                if let Some(last_gen) = self.last_seen_gen {
                    let margin = if self.ooo_grace { 2 } else { 1 };
                    let straggler_gen = last_gen.wrapping_sub(margin);
                    if id_older(head.gen, straggler_gen) {
                        debug!("gap before pkt.ID {} given up, generation stale", head.id);
                        return Some(self.deliver(false));
                    }
                }
            }
            let deadline = *self.alarm.get_or_insert(head.rcv_time + self.bto);
            if now >= deadline {
                debug!("gap before pkt.ID {} given up, buffer timeout", head.id);
                self.ooo_grace = false;
                return Some(self.deliver(false));
            }
            return None;
        }
    }

    fn deliver(&mut self, in_order: bool) -> PacketBuffer {
        let mut entry = self.list.pop_front().expect("non-empty list");
        debug!(
            "buffer delivering pkt.ID {} wasCoded {}",
            entry.id,
            entry.flags & FLAG_CODED != 0
        );
        self.next_expected = Some(entry.id.wrapping_add(1));
        self.alarm = None;
        if in_order {
            self.ooo_grace = true;
        }
        if entry.strip > 0 {
            entry.buf.strip_gap(entry.r_hdr_pos, entry.strip);
        }
        entry.buf
    }
}
