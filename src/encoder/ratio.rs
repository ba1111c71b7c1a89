//! Adaptive SRC/COD ratio.
//!
//! The encoder's hot path reads the ratio under an RW lock; a measurement
//! thread wakes every `t_period`, folds the period's loss counters into the
//! smoothed residual and steps the ratio by `±delta_ratio`, clamped to
//! `[MIN_RATIO, MAX_RATIO]`. Toggling dynamic/static spawns/joins the
//! thread synchronously through a stop channel.

use super::residual::SmoothedValue;
use crate::config::CConf;
use crate::wire::{MAX_RATIO, MIN_RATIO};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    tx: u64,
    lost: u64,
    unacked: u64,
}

struct RatioShared {
    ratio: RwLock<f64>,
    counters: Mutex<Counters>,
    residual: Mutex<SmoothedValue>,
    period: Duration,
    target: f64,
    delta: f64,
    loss_seen: AtomicBool,
}

impl RatioShared {
    /// One measurement period: read and reset the counters, update the
    /// residual average and step the ratio.
    fn tick(&self) {
        let (lost, tx, unacked) = {
            let mut c = self.counters.lock().unwrap();
            let lost = c.lost;
            let tx = c.tx;
            c.lost = 0;
            c.tx = 0;
            (lost, tx, c.unacked)
        };
        let effective = tx as i64 - unacked as i64;
        if effective <= 0 || lost as i64 >= effective {
            debug!(
                "ratio measurement skipped: tx {} lost {} unacked {}",
                tx, lost, unacked
            );
            return;
        }
        let sample = lost as f64 / (effective - lost as i64) as f64;
        let avg = self.residual.lock().unwrap().update(sample);

        let mut ratio = *self.ratio.read().unwrap();
        if avg > self.target {
            ratio *= 1.0 - self.delta;
        } else {
            ratio *= 1.0 + self.delta;
        }
        ratio = ratio.clamp(MIN_RATIO, MAX_RATIO);
        *self.ratio.write().unwrap() = ratio;
        debug!(
            "ratio update: residual new {:.4} avg {:.4} target {:.4} ratio {:.2}",
            sample, avg, self.target, ratio
        );
    }

    /// Executed when the measurement thread starts.
    fn reset_measurement(&self) {
        self.residual.lock().unwrap().reset();
        let mut c = self.counters.lock().unwrap();
        c.tx = 0;
        c.lost = 0;
    }
}

pub(crate) struct DynRatio {
    shared: Arc<RatioShared>,
    worker: Option<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
}

impl DynRatio {
    pub fn new(conf: &CConf, period: Duration) -> DynRatio {
        let shared = Arc::new(RatioShared {
            ratio: RwLock::new(conf.ratio_val),
            counters: Mutex::new(Counters::default()),
            residual: Mutex::new(SmoothedValue::new(conf.num_periods)),
            period,
            target: conf.gamma_target,
            delta: conf.delta_ratio,
            loss_seen: AtomicBool::new(false),
        });
        let mut r = DynRatio {
            shared,
            worker: None,
        };
        if conf.is_dynamic() {
            r.make_dynamic();
        }
        r
    }

    pub fn check(&self) -> f64 {
        *self.shared.ratio.read().unwrap()
    }

    pub fn maybe_reduce(&self, new_ratio: f64) -> bool {
        let mut ratio = self.shared.ratio.write().unwrap();
        if new_ratio < *ratio {
            *ratio = new_ratio;
            return true;
        }
        false
    }

    pub fn is_dynamic(&self) -> bool {
        self.worker.is_some()
    }

    pub fn make_dynamic(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("rquic-ratio".into())
            .spawn(move || {
                shared.reset_measurement();
                loop {
                    match stop_rx.recv_timeout(shared.period) {
                        Err(RecvTimeoutError::Timeout) => shared.tick(),
                        _ => return,
                    }
                }
            })
            .expect("spawn ratio measurement thread");
        self.worker = Some((stop_tx, handle));
    }

    /// Stops the measurement thread and waits for it to finish.
    pub fn make_static(&mut self) {
        if let Some((stop_tx, handle)) = self.worker.take() {
            drop(stop_tx);
            let _ = handle.join();
        }
    }

    pub fn add_tx_count(&self) {
        self.shared.counters.lock().unwrap().tx += 1;
    }

    pub fn ack_stats_update(&self, lost: u64, delivered: u64, unacked: u64) {
        {
            let mut c = self.shared.counters.lock().unwrap();
            c.lost += lost;
            c.unacked = unacked;
        }
        if lost > 0 {
            self.shared.loss_seen.store(true, Ordering::Relaxed);
        }
        debug!(
            "ack stats: lost {} delivered {} unacked {}",
            lost, delivered, unacked
        );
    }

    pub fn loss_seen(&self) -> bool {
        self.shared.loss_seen.load(Ordering::Relaxed)
    }

    pub fn residual_avg(&self) -> f64 {
        self.shared.residual.lock().unwrap().value()
    }

    /// True when the smoothed residual loss exceeds `target * factor`.
    pub fn res_loss_appreciable(&self, factor: f64) -> bool {
        self.residual_avg() > self.shared.target * factor
    }

    #[allow(dead_code)]
    pub fn change_num_periods(&self, new_num: usize) {
        self.shared
            .residual
            .lock()
            .unwrap()
            .change_num_periods(new_num);
    }
}

impl Drop for DynRatio {
    fn drop(&mut self) {
        self.make_static();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_ratio(ratio_val: f64, num_periods: usize) -> DynRatio {
        let conf = CConf {
            ratio_val,
            dynamic: -1,
            num_periods,
            ..CConf::default()
        };
        DynRatio::new(&conf, Duration::from_millis(75))
    }

    fn report_period(r: &DynRatio, tx: u64, lost: u64) {
        for _ in 0..tx {
            r.add_tx_count();
        }
        r.ack_stats_update(lost, tx - lost, 0);
        r.shared.tick();
    }

    #[test]
    fn lossy_periods_shrink_then_clean_periods_grow() {
        let r = static_ratio(10.0, 3);
        // Three periods of tx=100, lost=5: residual 5/95 over the target.
        report_period(&r, 100, 5);
        let after_first = r.check();
        assert!((after_first - 6.7).abs() < 0.01);
        report_period(&r, 100, 5);
        report_period(&r, 100, 5);
        let low = r.check();
        assert!(low < after_first);
        assert!(low >= MIN_RATIO);
        assert!((r.residual_avg() - 5.0 / 95.0).abs() < 1e-9);

        // Loss-free periods climb back until the window drains the old
        // samples, then keep climbing toward the clamp.
        for _ in 0..20 {
            report_period(&r, 100, 0);
        }
        assert_eq!(r.check(), MAX_RATIO);
    }

    #[test]
    fn ratio_steps_are_monotone_per_tick() {
        let r = static_ratio(10.0, 1);
        report_period(&r, 100, 5);
        let down = r.check();
        assert!(down < 10.0);
        report_period(&r, 100, 0);
        assert!(r.check() > down);
    }

    #[test]
    fn degenerate_periods_are_skipped() {
        let r = static_ratio(10.0, 3);
        // No transmissions at all.
        r.shared.tick();
        assert_eq!(r.check(), 10.0);
        // Everything still unacked.
        for _ in 0..10 {
            r.add_tx_count();
        }
        r.ack_stats_update(0, 0, 10);
        r.shared.tick();
        assert_eq!(r.check(), 10.0);
        // More losses than effective transmissions.
        for _ in 0..5 {
            r.add_tx_count();
        }
        r.ack_stats_update(7, 0, 0);
        r.shared.tick();
        assert_eq!(r.check(), 10.0);
    }

    #[test]
    fn dynamic_toggle_joins_cleanly() {
        let conf = CConf {
            dynamic: 1,
            ..CConf::default()
        };
        let mut r = DynRatio::new(&conf, Duration::from_millis(5));
        assert!(r.is_dynamic());
        r.make_static();
        assert!(!r.is_dynamic());
        r.make_dynamic();
        assert!(r.is_dynamic());
        r.make_static();
    }

    #[test]
    fn cwnd_cap_only_reduces() {
        let r = static_ratio(10.0, 3);
        assert!(!r.maybe_reduce(12.0));
        assert_eq!(r.check(), 10.0);
        assert!(r.maybe_reduce(4.0));
        assert_eq!(r.check(), 4.0);
    }

    #[test]
    fn first_loss_is_remembered() {
        let r = static_ratio(10.0, 3);
        assert!(!r.loss_seen());
        r.ack_stats_update(0, 10, 0);
        assert!(!r.loss_seen());
        r.ack_stats_update(1, 9, 0);
        assert!(r.loss_seen());
    }
}
