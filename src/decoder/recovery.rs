//! Gaussian elimination over the stored coded packets.

use super::parsed::ParsedCod;
use super::Decoder;
use crate::wire::id_older;
use log::debug;

impl Decoder {
    /// Runs one elimination pass and returns the rows that decayed to a
    /// single source (`remaining == 1`, leading coefficient 1). The caller
    /// turns them into recovered SRCs and feeds them back through the
    /// simplification chain.
    pub(crate) fn run_elimination(&mut self) -> Vec<ParsedCod> {
        let mut recovered = Vec::new();
        if self.pkts_cod.len() < 2 {
            return recovered;
        }
        self.src_miss_update();
        if self.src_miss.is_empty() {
            return recovered;
        }
        debug!(
            "recovery initiated: numCodPkts {} missing {:?}",
            self.pkts_cod.len(),
            self.src_miss
        );

        // Top-down: pick a pivot row per missing id, normalize it and
        // eliminate its leading column from the rows below.
        //
        //    1XXX          1XXX
        //      1XX           1XX
        //        XXX          1XX
        //        XXX           1XX
        //      XXXX             1X
        //        XXX             1
        let mut num_rows = self.pkts_cod.len();
        let mut top_row = 0usize;
        let src_miss = std::mem::take(&mut self.src_miss);
        for &miss_id in &src_miss {
            if top_row >= num_rows {
                break;
            }
            // Candidate rows still carrying this column; ties break toward
            // the oldest src_ids[0].
            let mut pivot: Option<usize> = None;
            for r in top_row..num_rows {
                if self.pkts_cod[r].find_src_id(miss_id).is_none() {
                    continue;
                }
                pivot = match pivot {
                    Some(p) if !id_older(
                        self.pkts_cod[r].oldest_id(),
                        self.pkts_cod[p].oldest_id(),
                    ) => Some(p),
                    _ => Some(r),
                };
            }
            let Some(r) = pivot else {
                continue;
            };
            self.pkts_cod.swap(top_row, r);
            self.pkts_cod[top_row].wipe_zeros();
            if self.pkts_cod[top_row].remaining == 1 {
                recovered.push(self.pkts_cod.swap_remove(top_row));
                num_rows -= 1;
                continue;
            }
            self.pkts_cod[top_row].scale_down();
            let pivot_row = self.pkts_cod[top_row].clone();
            for row in self.pkts_cod[top_row + 1..num_rows].iter_mut() {
                row.attach_cod(&pivot_row, 0);
            }
            top_row += 1;
        }
        self.src_miss = src_miss;

        // Bottom-up: back-substitute each surviving row into the rows above
        // it, emitting every row that decays to a single source.
        //
        //    1XXX          1X
        //      1XX           1
        //       1XX           1
        //        1XX           1
        //         1X            1
        //          1             1
        let mut r = self.pkts_cod.len();
        while r > 0 {
            r -= 1;
            self.pkts_cod[r].wipe_zeros();
            match self.pkts_cod[r].remaining {
                0 => {
                    self.pkts_cod.swap_remove(r);
                    continue;
                }
                1 => {
                    recovered.push(self.pkts_cod.swap_remove(r));
                    continue;
                }
                _ => {}
            }
            let pivot_row = self.pkts_cod[r].clone();
            let last_ind = pivot_row.coeff.len() - 1;
            for row in self.pkts_cod[..r].iter_mut() {
                row.attach_cod(&pivot_row, last_ind);
            }
        }

        if !recovered.is_empty() {
            debug!("recovery finished: {} rows decayed", recovered.len());
        }
        recovered
    }
}
