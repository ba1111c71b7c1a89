//! Fixed-window smoothing of per-period residual-loss samples.

/// Ring of the last `num_periods` samples with an O(1) cumulative sum.
pub(crate) struct SmoothedValue {
    values: Vec<f64>,
    ind: usize,
    cum: f64,
}

impl SmoothedValue {
    pub fn new(num_periods: usize) -> SmoothedValue {
        SmoothedValue {
            values: vec![0.0; num_periods.max(1)],
            ind: 0,
            cum: 0.0,
        }
    }

    pub fn update(&mut self, new_value: f64) -> f64 {
        let n = self.values.len();
        self.ind = (self.ind + 1) % n;
        self.cum += new_value - self.values[self.ind];
        self.values[self.ind] = new_value;
        self.cum / n as f64
    }

    pub fn value(&self) -> f64 {
        self.cum / self.values.len() as f64
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        for v in &mut self.values {
            *v = 0.0;
        }
    }

    /// Resizes the window, keeping the newest samples. Shrinking drops the
    /// oldest ones; growing pads with zeros that age out first.
    pub fn change_num_periods(&mut self, new_num: usize) {
        let n = self.values.len();
        if new_num == 0 || new_num == n {
            return;
        }
        let keep = new_num.min(n);
        let mut newest: Vec<f64> = (0..keep)
            .map(|k| self.values[(self.ind + n - k) % n])
            .collect();
        newest.reverse(); // oldest first
        let mut values = vec![0.0; new_num];
        values[new_num - keep..].copy_from_slice(&newest);
        self.cum = values.iter().sum();
        self.ind = new_num - 1;
        self.values = values;
    }
}
