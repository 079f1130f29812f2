use std::time;

const ALPHA: f64 = 0.8;

/// Exponential moving average of bytes moved in one direction.
#[derive(Debug, Clone, Default)]
pub struct EMA {
    pending: u64,
    accum: f64,
    total: u64,
}

/// Upload and download averages for a peer or a whole torrent,
/// along with lifetime byte totals.
#[derive(Debug, Clone)]
pub struct Monitor {
    ul: EMA,
    dl: EMA,
    accum_time: f64,
    updated: time::Instant,
}

impl EMA {
    fn add(&mut self, amnt: u64) {
        self.pending += amnt;
        self.total += amnt;
    }

    fn tick(&mut self) {
        self.accum = (ALPHA * self.pending as f64) + (1.0 - ALPHA) * self.accum;
        self.pending = 0;
    }

    /// Bytes per second given the averaged tick length in ms.
    fn rate(&self, accum_time: f64) -> u64 {
        (1000.0 * self.accum / accum_time) as u64
    }
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor {
            ul: EMA::default(),
            dl: EMA::default(),
            accum_time: 1.,
            updated: time::Instant::now(),
        }
    }

    pub fn avg_ul(&self) -> u64 {
        self.ul.rate(self.accum_time)
    }

    pub fn avg_dl(&self) -> u64 {
        self.dl.rate(self.accum_time)
    }

    pub fn uploaded(&self) -> u64 {
        self.ul.total
    }

    pub fn downloaded(&self) -> u64 {
        self.dl.total
    }

    pub fn add_ul(&mut self, amnt: u64) {
        self.ul.add(amnt);
    }

    pub fn add_dl(&mut self, amnt: u64) {
        self.dl.add(amnt);
    }

    pub fn tick(&mut self) {
        self.ul.tick();
        self.dl.tick();
        let elapsed = self.updated.elapsed();
        let dur =
            (elapsed.as_secs() * 1000) as f64 + f64::from(elapsed.subsec_nanos()) / 1_000_000.0;
        self.accum_time = (ALPHA * dur) + (1.0 - ALPHA) * self.accum_time;
        self.updated = time::Instant::now();
    }
}

impl Default for Monitor {
    fn default() -> Monitor {
        Monitor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ema() {
        let mut s = Monitor::new();
        s.add_ul(1000);
        thread::sleep(time::Duration::from_millis(50));
        s.tick();

        s.add_ul(0);
        thread::sleep(time::Duration::from_millis(50));
        s.tick();

        s.add_ul(500);
        thread::sleep(time::Duration::from_millis(50));
        s.tick();

        assert!((s.avg_ul() as i64 - 10000).abs() < 8000);
        assert_eq!(s.avg_dl(), 0);
    }

    #[test]
    fn test_totals() {
        let mut s = Monitor::new();
        s.add_dl(16384);
        s.add_dl(16384);
        s.add_ul(100);
        s.tick();
        assert_eq!(s.downloaded(), 32768);
        assert_eq!(s.uploaded(), 100);
        s.tick();
        assert_eq!(s.downloaded(), 32768);
    }
}
