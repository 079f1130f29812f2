use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::time;

use crate::util::panic_msg;

/// A timer callback, rescheduled for as long as it returns true.
pub type Job = Box<dyn FnMut() -> bool + Send>;

/// Time ordered list of the scheduler's timers.
pub struct JobManager {
    jobs: BinaryHeap<JobData>,
    seq: u64,
}

struct JobData {
    job: Job,
    deadline: time::Instant,
    interval: time::Duration,
    seq: u64,
}

impl JobManager {
    pub fn new() -> JobManager {
        JobManager {
            jobs: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn add_job(&mut self, job: Job, interval: time::Duration) {
        trace!("Registering timer with interval {:?}", interval);
        self.seq += 1;
        self.jobs.push(JobData {
            job,
            interval,
            deadline: time::Instant::now() + interval,
            seq: self.seq,
        })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Time until the earliest timer fires, zero if one is overdue.
    pub fn next_timeout(&self) -> Option<time::Duration> {
        let now = time::Instant::now();
        self.jobs.peek().map(|j| {
            if j.deadline > now {
                j.deadline - now
            } else {
                time::Duration::from_millis(0)
            }
        })
    }

    /// Runs every timer whose deadline has passed. Timers added by a
    /// running job are not run until the next update.
    pub fn update(&mut self) {
        let now = time::Instant::now();
        let mut rescheduled = Vec::new();
        while self.jobs.peek().map(|j| j.deadline <= now).unwrap_or(false) {
            let mut j = match self.jobs.pop() {
                Some(j) => j,
                None => break,
            };
            let res = panic::catch_unwind(AssertUnwindSafe(|| (j.job)()));
            match res {
                Ok(true) => {
                    j.deadline = time::Instant::now() + j.interval;
                    rescheduled.push(j);
                }
                Ok(false) => {}
                Err(e) => error!("Timer panicked, dropping it: {}", panic_msg(&e)),
            }
        }
        self.jobs.extend(rescheduled);
    }
}

impl Default for JobManager {
    fn default() -> JobManager {
        JobManager::new()
    }
}

impl PartialEq for JobData {
    fn eq(&self, other: &JobData) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for JobData {}

impl PartialOrd for JobData {
    fn partial_cmp(&self, other: &JobData) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max heap, so the earliest deadline compares greatest.
impl Ord for JobData {
    fn cmp(&self, other: &JobData) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
