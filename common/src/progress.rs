#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters shared by the transfer tasks and the aggregator of one session run.
#[derive(Debug)]
pub struct Progress {
    /// Bytes read from sources so far, including transfers that failed midway.
    pub bytes_streamed: TlsCounter,
    pub bytes_mirrored: TlsCounter,
    pub objects_mirrored: TlsCounter,
    /// Units skipped because a previous run already mirrored them.
    pub bytes_replayed: TlsCounter,
    pub objects_replayed: TlsCounter,
    pub objects_failed: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            bytes_streamed: Default::default(),
            bytes_mirrored: Default::default(),
            objects_mirrored: Default::default(),
            bytes_replayed: Default::default(),
            objects_replayed: Default::default(),
            objects_failed: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub total_bytes: u64,
    pub total_objects: u64,
    /// Bytes streamed out of sources by this run.
    pub bytes_transferred: u64,
    /// Bytes of units confirmed mirrored into every target.
    pub bytes_mirrored: u64,
    pub objects_mirrored: u64,
    pub bytes_replayed: u64,
    pub objects_replayed: u64,
    pub objects_failed: u64,
    pub elapsed: std::time::Duration,
}

impl Summary {
    /// Average throughput of this run in bytes per second.
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "total: {} in {} objects\n\
            bytes transferred: {}\n\
            bytes mirrored: {}\n\
            objects mirrored: {}\n\
            bytes already mirrored: {}\n\
            objects already mirrored: {}\n\
            objects failed: {}\n\
            elapsed: {:.2?}\n\
            average speed: {}/s",
            bytesize::ByteSize(self.total_bytes),
            self.total_objects,
            bytesize::ByteSize(self.bytes_transferred),
            bytesize::ByteSize(self.bytes_mirrored),
            self.objects_mirrored,
            bytesize::ByteSize(self.bytes_replayed),
            self.objects_replayed,
            self.objects_failed,
            self.elapsed,
            bytesize::ByteSize(self.speed() as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn speed_of_empty_run_is_zero() {
        assert_eq!(Summary::default().speed(), 0.0);
        let summary = Summary {
            bytes_transferred: 1000,
            bytes_mirrored: 400,
            elapsed: std::time::Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(summary.speed(), 500.0);
    }
}
