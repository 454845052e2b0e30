/// Token bucket backed by a tokio semaphore.
///
/// A bucket created with zero capacity is disabled: every acquire returns immediately.
#[derive(Debug)]
pub struct Semaphore {
    capacity: usize,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sem: tokio::sync::Semaphore::new(capacity),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Holds one token until the returned permit is dropped.
    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed
        self.sem.acquire().await.ok()
    }

    /// Takes one token out of the bucket; it only comes back through `run_replenish`.
    pub async fn consume(&self) {
        self.consume_many(1).await;
    }

    pub async fn consume_many(&self, tokens: u32) {
        if !self.is_enabled() {
            return;
        }
        // asking for more than the bucket can ever hold would park the caller forever
        let capacity = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let tokens = tokens.clamp(1, capacity);
        if let Ok(permit) = self.sem.acquire_many(tokens).await {
            permit.forget();
        }
    }

    pub async fn run_replenish(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        let replenish = replenish.min(self.capacity);
        loop {
            tokio::time::sleep(interval).await;
            let available = self.sem.available_permits();
            if available >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - available);
        }
    }
}
