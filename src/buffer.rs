use std::{
    collections::VecDeque,
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// What the producer does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait up to the given time for room, then drop the incoming record.
    Block(Duration),
    /// Evict the oldest queued record to make room.
    DropOldest,
    /// Refuse the incoming record.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Oldest,
    Newest,
    BlockTimeout,
    /// Pushed after the buffer was closed.
    Closed,
    /// Still queued when the consumer stopped for good.
    Abandoned,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::Oldest => "drop-oldest",
            DropReason::Newest => "drop-newest",
            DropReason::BlockTimeout => "block-timeout",
            DropReason::Closed => "closed",
            DropReason::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// A record was lost during this push: the incoming one, or with
    /// `DropOldest` the evicted head.
    Dropped(DropReason),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Record(T),
    /// Nothing arrived in time; the producer is still running.
    Empty,
    /// Closed and fully drained.
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub accepted: u64,
    pub dropped_oldest: u64,
    pub dropped_newest: u64,
    pub dropped_block_timeout: u64,
    pub dropped_closed: u64,
    pub abandoned: u64,
    pub high_water: usize,
}

impl BufferStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_oldest
            + self.dropped_newest
            + self.dropped_block_timeout
            + self.dropped_closed
            + self.abandoned
    }

    pub fn by_reason(&self) -> [(DropReason, u64); 5] {
        [
            (DropReason::Oldest, self.dropped_oldest),
            (DropReason::Newest, self.dropped_newest),
            (DropReason::BlockTimeout, self.dropped_block_timeout),
            (DropReason::Closed, self.dropped_closed),
            (DropReason::Abandoned, self.abandoned),
        ]
    }

    fn count(&mut self, reason: DropReason, n: u64) {
        match reason {
            DropReason::Oldest => self.dropped_oldest += n,
            DropReason::Newest => self.dropped_newest += n,
            DropReason::BlockTimeout => self.dropped_block_timeout += n,
            DropReason::Closed => self.dropped_closed += n,
            DropReason::Abandoned => self.abandoned += n,
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
    stats: BufferStats,
}

/// Bounded FIFO between the acquisition thread and the writer thread.
///
/// Every record that enters is either popped or shows up in
/// [`BufferStats`]; nothing is reordered.
pub struct AcquisitionBuffer<T> {
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> AcquisitionBuffer<T> {
    /// `capacity` is clamped to at least one record.
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            policy,
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                stats: BufferStats::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn push(&self, record: T) -> PushOutcome {
        let mut state = self.lock();
        if state.closed {
            state.stats.count(DropReason::Closed, 1);
            return PushOutcome::Dropped(DropReason::Closed);
        }

        let mut outcome = PushOutcome::Accepted;
        if state.queue.len() >= self.capacity {
            match self.policy {
                BackpressurePolicy::DropNewest => {
                    state.stats.count(DropReason::Newest, 1);
                    return PushOutcome::Dropped(DropReason::Newest);
                }
                BackpressurePolicy::DropOldest => {
                    state.queue.pop_front();
                    state.stats.count(DropReason::Oldest, 1);
                    outcome = PushOutcome::Dropped(DropReason::Oldest);
                }
                BackpressurePolicy::Block(wait) => {
                    let deadline = Instant::now() + wait;
                    while state.queue.len() >= self.capacity && !state.closed {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        state = self
                            .not_full
                            .wait_timeout(state, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                    if state.closed {
                        state.stats.count(DropReason::Closed, 1);
                        return PushOutcome::Dropped(DropReason::Closed);
                    }
                    if state.queue.len() >= self.capacity {
                        state.stats.count(DropReason::BlockTimeout, 1);
                        return PushOutcome::Dropped(DropReason::BlockTimeout);
                    }
                }
            }
        }

        state.queue.push_back(record);
        state.stats.accepted += 1;
        state.stats.high_water = state.stats.high_water.max(state.queue.len());
        drop(state);
        self.not_empty.notify_one();
        outcome
    }

    /// Non-blocking. `None` when the buffer is empty.
    pub fn pop(&self) -> Option<T> {
        let record = self.lock().queue.pop_front();
        if record.is_some() {
            self.not_full.notify_one();
        }
        record
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(record) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Pop::Record(record);
            }
            if state.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Empty;
            }
            state = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// No more pushes will be accepted. Queued records stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Discard whatever is still queued, counting it as abandoned.
    pub fn abandon(&self) -> u64 {
        let mut state = self.lock();
        let n = state.queue.len() as u64;
        state.queue.clear();
        state.stats.count(DropReason::Abandoned, n);
        n
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn drain<T>(buffer: &AcquisitionBuffer<T>) -> Vec<T> {
        std::iter::from_fn(|| buffer.pop()).collect()
    }

    #[test]
    fn drop_oldest_loses_exactly_the_oldest() {
        let n = 8;
        let k = 5;
        let buffer = AcquisitionBuffer::new(n, BackpressurePolicy::DropOldest);
        let outcomes: Vec<_> = (0..n + k).map(|i| buffer.push(i)).collect();

        assert!(outcomes[..n].iter().all(|o| *o == PushOutcome::Accepted));
        assert!(outcomes[n..]
            .iter()
            .all(|o| *o == PushOutcome::Dropped(DropReason::Oldest)));
        assert_eq!(buffer.stats().dropped_oldest, k as u64);
        assert_eq!(buffer.stats().dropped(), k as u64);
        assert_eq!(drain(&buffer), (k..n + k).collect::<Vec<_>>());
    }

    #[test]
    fn drop_newest_keeps_the_head() {
        let buffer = AcquisitionBuffer::new(3, BackpressurePolicy::DropNewest);
        for i in 0..5 {
            buffer.push(i);
        }
        assert_eq!(buffer.stats().dropped_newest, 2);
        assert_eq!(drain(&buffer), vec![0, 1, 2]);
    }

    #[test]
    fn block_gives_up_after_timeout() {
        let buffer = AcquisitionBuffer::new(
            1,
            BackpressurePolicy::Block(Duration::from_millis(20)),
        );
        assert_eq!(buffer.push(1), PushOutcome::Accepted);
        let started = Instant::now();
        assert_eq!(buffer.push(2), PushOutcome::Dropped(DropReason::BlockTimeout));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(drain(&buffer), vec![1]);
    }

    #[test]
    fn block_resumes_when_consumer_pops() {
        let buffer = Arc::new(AcquisitionBuffer::new(
            2,
            BackpressurePolicy::Block(Duration::from_secs(10)),
        ));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match buffer.pop_timeout(Duration::from_millis(50)) {
                        Pop::Record(r) => seen.push(r),
                        Pop::Empty => continue,
                        Pop::Closed => break,
                    }
                }
                seen
            })
        };

        for i in 0..500 {
            assert_eq!(buffer.push(i), PushOutcome::Accepted);
        }
        buffer.close();

        assert_eq!(consumer.join().unwrap(), (0..500).collect::<Vec<_>>());
        assert_eq!(buffer.stats().dropped(), 0);
        assert!(buffer.stats().high_water <= 2);
    }

    #[test]
    fn closed_buffer_drains_then_reports_closed() {
        let buffer = AcquisitionBuffer::new(4, BackpressurePolicy::DropNewest);
        buffer.push('a');
        buffer.close();
        assert_eq!(buffer.push('b'), PushOutcome::Dropped(DropReason::Closed));
        assert_eq!(buffer.pop_timeout(Duration::ZERO), Pop::Record('a'));
        assert_eq!(buffer.pop_timeout(Duration::ZERO), Pop::Closed);
        assert_eq!(buffer.stats().dropped_closed, 1);
    }

    #[test]
    fn abandoned_records_are_counted() {
        let buffer = AcquisitionBuffer::new(4, BackpressurePolicy::DropNewest);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.abandon(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().abandoned, 2);
    }
}
