//! Rendezvous points between the workers of a (privacy) peer.
//!
//! [`CountingBarrier`] is opened by a controller (the orchestrator) once all of its
//! participants arrived, [`PhaseBarrier`] releases itself once the last worker arrived and
//! elects that worker as the leader of the cycle.

use tokio::sync::watch;
use tracing::trace;

/// Errors returned by the barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BarrierError {
    /// The controller aborted the barrier.
    #[error("barrier was aborted")]
    Aborted,
    /// A waiter was cancelled or the barrier was explicitly broken.
    #[error("barrier is broken")]
    Broken,
}

#[derive(Debug, Default, Clone, Copy)]
struct CountingState {
    generation: u64,
    waiting: usize,
    aborted: bool,
}

/// A reusable barrier that releases its waiters only when the controller opens it.
#[derive(Debug)]
pub struct CountingBarrier {
    parties: usize,
    state: watch::Sender<CountingState>,
}

impl CountingBarrier {
    /// Creates a barrier for `parties` participants.
    pub fn new(parties: usize) -> Self {
        let (state, _) = watch::channel(CountingState::default());
        Self { parties, state }
    }

    /// The number of participants the barrier waits for.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// The number of participants currently blocked.
    pub fn waiting(&self) -> usize {
        self.state.borrow().waiting
    }

    /// Blocks until the controller opens the barrier.
    ///
    /// Dropping the returned future before it completes withdraws the arrival.
    pub async fn block(&self) -> Result<(), BarrierError> {
        let mut arrival = None;
        self.state.send_modify(|s| {
            if !s.aborted {
                s.waiting += 1;
                arrival = Some(s.generation);
            }
        });
        let Some(generation) = arrival else {
            return Err(BarrierError::Aborted);
        };
        let mut guard = Arrival {
            barrier: self,
            generation,
            released: false,
        };
        let mut state = self.state.subscribe();
        let aborted = match state
            .wait_for(|s| s.aborted || s.generation != generation)
            .await
        {
            Ok(s) => s.generation == generation,
            Err(_) => true,
        };
        guard.released = true;
        if aborted {
            Err(BarrierError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Waits until all participants are blocked, then releases them.
    ///
    /// The arrival count is reset, so participants arriving afterwards block until the
    /// next call.
    pub async fn open_barrier(&self) -> Result<(), BarrierError> {
        let mut state = self.state.subscribe();
        loop {
            let ready = state
                .wait_for(|s| s.aborted || s.waiting >= self.parties)
                .await
                .map(|s| !s.aborted)
                .unwrap_or(false);
            if !ready {
                return Err(BarrierError::Aborted);
            }
            let opened = self.state.send_if_modified(|s| {
                if s.aborted || s.waiting < self.parties {
                    return false;
                }
                s.generation += 1;
                s.waiting = 0;
                true
            });
            if opened {
                trace!(parties = self.parties, "barrier opened");
                return Ok(());
            }
        }
    }

    /// Releases every current and future waiter with [`BarrierError::Aborted`].
    pub fn abort(&self) {
        self.state.send_modify(|s| s.aborted = true);
    }
}

struct Arrival<'a> {
    barrier: &'a CountingBarrier,
    generation: u64,
    released: bool,
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let generation = self.generation;
        self.barrier.state.send_if_modified(|s| {
            if s.generation == generation && s.waiting > 0 {
                s.waiting -= 1;
                true
            } else {
                false
            }
        });
    }
}

/// The arrival rank of a worker at a [`PhaseBarrier`], `0` is the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(pub usize);

impl Rank {
    /// Whether this worker arrived last and leads the cycle.
    pub fn is_leader(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseState {
    generation: u64,
    arrived: usize,
    broken: bool,
}

/// A cyclic barrier among a fixed number of workers.
#[derive(Debug)]
pub struct PhaseBarrier {
    parties: usize,
    state: watch::Sender<PhaseState>,
}

impl PhaseBarrier {
    /// Creates a barrier for `parties` workers.
    pub fn new(parties: usize) -> Self {
        let (state, _) = watch::channel(PhaseState::default());
        Self { parties, state }
    }

    /// The number of workers taking part in each cycle.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Whether the barrier was broken.
    pub fn is_broken(&self) -> bool {
        self.state.borrow().broken
    }

    /// Waits until all workers arrived in the current cycle.
    ///
    /// Returns the arrival rank; the last worker to arrive gets rank 0. If this future is
    /// dropped while waiting the barrier is broken for everyone.
    pub async fn wait(&self) -> Result<Rank, BarrierError> {
        let mut ticket = None;
        self.state.send_modify(|s| {
            if s.broken {
                return;
            }
            s.arrived += 1;
            let order = s.arrived;
            let generation = s.generation;
            if order >= self.parties {
                s.generation += 1;
                s.arrived = 0;
            }
            ticket = Some((generation, order));
        });
        let Some((generation, order)) = ticket else {
            return Err(BarrierError::Broken);
        };
        let rank = Rank(self.parties.saturating_sub(order));
        if rank.is_leader() {
            return Ok(rank);
        }
        let mut guard = Waiter {
            barrier: self,
            done: false,
        };
        let mut state = self.state.subscribe();
        let tripped = match state
            .wait_for(|s| s.broken || s.generation != generation)
            .await
        {
            Ok(s) => s.generation != generation,
            Err(_) => false,
        };
        guard.done = true;
        if tripped {
            Ok(rank)
        } else {
            Err(BarrierError::Broken)
        }
    }

    /// Breaks the barrier: every current and later waiter observes [`BarrierError::Broken`].
    pub fn break_barrier(&self) {
        self.state.send_modify(|s| s.broken = true);
    }
}

struct Waiter<'a> {
    barrier: &'a PhaseBarrier,
    done: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.barrier.break_barrier();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::{task::JoinSet, time::timeout};

    use super::*;

    #[tokio::test]
    async fn counting_barrier_releases_only_when_opened() {
        let barrier = Arc::new(CountingBarrier::new(2));
        let mut waiters = JoinSet::new();
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            waiters.spawn(async move { barrier.block().await });
        }
        while barrier.waiting() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(
            timeout(Duration::from_millis(50), waiters.join_next())
                .await
                .is_err()
        );
        barrier.open_barrier().await.unwrap();
        while let Some(released) = waiters.join_next().await {
            assert_eq!(released.unwrap(), Ok(()));
        }
        assert_eq!(barrier.waiting(), 0);
    }

    #[tokio::test]
    async fn late_arrival_waits_for_next_opening() {
        let barrier = Arc::new(CountingBarrier::new(1));
        let first = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.block().await })
        };
        barrier.open_barrier().await.unwrap();
        assert_eq!(first.await.unwrap(), Ok(()));

        let late = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.block().await })
        };
        while barrier.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!late.is_finished());
        barrier.open_barrier().await.unwrap();
        assert_eq!(late.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn cancelled_block_withdraws_arrival() {
        let barrier = CountingBarrier::new(2);
        assert!(
            timeout(Duration::from_millis(10), barrier.block())
                .await
                .is_err()
        );
        assert_eq!(barrier.waiting(), 0);
    }

    #[tokio::test]
    async fn abort_releases_waiters() {
        let barrier = Arc::new(CountingBarrier::new(3));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.block().await })
        };
        while barrier.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        barrier.abort();
        assert_eq!(waiter.await.unwrap(), Err(BarrierError::Aborted));
        assert_eq!(barrier.block().await, Err(BarrierError::Aborted));
        assert_eq!(barrier.open_barrier().await, Err(BarrierError::Aborted));
    }

    #[tokio::test]
    async fn phase_barrier_elects_one_leader_per_cycle() {
        let barrier = Arc::new(PhaseBarrier::new(3));
        let mut workers = JoinSet::new();
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            workers.spawn(async move {
                let mut ranks = vec![];
                for _ in 0..4 {
                    ranks.push(barrier.wait().await?);
                }
                Ok::<_, BarrierError>(ranks)
            });
        }
        let mut all = vec![];
        while let Some(ranks) = workers.join_next().await {
            all.push(ranks.unwrap().unwrap());
        }
        for cycle in 0..4 {
            let mut ranks: Vec<usize> = all.iter().map(|r| r[cycle].0).collect();
            ranks.sort();
            assert_eq!(ranks, vec![0, 1, 2]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn phase_barrier_cycles_do_not_overlap() {
        const CYCLES: usize = 20;
        let barrier = Arc::new(PhaseBarrier::new(3));
        let counters = || -> Arc<Vec<AtomicUsize>> {
            Arc::new((0..CYCLES).map(|_| AtomicUsize::new(0)).collect())
        };
        let (arrived, released) = (counters(), counters());
        let mut workers = JoinSet::new();
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            let (arrived, released) = (Arc::clone(&arrived), Arc::clone(&released));
            workers.spawn(async move {
                for cycle in 0..CYCLES {
                    arrived[cycle].fetch_add(1, Ordering::SeqCst);
                    barrier.wait().await?;
                    assert_eq!(arrived[cycle].load(Ordering::SeqCst), 3, "cycle {cycle}");
                    if cycle > 0 {
                        let previous = released[cycle - 1].load(Ordering::SeqCst);
                        assert_eq!(previous, 3, "cycle {cycle}");
                    }
                    released[cycle].fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
                Ok::<_, BarrierError>(())
            });
        }
        while let Some(result) = workers.join_next().await {
            result.unwrap().unwrap();
        }
        assert!(released.iter().all(|r| r.load(Ordering::SeqCst) == 3));
    }

    #[tokio::test]
    async fn cancelled_waiter_breaks_barrier() {
        let barrier = Arc::new(PhaseBarrier::new(2));
        assert!(
            timeout(Duration::from_millis(10), barrier.wait())
                .await
                .is_err()
        );
        assert!(barrier.is_broken());
        assert_eq!(barrier.wait().await, Err(BarrierError::Broken));
    }

    #[tokio::test]
    async fn break_barrier_releases_waiters() {
        let barrier = Arc::new(PhaseBarrier::new(2));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        barrier.break_barrier();
        assert_eq!(waiter.await.unwrap(), Err(BarrierError::Broken));
    }

    #[tokio::test]
    async fn single_party_is_always_leader() {
        let barrier = PhaseBarrier::new(1);
        assert!(barrier.wait().await.unwrap().is_leader());
        assert!(barrier.wait().await.unwrap().is_leader());
    }
}
