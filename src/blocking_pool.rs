//! A [BlockingPool] hands out up to `capacity` reusable resources, producing them lazily and blocking acquirers once
//! that many exist and all are checked out.
//!
//! Bookkeeping is an arena of slots.  Every resource handed out carries a [PoolHandle] naming the pool, the drain
//! generation it was produced in, its slot, and the lease it was checked out under, so a release is checked against
//! the slot's state rather than against the value itself.  Two structurally equal buffers can never be confused for
//! one another, and a stale copy of a handle cannot release a slot somebody else has since acquired.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("resource was not produced by this pool (or was produced before the last drain)")]
    InvalidResource,
    #[error("resource in slot {slot} is not currently acquired")]
    NotAcquired { slot: usize },
}

/// Where a resource stands from the pool's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Produced by this pool and not checked out under this handle's lease: waiting in the available queue, or handed
    /// out again since this handle was released.
    Free,
    /// Produced by this pool and checked out under this handle's lease.
    InUse,
    /// Not known to this pool: foreign, or produced before a drain.
    Unknown,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolHandle {
    pool: u64,
    generation: u64,
    slot: usize,
    lease: u64,
}

/// A resource checked out of a [BlockingPool].
///
/// Give it back with [BlockingPool::release].  Dropping it instead simply loses the slot until the next drain.
#[derive(Clone, Debug)]
pub struct Pooled<T> {
    handle: PoolHandle,
    value: T,
}

impl<T> Pooled<T> {
    pub fn handle(&self) -> PoolHandle {
        self.handle
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Slot {
    Free,
    /// Checked out under the given lease.
    InUse(u64),
    /// Reserved by an acquirer whose producer panicked; reused by the next reservation.
    Vacant,
}

struct PoolState<T> {
    generation: u64,
    slots: Vec<Slot>,
    /// Number of slots that are not vacant.
    created: usize,
    available: VecDeque<(usize, T)>,
    next_lease: u64,
}

impl<T> PoolState<T> {
    fn lease(&mut self) -> u64 {
        self.next_lease += 1;
        self.next_lease
    }

    /// Claim a slot for a resource about to be produced, returning the slot and its lease.
    fn reserve(&mut self) -> (usize, u64) {
        self.created += 1;
        let lease = self.lease();
        if let Some(i) = self.slots.iter().position(|s| *s == Slot::Vacant) {
            self.slots[i] = Slot::InUse(lease);
            return (i, lease);
        }

        self.slots.push(Slot::InUse(lease));
        (self.slots.len() - 1, lease)
    }
}

pub struct BlockingPool<T> {
    id: u64,
    capacity: usize,
    state: Mutex<PoolState<T>>,
    returned: Condvar,
    produce: Box<dyn Fn() -> T + Send + Sync>,
}

/// Undoes a slot reservation if the producer unwinds before the resource exists.
struct Reservation<'a, T> {
    pool: &'a BlockingPool<T>,
    generation: u64,
    slot: usize,
    armed: bool,
}

impl<'a, T> Drop for Reservation<'a, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.pool.state.lock();
        if state.generation == self.generation {
            state.slots[self.slot] = Slot::Vacant;
            state.created -= 1;
        }
        drop(state);
        self.pool.returned.notify_one();
    }
}

impl<T> BlockingPool<T> {
    pub fn new(capacity: usize, produce: impl Fn() -> T + Send + Sync + 'static) -> BlockingPool<T> {
        BlockingPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            state: Mutex::new(PoolState {
                generation: 0,
                slots: vec![],
                created: 0,
                available: VecDeque::new(),
                next_lease: 0,
            }),
            returned: Condvar::new(),
            produce: Box::new(produce),
        }
    }

    fn handle(&self, generation: u64, slot: usize, lease: u64) -> PoolHandle {
        PoolHandle {
            pool: self.id,
            generation,
            slot,
            lease,
        }
    }

    /// Pop an available resource or reserve a slot to produce one into, without waiting.
    fn take_or_reserve(&self, state: &mut MutexGuard<PoolState<T>>) -> Option<Result<Pooled<T>, PoolHandle>> {
        if let Some((slot, value)) = state.available.pop_front() {
            let lease = state.lease();
            state.slots[slot] = Slot::InUse(lease);
            return Some(Ok(Pooled {
                handle: self.handle(state.generation, slot, lease),
                value,
            }));
        }

        if state.created < self.capacity {
            let (slot, lease) = state.reserve();
            return Some(Err(self.handle(state.generation, slot, lease)));
        }

        None
    }

    /// Run the producer for a reserved slot.  Must be called without holding the state lock.
    fn produce_into(&self, handle: PoolHandle) -> Pooled<T> {
        let mut reservation = Reservation {
            pool: self,
            generation: handle.generation,
            slot: handle.slot,
            armed: true,
        };
        let value = (self.produce)();
        reservation.armed = false;
        Pooled { handle, value }
    }

    /// Get a resource, producing one if fewer than `capacity` exist and otherwise waiting for a release.
    pub fn acquire(&self) -> Pooled<T> {
        let mut state = self.state.lock();
        loop {
            match self.take_or_reserve(&mut state) {
                Some(Ok(pooled)) => return pooled,
                Some(Err(reserved)) => {
                    drop(state);
                    return self.produce_into(reserved);
                }
                None => self.returned.wait(&mut state),
            }
        }
    }

    /// Like [BlockingPool::acquire], but returns `None` instead of waiting.
    pub fn try_acquire(&self) -> Option<Pooled<T>> {
        let mut state = self.state.lock();
        match self.take_or_reserve(&mut state)? {
            Ok(pooled) => Some(pooled),
            Err(reserved) => {
                drop(state);
                Some(self.produce_into(reserved))
            }
        }
    }

    /// Return a resource, waking one waiting acquirer.
    pub fn release(&self, pooled: Pooled<T>) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let PoolHandle {
            pool,
            generation,
            slot,
            lease,
        } = pooled.handle;
        if pool != self.id || generation != state.generation {
            return Err(PoolError::InvalidResource);
        }

        match state.slots.get(slot) {
            Some(Slot::InUse(current)) if *current == lease => {}
            // Released already, possibly re-acquired by somebody else since.
            Some(Slot::Free) | Some(Slot::InUse(_)) => return Err(PoolError::NotAcquired { slot }),
            _ => return Err(PoolError::InvalidResource),
        }

        state.slots[slot] = Slot::Free;
        state.available.push_back((slot, pooled.value));
        drop(state);
        self.returned.notify_one();
        Ok(())
    }

    /// Forget every resource.  Outstanding ones stay valid for their holders but can no longer be released here.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.slots.clear();
        state.created = 0;
        state.available.clear();
        drop(state);
        self.returned.notify_all();
    }

    pub fn state_of(&self, pooled: &Pooled<T>) -> SlotState {
        let state = self.state.lock();
        let h = pooled.handle;
        if h.pool != self.id || h.generation != state.generation {
            return SlotState::Unknown;
        }

        match state.slots.get(h.slot) {
            Some(Slot::InUse(lease)) if *lease == h.lease => SlotState::InUse,
            Some(Slot::Free) | Some(Slot::InUse(_)) => SlotState::Free,
            _ => SlotState::Unknown,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resources produced since the last drain.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// Resources currently checked out.
    pub fn acquired(&self) -> usize {
        let state = self.state.lock();
        state.created - state.available.len()
    }

    /// Produced resources waiting to be reused.
    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    /// How many more resources may still be produced.
    pub fn creatable(&self) -> usize {
        self.capacity - self.created()
    }
}

impl<T> std::fmt::Debug for BlockingPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockingPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("generation", &state.generation)
            .field("created", &state.created)
            .field("available", &state.available.len())
            .finish()
    }
}
