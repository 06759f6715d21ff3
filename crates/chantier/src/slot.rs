//! Fixed-size slot table bounding how many tasks run at once.
//!
//! Slots move `Empty → Reserved → Running → Empty`. A slot is claimed by
//! [`SlotTable::acquire`], which hands out a [`SlotGuard`]; the guard returns
//! the slot to `Empty` when released or dropped, so a slot is freed exactly
//! once per acquisition even if the watcher holding it panics.
//!
//! Waiters park on a [`Notify`] that fires on every release instead of
//! polling. The first `Empty` slot (lowest index) always wins; there is no
//! FIFO ordering among waiters.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// State of a single execution slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState<H> {
    Empty,
    /// Claimed, backend has not returned a handle yet.
    Reserved,
    Running(H),
}

impl<H> SlotState<H> {
    pub fn is_empty(&self) -> bool {
        matches!(self, SlotState::Empty)
    }
}

pub struct SlotTable<H> {
    slots: Mutex<Vec<SlotState<H>>>,
    freed: Notify,
}

impl<H: Clone> SlotTable<H> {
    /// Create a table with `num_slots` empty slots. The caller guarantees `num_slots >= 1`.
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: Mutex::new(vec![SlotState::Empty; num_slots]),
            freed: Notify::new(),
        }
    }

    /// Slot states are assigned whole, never left half-written by a panic.
    fn lock(&self) -> MutexGuard<'_, Vec<SlotState<H>>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn num_slots(&self) -> usize {
        self.lock().len()
    }

    /// Claim the first empty slot without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard<H>> {
        let mut slots = self.lock();
        let index = slots.iter().position(SlotState::is_empty)?;
        slots[index] = SlotState::Reserved;
        drop(slots);

        tracing::debug!(slot = index, "Slot reserved");
        Some(SlotGuard {
            table: Arc::clone(self),
            index,
            released: false,
        })
    }

    /// Wait until a slot is empty, then claim it.
    pub async fn acquire(self: &Arc<Self>) -> SlotGuard<H> {
        loop {
            // Register interest before scanning so a release between the scan
            // and the await is not missed.
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            freed.await;
        }
    }

    fn occupy(&self, index: usize, handle: H) {
        let mut slots = self.lock();
        debug_assert!(
            matches!(slots[index], SlotState::Reserved),
            "occupying a slot that was not reserved"
        );
        slots[index] = SlotState::Running(handle);
    }

    fn release(&self, index: usize) {
        self.lock()[index] = SlotState::Empty;
        tracing::debug!(slot = index, "Slot released");
        self.freed.notify_waiters();
    }

    /// Whether any slot is reserved or running.
    pub fn any_occupied(&self) -> bool {
        self.lock().iter().any(|s| !s.is_empty())
    }

    pub fn occupied(&self) -> usize {
        self.lock().iter().filter(|s| !s.is_empty()).count()
    }

    /// Handles of every running task, by slot index.
    pub fn running(&self) -> Vec<(usize, H)> {
        self.lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                SlotState::Running(h) => Some((i, h.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SlotState<H>> {
        self.lock().clone()
    }

    /// Wait until every slot is empty.
    pub async fn block_until_all_empty(&self) {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if !self.any_occupied() {
                return;
            }
            freed.await;
        }
    }
}

/// Exclusive claim on one slot. Frees the slot on drop.
#[must_use = "dropping the guard frees the slot immediately"]
pub struct SlotGuard<H: Clone> {
    table: Arc<SlotTable<H>>,
    index: usize,
    released: bool,
}

impl<H: Clone> SlotGuard<H> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Record the running task's handle in the slot (`Reserved → Running`).
    pub fn occupy(&self, handle: H) {
        self.table.occupy(self.index, handle);
    }

    /// Free the slot now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.table.release(self.index);
        }
    }
}

impl<H: Clone> Drop for SlotGuard<H> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<H: Clone> std::fmt::Debug for SlotGuard<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("index", &self.index)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_claims_lowest_empty_slot() {
        let table = Arc::new(SlotTable::<u32>::new(3));
        assert_eq!(table.num_slots(), 3);

        let a = table.acquire().await;
        let b = table.acquire().await;
        let c = table.acquire().await;
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert!(table.try_acquire().is_none());

        b.release();
        let again = table.try_acquire().expect("slot 1 was freed");
        assert_eq!(again.index(), 1);
        drop((a, c, again));
        assert!(!table.any_occupied());
    }

    #[tokio::test]
    async fn slot_lifecycle() {
        let table = Arc::new(SlotTable::<u32>::new(1));
        assert_eq!(table.snapshot(), vec![SlotState::Empty]);

        let guard = table.acquire().await;
        assert_eq!(table.snapshot(), vec![SlotState::Reserved]);

        guard.occupy(4242);
        assert_eq!(table.snapshot(), vec![SlotState::Running(4242)]);
        assert_eq!(table.running(), vec![(0, 4242)]);

        drop(guard);
        assert_eq!(table.snapshot(), vec![SlotState::Empty]);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let table = Arc::new(SlotTable::<u32>::new(1));
        let held = table.acquire().await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), table.acquire()).await;
        assert!(blocked.is_err(), "acquire should wait while the table is full");

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.acquire().await.index() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release();

        let index = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap();
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_slot() {
        let table = Arc::new(SlotTable::<u32>::new(4));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                let guard = table.acquire().await;
                let index = guard.index();
                std::mem::forget(guard);
                index
            }));
        }

        let mut indices = Vec::new();
        for t in tasks {
            indices.push(t.await.unwrap());
        }
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(table.occupied(), 4);
    }

    #[tokio::test]
    async fn block_until_all_empty_waits_for_every_slot() {
        let table = Arc::new(SlotTable::<u32>::new(2));
        table.block_until_all_empty().await;

        let a = table.acquire().await;
        let b = table.acquire().await;
        assert!(table.any_occupied());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(a);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(b);
        });

        tokio::time::timeout(Duration::from_secs(1), table.block_until_all_empty())
            .await
            .expect("all slots should empty");
        assert!(!table.any_occupied());
    }
}
