//! Fixed-size frame buffer pool
//!
//! The pool owns `tier.buffer_count` buffers, each sized to the tier's frame
//! budget. A buffer moves through `Free -> Filling -> (Ready ->) Outstanding
//! -> Free`. Consumers only ever see buffers the driver has finished filling,
//! and every outstanding buffer is named by a generation-stamped
//! [`FrameHandle`] so a stale or repeated release is detected instead of
//! corrupting the pool.

use crate::tier::{GrabPolicy, PixelFormat, Tier};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid frame handle: slot {slot}, generation {generation}")]
    InvalidHandle { slot: usize, generation: u64 },

    #[error("buffer pool closed")]
    Closed,
}

/// Geometry and format of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Bare token naming one acquisition of one pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    slot: usize,
    generation: u64,
}

impl FrameHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub reserved: u64,
    pub released: u64,
    pub recycled: u64,
    pub outstanding: usize,
}

enum SlotState {
    Free,
    Filling {
        generation: u64,
    },
    Ready {
        generation: u64,
        seq: u64,
        info: FrameInfo,
        data: Bytes,
    },
    Outstanding {
        generation: u64,
    },
}

struct Slot {
    state: SlotState,
    buf: BytesMut,
}

struct PoolState {
    slots: Vec<Slot>,
    next_generation: u64,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    tier: Tier,
    budget: usize,
    state: Mutex<PoolState>,
    freed: Notify,
    ready: Notify,
    reserved: AtomicU64,
    released: AtomicU64,
    recycled: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock cannot leave a slot half-updated:
        // every transition is a single assignment.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, handle: FrameHandle) -> Result<(), PoolError> {
        let mut state = self.lock();
        let invalid = PoolError::InvalidHandle {
            slot: handle.slot,
            generation: handle.generation,
        };

        let slot = state.slots.get_mut(handle.slot).ok_or(invalid.clone())?;
        match slot.state {
            SlotState::Outstanding { generation } if generation == handle.generation => {
                slot.state = SlotState::Free;
                slot.buf.clear();
                // Reclaims the original allocation once the frame bytes are gone
                slot.buf.reserve(self.budget);
            }
            _ => return Err(invalid),
        }
        drop(state);

        self.released.fetch_add(1, Ordering::Relaxed);
        self.freed.notify_waiters();
        debug!(handle = %handle, "Frame buffer released");
        Ok(())
    }
}

/// Pool of capture buffers shared by the frame source and all consumers
#[derive(Clone)]
pub struct CaptureBufferPool {
    shared: Arc<Shared>,
}

impl CaptureBufferPool {
    /// Allocates `tier.buffer_count` buffers of `tier.frame_budget()` bytes
    pub fn new(tier: Tier) -> Self {
        let budget = tier.frame_budget() as usize;
        let slots = (0..tier.buffer_count)
            .map(|_| Slot {
                state: SlotState::Free,
                buf: BytesMut::with_capacity(budget),
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                tier,
                budget,
                state: Mutex::new(PoolState {
                    slots,
                    next_generation: 0,
                    next_seq: 0,
                    closed: false,
                }),
                freed: Notify::new(),
                ready: Notify::new(),
                reserved: AtomicU64::new(0),
                released: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    pub fn tier(&self) -> Tier {
        self.shared.tier
    }

    pub fn capacity(&self) -> usize {
        self.shared.tier.buffer_count
    }

    /// Byte budget of each buffer
    pub fn frame_budget(&self) -> usize {
        self.shared.budget
    }

    /// Reserves a buffer for the driver to fill
    ///
    /// Under [`GrabPolicy::WaitForFree`] this waits until a consumer
    /// releases a buffer. Under [`GrabPolicy::PreferLatest`] the oldest
    /// filled-but-undelivered buffer is recycled first; it only waits when
    /// every buffer is held by a consumer or the driver.
    pub async fn reserve(&self) -> Result<SlotGuard, PoolError> {
        loop {
            let notified = self.shared.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(guard) = self.try_reserve()? {
                return Ok(guard);
            }

            notified.await;
        }
    }

    /// Non-blocking variant of [`reserve`](Self::reserve)
    pub fn try_reserve(&self) -> Result<Option<SlotGuard>, PoolError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        let free = state
            .slots
            .iter()
            .position(|s| matches!(s.state, SlotState::Free));

        let index = match free {
            Some(index) => index,
            None if self.shared.tier.grab_policy == GrabPolicy::PreferLatest => {
                let oldest = state
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| match s.state {
                        SlotState::Ready { seq, .. } => Some((seq, i)),
                        _ => None,
                    })
                    .min();
                match oldest {
                    Some((seq, index)) => {
                        self.shared.recycled.fetch_add(1, Ordering::Relaxed);
                        debug!(slot = index, seq, "Recycling undelivered frame");
                        index
                    }
                    None => return Ok(None),
                }
            }
            None => return Ok(None),
        };

        let generation = state.next_generation;
        state.next_generation += 1;

        let slot = &mut state.slots[index];
        slot.state = SlotState::Filling { generation };
        let mut buf = std::mem::take(&mut slot.buf);
        drop(state);

        buf.clear();
        buf.reserve(self.shared.budget);
        self.shared.reserved.fetch_add(1, Ordering::Relaxed);

        Ok(Some(SlotGuard {
            shared: Arc::clone(&self.shared),
            handle: FrameHandle {
                slot: index,
                generation,
            },
            buf: Some(buf),
        }))
    }

    /// Takes the most recent completed frame, recycling older ones
    pub fn take_latest(&self) -> Option<FrameRef> {
        let mut state = self.shared.lock();

        let newest = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s.state {
                SlotState::Ready { seq, .. } => Some((seq, i)),
                _ => None,
            })
            .max()?
            .1;

        for (i, slot) in state.slots.iter_mut().enumerate() {
            if i != newest && matches!(slot.state, SlotState::Ready { .. }) {
                slot.state = SlotState::Free;
                self.shared.recycled.fetch_add(1, Ordering::Relaxed);
            }
        }

        let slot = &mut state.slots[newest];
        let (generation, info, data) =
            match std::mem::replace(&mut slot.state, SlotState::Free) {
                SlotState::Ready {
                    generation,
                    info,
                    data,
                    ..
                } => (generation, info, data),
                _ => unreachable!("slot selected as ready"),
            };
        slot.state = SlotState::Outstanding { generation };
        drop(state);

        self.shared.freed.notify_waiters();

        Some(FrameRef {
            data,
            info,
            lease: Some(Lease {
                shared: Arc::clone(&self.shared),
                handle: FrameHandle {
                    slot: newest,
                    generation,
                },
            }),
        })
    }

    /// Waits for a completed frame and takes the most recent one
    pub async fn latest(&self) -> Result<FrameRef, PoolError> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(frame) = self.take_latest() {
                return Ok(frame);
            }
            if self.shared.lock().closed {
                return Err(PoolError::Closed);
            }

            notified.await;
        }
    }

    /// Returns a frame's buffer to the pool
    pub fn release(&self, mut frame: FrameRef) -> Result<(), PoolError> {
        let foreign = match &frame.lease {
            Some(lease) if !Arc::ptr_eq(&lease.shared, &self.shared) => Some(lease.handle),
            _ => None,
        };

        if let Some(handle) = foreign {
            return Err(PoolError::InvalidHandle {
                slot: handle.slot,
                generation: handle.generation,
            });
        }

        // Encoder output owns its bytes; releasing it is a no-op
        frame.release_lease()
    }

    /// Releases an acquisition by its bare handle
    ///
    /// Fails with [`PoolError::InvalidHandle`] unless the handle names the
    /// slot's current outstanding acquisition.
    pub fn release_handle(&self, handle: FrameHandle) -> Result<(), PoolError> {
        self.shared.release(handle)
    }

    /// Number of buffers currently held by the driver or a consumer
    pub fn outstanding(&self) -> usize {
        self.shared
            .lock()
            .slots
            .iter()
            .filter(|s| {
                matches!(
                    s.state,
                    SlotState::Filling { .. } | SlotState::Outstanding { .. }
                )
            })
            .count()
    }

    /// Number of completed frames waiting for a consumer
    pub fn ready(&self) -> usize {
        self.shared
            .lock()
            .slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Ready { .. }))
            .count()
    }

    /// Wakes all waiters with [`PoolError::Closed`]
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.freed.notify_waiters();
        self.shared.ready.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            reserved: self.shared.reserved.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

/// A reserved buffer being filled by the driver
///
/// Dropping the guard without delivering it returns the buffer to the pool.
pub struct SlotGuard {
    shared: Arc<Shared>,
    handle: FrameHandle,
    buf: Option<BytesMut>,
}

impl SlotGuard {
    pub fn handle(&self) -> FrameHandle {
        self.handle
    }

    /// Byte budget the filled frame must fit in
    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.get_or_insert_with(BytesMut::new)
    }

    /// Hands the filled buffer straight to the caller
    pub fn into_frame(mut self, info: FrameInfo) -> FrameRef {
        let data = self.finish();

        let mut state = self.shared.lock();
        state.slots[self.handle.slot].state = SlotState::Outstanding {
            generation: self.handle.generation,
        };
        drop(state);

        FrameRef {
            data,
            info,
            lease: Some(Lease {
                shared: Arc::clone(&self.shared),
                handle: self.handle,
            }),
        }
    }

    /// Parks the filled buffer as the newest undelivered frame
    pub fn commit(mut self, info: FrameInfo) {
        let data = self.finish();

        let mut state = self.shared.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.slots[self.handle.slot].state = SlotState::Ready {
            generation: self.handle.generation,
            seq,
            info,
            data,
        };
        drop(state);

        self.shared.ready.notify_waiters();
    }

    /// Splits the filled bytes off and puts the allocation back in the slot
    fn finish(&mut self) -> Bytes {
        let mut buf = self.buf.take().unwrap_or_default();
        let data = buf.split().freeze();
        self.shared.lock().slots[self.handle.slot].buf = buf;
        data
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        buf.clear();

        let mut state = self.shared.lock();
        let slot = &mut state.slots[self.handle.slot];
        slot.buf = buf;
        slot.state = SlotState::Free;
        drop(state);

        self.shared.freed.notify_waiters();
    }
}

struct Lease {
    shared: Arc<Shared>,
    handle: FrameHandle,
}

/// Owning handle over one captured frame
///
/// A pool-backed frame returns its buffer exactly once: through
/// [`CaptureBufferPool::release`], [`FrameRef::release`], or on drop.
pub struct FrameRef {
    data: Bytes,
    info: FrameInfo,
    lease: Option<Lease>,
}

impl FrameRef {
    /// Creates a frame that owns its bytes outright (not pool-backed)
    pub fn from_bytes(data: Bytes, info: FrameInfo) -> Self {
        Self {
            data,
            info,
            lease: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    /// Pool handle, `None` for frames that own their bytes
    pub fn handle(&self) -> Option<FrameHandle> {
        self.lease.as_ref().map(|l| l.handle)
    }

    /// Returns the buffer to its pool now
    pub fn release(mut self) -> Result<(), PoolError> {
        self.release_lease()
    }

    fn release_lease(&mut self) -> Result<(), PoolError> {
        self.data = Bytes::new();
        match self.lease.take() {
            Some(lease) => lease.shared.release(lease.handle),
            None => Ok(()),
        }
    }
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        if self.lease.is_some() {
            if let Err(e) = self.release_lease() {
                error!(error = %e, "Frame buffer already returned to pool");
            }
        }
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("len", &self.data.len())
            .field("info", &self.info)
            .field("handle", &self.handle())
            .finish()
    }
}
