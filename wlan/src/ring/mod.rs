//! Descriptor rings.
//!
//! A ring is a fixed array of [`DescriptorSlot`]s paired 1:1 with the
//! buffers of a [`PayloadPool`]. The host produces at `head` and reaps at
//! `tail`; `free_count` is tracked explicitly so a full ring and an empty
//! ring are never confused.
//!
//! ```text
//!   tail ──> [done][done][dev ][dev ][free][free] <── head
//!             reap() ──────────>       try_produce() ──>
//! ```
//!
//! The same ring serves both directions: Tx produces filled buffers, Rx
//! produces empty buffers for the device to fill.
//!
//! # Reference
//! `slot` module for the ownership protocol.

pub mod slot;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;

use payload_pool::{arena_len, DeviceRef, PayloadPool, MAX_BUFFERS};

use crate::error::RingError;
use crate::rate::RateMask;
use crate::types::{FlowState, PeerId};

pub use slot::{
    ControlFlags, DescriptorSlot, DeviceSide, Owner, SlotStatus, StatusFlags, TxErrorCode,
};

// ═══════════════════════════════════════════════════════════════════════════
// RING KINDS
// ═══════════════════════════════════════════════════════════════════════════

/// Direction-specific ring behaviour.
pub trait RingKind {
    /// Name for log messages.
    const NAME: &'static str;
    /// Copy the payload out of the buffer when a slot is reaped.
    const COPY_OUT: bool;
    /// Host-private per-slot cookie, handed back on completion.
    type Tag: Copy + Default;
}

/// Transmit direction. Slots remember the destination peer.
#[derive(Debug)]
pub enum Tx {}

/// Receive direction.
#[derive(Debug)]
pub enum Rx {}

impl RingKind for Tx {
    const NAME: &'static str = "tx";
    const COPY_OUT: bool = false;
    type Tag = Option<PeerId>;
}

impl RingKind for Rx {
    const NAME: &'static str = "rx";
    const COPY_OUT: bool = true;
    type Tag = ();
}

/// Slot table as shared with the device.
pub type SharedSlots = Arc<[DescriptorSlot]>;

// ═══════════════════════════════════════════════════════════════════════════
// HANDLES
// ═══════════════════════════════════════════════════════════════════════════

/// A slot just handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    pub index: usize,
    pub buffer_ref: DeviceRef,
}

/// A slot the device finished with, already returned to the free set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSlot<T> {
    /// Slot index.
    pub index: usize,
    /// Status fields as written by the device.
    pub status: SlotStatus,
    /// Buffer the slot pointed at.
    pub buffer_ref: DeviceRef,
    /// Cookie supplied at produce time.
    pub tag: T,
    /// Copied payload (Rx only, empty on error).
    pub payload: Vec<u8>,
}

impl<T> CompletedSlot<T> {
    pub fn length(&self) -> usize {
        self.status.length as usize
    }

    pub fn is_error(&self) -> bool {
        self.status.flags.contains(StatusFlags::ERROR)
    }
}

/// Free-slot thresholds for Tx backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Stop when free slots drop below this.
    pub low: usize,
    /// Resume when free slots rise above this.
    pub high: usize,
}

impl Watermarks {
    /// Whether a ring of `capacity` slots can both stop and resume.
    ///
    /// Free slots never exceed `capacity`, so `high` must stay below it.
    pub fn fits(&self, capacity: usize) -> bool {
        self.low < self.high && self.high < capacity
    }
}

/// Ownership transitions recorded for the host/device audit in tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Audit {
    Published(usize),
    ObservedHost(usize),
    StatusRead(usize),
}

// ═══════════════════════════════════════════════════════════════════════════
// RING
// ═══════════════════════════════════════════════════════════════════════════

/// Circular descriptor ring with its paired payload buffers.
pub struct DescriptorRing<K: RingKind> {
    slots: SharedSlots,
    pool: PayloadPool,
    /// Backing memory for `pool`, released in `Drop`.
    arena: *mut [u8],
    tags: Vec<K::Tag>,
    head: usize,
    tail: usize,
    free_count: usize,
    watermarks: Option<Watermarks>,
    stopped: bool,
    flow_event: Option<FlowState>,
    #[cfg(test)]
    pub(crate) audit: Vec<Audit>,
    _kind: PhantomData<K>,
}

impl<K: RingKind> DescriptorRing<K> {
    /// Allocate a ring of `capacity` slots with `buffer_size`-byte buffers.
    ///
    /// `map` is the bus's mapping from host memory to a device reference.
    pub fn new(
        capacity: usize,
        buffer_size: usize,
        map: impl FnOnce(*mut u8, usize) -> DeviceRef,
    ) -> Result<Self, RingError> {
        if capacity == 0 || capacity > MAX_BUFFERS {
            return Err(RingError::Pool(payload_pool::PoolError::InvalidGeometry));
        }

        let len = arena_len(buffer_size, capacity);
        let arena = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let base = arena as *mut u8;
        let device_base = map(base, len);
        // SAFETY: `arena` is `len` bytes, owned by the ring until `Drop`;
        // `device_base` is the bus's view of it.
        let pool = match unsafe { PayloadPool::new(base, device_base, buffer_size, capacity) } {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: produced by `Box::into_raw` above, not shared yet.
                drop(unsafe { Box::from_raw(arena) });
                return Err(e.into());
            }
        };

        let slots: Vec<DescriptorSlot> = (0..capacity).map(|_| DescriptorSlot::new()).collect();

        log::debug!(
            "{} ring: {} slots x {} bytes at {:?}",
            K::NAME,
            capacity,
            buffer_size,
            device_base
        );

        Ok(Self {
            slots: slots.into(),
            pool,
            arena,
            tags: vec![K::Tag::default(); capacity],
            head: 0,
            tail: 0,
            free_count: capacity,
            watermarks: None,
            stopped: false,
            flow_event: None,
            #[cfg(test)]
            audit: Vec::new(),
            _kind: PhantomData,
        })
    }

    /// Enable stop/resume signalling at the given free-slot thresholds.
    pub fn with_watermarks(mut self, watermarks: Watermarks) -> Self {
        debug_assert!(
            watermarks.fits(self.capacity()),
            "watermarks {:?} never resume on {} slots",
            watermarks,
            self.capacity()
        );
        self.watermarks = Some(watermarks);
        self
    }

    /// Slot table to register with the device.
    pub fn shared(&self) -> SharedSlots {
        Arc::clone(&self.slots)
    }

    pub fn slot(&self, index: usize) -> Option<&DescriptorSlot> {
        self.slots.get(index)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn in_flight(&self) -> usize {
        self.capacity() - self.free_count
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size()
    }

    pub fn pool(&self) -> &PayloadPool {
        &self.pool
    }

    /// Whether the producer was told to stop.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Watermark crossing since the last call, if any.
    pub fn take_flow_event(&mut self) -> Option<FlowState> {
        self.flow_event.take()
    }

    /// Copy `payload` into the next slot and hand it to the device.
    ///
    /// Fails with [`RingError::Full`] when no slot is free; that is normal
    /// backpressure, not a fault.
    pub fn try_produce(
        &mut self,
        payload: &[u8],
        control: ControlFlags,
        rate: RateMask,
        tag: K::Tag,
    ) -> Result<SlotHandle, RingError> {
        self.produce_with(control, rate, tag, |pool, index| {
            pool.write(index, payload)?;
            Ok(payload.len())
        })
    }

    /// Hand the next slot's empty buffer to the device to fill.
    pub fn post_buffer(&mut self, tag: K::Tag) -> Result<SlotHandle, RingError> {
        self.produce_with(ControlFlags::empty(), RateMask::empty(), tag, |pool, _| {
            Ok(pool.buffer_size())
        })
    }

    /// Post empty buffers until the ring is full. Returns how many.
    pub fn fill(&mut self) -> Result<usize, RingError> {
        let mut posted = 0;
        while self.free_count > 0 {
            self.post_buffer(K::Tag::default())?;
            posted += 1;
        }
        Ok(posted)
    }

    fn produce_with(
        &mut self,
        control: ControlFlags,
        rate: RateMask,
        tag: K::Tag,
        write: impl FnOnce(&mut PayloadPool, usize) -> Result<usize, payload_pool::PoolError>,
    ) -> Result<SlotHandle, RingError> {
        if self.free_count == 0 {
            return Err(RingError::Full);
        }

        let index = self.head;
        let slot = &self.slots[index];
        match slot.owner() {
            Ok(Owner::Host) => {}
            Ok(Owner::Device) => {
                // free_count says free, device says otherwise.
                return Err(RingError::Corrupt {
                    index,
                    raw: Owner::Device.to_raw(),
                });
            }
            Err(raw) => return Err(RingError::Corrupt { index, raw }),
        }

        let buffer_ref = self.pool.claim(index)?;
        let length = match write(&mut self.pool, index) {
            Ok(len) => len,
            Err(e) => {
                let _ = self.pool.release(index);
                return Err(e.into());
            }
        };
        self.pool.hand_to_device(index)?;

        slot.host_fill(control, length as u16, rate, buffer_ref);
        self.tags[index] = tag;
        slot.publish(Owner::Device);
        #[cfg(test)]
        self.audit.push(Audit::Published(index));

        self.head = (self.head + 1) % self.capacity();
        self.free_count -= 1;

        if let Some(wm) = self.watermarks {
            if !self.stopped && self.free_count < wm.low {
                self.stopped = true;
                self.flow_event = Some(FlowState::Stopped);
                log::trace!("{} ring: stop queue, {} free", K::NAME, self.free_count);
            }
        }

        Ok(SlotHandle { index, buffer_ref })
    }

    /// Walk completed slots from `tail`.
    ///
    /// The returned iterator is lazy and stops at the first slot the device
    /// still owns or has not marked done. Dropping it early is fine; the
    /// next call resumes from the persisted `tail`.
    pub fn reap(&mut self) -> Reap<'_, K> {
        Reap {
            ring: self,
            fault: None,
        }
    }

    /// Force every slot back to the host and drop everything in flight.
    ///
    /// Last-resort recovery when the device stopped completing slots.
    /// Returns how many slots were taken away from the device.
    pub fn emergency_reset(&mut self) -> usize {
        let mut reclaimed = 0;
        for slot in self.slots.iter() {
            if slot.owner() != Ok(Owner::Host) {
                reclaimed += 1;
            }
            slot.clear_status();
            slot.publish(Owner::Host);
        }
        self.pool.release_all();
        for tag in self.tags.iter_mut() {
            *tag = K::Tag::default();
        }
        self.head = 0;
        self.tail = 0;
        self.free_count = self.capacity();
        if self.stopped {
            self.stopped = false;
            self.flow_event = Some(FlowState::Resumed);
        }
        log::warn!(
            "{} ring: emergency reset, reclaimed {} device-owned slots",
            K::NAME,
            reclaimed
        );
        reclaimed
    }

    fn complete_tail(&mut self) -> Result<Option<CompletedSlot<K::Tag>>, RingError> {
        if self.free_count == self.capacity() {
            return Ok(None);
        }

        let index = self.tail;
        let slot = &self.slots[index];
        match slot.owner() {
            Ok(Owner::Device) => return Ok(None),
            Err(raw) => return Err(RingError::Corrupt { index, raw }),
            Ok(Owner::Host) => {}
        }
        #[cfg(test)]
        self.audit.push(Audit::ObservedHost(index));
        if !slot.host_done() {
            return Ok(None);
        }

        let status = slot.host_status();
        let buffer_ref = slot.buffer_ref();
        #[cfg(test)]
        self.audit.push(Audit::StatusRead(index));

        self.pool.reclaim(index)?;
        let payload = if K::COPY_OUT && !status.flags.contains(StatusFlags::ERROR) {
            let len = (status.length as usize).min(self.pool.buffer_size());
            self.pool.read(index, len)?.to_vec()
        } else {
            Vec::new()
        };
        self.pool.release(index)?;
        slot.clear_status();
        let tag = core::mem::take(&mut self.tags[index]);

        self.tail = (self.tail + 1) % self.capacity();
        self.free_count += 1;

        if let Some(wm) = self.watermarks {
            if self.stopped && self.free_count > wm.high {
                self.stopped = false;
                self.flow_event = Some(FlowState::Resumed);
                log::trace!("{} ring: resume queue, {} free", K::NAME, self.free_count);
            }
        }

        Ok(Some(CompletedSlot {
            index,
            status,
            buffer_ref,
            tag,
            payload,
        }))
    }
}

impl<K: RingKind> Drop for DescriptorRing<K> {
    fn drop(&mut self) {
        // SAFETY: produced by `Box::into_raw` in `new` and freed only here.
        drop(unsafe { Box::from_raw(self.arena) });
    }
}

// SAFETY: the pool's raw pointer targets `arena`, which the ring owns.
unsafe impl<K: RingKind> Send for DescriptorRing<K> where K::Tag: Send {}

/// Lazy walk over completed slots. See [`DescriptorRing::reap`].
pub struct Reap<'a, K: RingKind> {
    ring: &'a mut DescriptorRing<K>,
    fault: Option<RingError>,
}

impl<K: RingKind> Reap<'_, K> {
    /// Protocol violation that ended the walk, if any.
    pub fn fault(&self) -> Option<RingError> {
        self.fault
    }
}

impl<K: RingKind> Iterator for Reap<'_, K> {
    type Item = CompletedSlot<K::Tag>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fault.is_some() {
            return None;
        }
        match self.ring.complete_tail() {
            Ok(done) => done,
            Err(e) => {
                log::error!("{} ring: {}", K::NAME, e);
                self.fault = Some(e);
                None
            }
        }
    }
}
