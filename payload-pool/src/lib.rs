//! Fixed-size frame buffer arena with device-visible references.
//!
//! A `PayloadPool` carves a caller-provided memory region into `count`
//! equally sized buffers. Each buffer is addressable two ways:
//!
//! - by the host, through a CPU pointer that never leaves this crate
//! - by the device, through an opaque 32-bit [`DeviceRef`]
//!
//! Descriptor fields on the target hardware are 32 bits wide, so the whole
//! region must be reachable with 32-bit references. This is checked once at
//! construction instead of truncating host pointers at every call site.
//!
//! # Ownership State Machine
//! ```text
//!     FREE ──claim()──> HOST ──hand_to_device()──> DEVICE
//!       ▲                 │  ▲                        │
//!       └───release()─────┘  └──────reclaim()─────────┘
//! ```
//!
//! INVARIANT: the bytes of a DEVICE buffer are never touched by the host.
//!
//! # Usage
//!
//! ```ignore
//! use payload_pool::{DeviceRef, PayloadPool};
//!
//! let pool = unsafe { PayloadPool::new(arena_ptr, DeviceRef::from_raw(base), 2400, 16)? };
//! let dref = pool.claim(0)?;
//! pool.write(0, frame)?;
//! pool.hand_to_device(0)?;
//! ```

#![no_std]

use core::fmt;

/// Maximum number of buffers per pool.
pub const MAX_BUFFERS: usize = 256;

/// Alignment applied to every buffer stride.
pub const BUFFER_ALIGN: usize = 4;

// ============================================================================
// Utility functions
// ============================================================================

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Bytes of arena needed for `count` buffers of `buffer_size` bytes.
#[inline]
pub const fn arena_len(buffer_size: usize, count: usize) -> usize {
    align_up(buffer_size, BUFFER_ALIGN) * count
}

// ============================================================================
// Device reference
// ============================================================================

/// Opaque device-visible reference to a pool buffer.
///
/// Produced only by [`PayloadPool`] and by the bus mapping that hands out
/// the region base. Host code never turns it back into a pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceRef(u32);

impl DeviceRef {
    /// Reference that points nowhere (empty descriptor field).
    pub const NULL: DeviceRef = DeviceRef(0);

    /// Wrap a raw value read from or destined for a descriptor field.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value for descriptor encoding.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Reference `bytes` past this one, if it still fits in 32 bits.
    pub fn offset(self, bytes: usize) -> Option<DeviceRef> {
        let bytes = u32::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(DeviceRef)
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRef({:#010x})", self.0)
    }
}

// ============================================================================
// Buffer ownership
// ============================================================================

/// Ownership state of one pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Unclaimed, available for the next ring slot.
    Free,
    /// Claimed by the host; contents may be read and written.
    Host,
    /// Handed to the device; contents are off limits.
    Device,
}

impl BufferState {
    pub fn is_free(self) -> bool {
        self == BufferState::Free
    }

    pub fn can_access(self) -> bool {
        self == BufferState::Host
    }

    pub fn is_device_owned(self) -> bool {
        self == BufferState::Device
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Too many buffers or a zero-sized buffer was requested.
    InvalidGeometry,
    /// The region does not fit the 32-bit device reference space.
    DeviceRefOverflow,
    /// Buffer index out of range.
    InvalidIndex(usize),
    /// Transition not allowed from the buffer's current state.
    WrongState {
        index: usize,
        state: BufferState,
    },
    /// Payload larger than one buffer.
    TooLarge {
        len: usize,
        capacity: usize,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGeometry => write!(f, "Invalid pool geometry"),
            Self::DeviceRefOverflow => write!(f, "Pool exceeds 32-bit device reference space"),
            Self::InvalidIndex(i) => write!(f, "Invalid buffer index {}", i),
            Self::WrongState { index, state } => {
                write!(f, "Buffer {} in wrong state ({:?})", index, state)
            }
            Self::TooLarge { len, capacity } => {
                write!(f, "Payload of {} bytes exceeds buffer capacity {}", len, capacity)
            }
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Arena of fixed-size frame buffers.
pub struct PayloadPool {
    /// CPU pointer to the region start.
    base: *mut u8,
    /// Device reference of the region start.
    device_base: DeviceRef,
    /// Usable bytes per buffer.
    buffer_size: usize,
    /// Distance between consecutive buffers.
    stride: usize,
    /// Number of buffers.
    count: usize,
    /// Per-buffer ownership.
    states: [BufferState; MAX_BUFFERS],
    /// Buffers not in `Free`.
    claimed: usize,
}

impl PayloadPool {
    /// Create a pool over an existing region.
    ///
    /// # Arguments
    /// - `base`: CPU pointer to region start
    /// - `device_base`: device-visible reference of the same byte
    /// - `buffer_size`: usable bytes per buffer
    /// - `count`: number of buffers (max [`MAX_BUFFERS`])
    ///
    /// # Safety
    /// - `base` must be valid for reads and writes of
    ///   `arena_len(buffer_size, count)` bytes for the pool's lifetime
    /// - `device_base` must be the device's view of `base`
    pub unsafe fn new(
        base: *mut u8,
        device_base: DeviceRef,
        buffer_size: usize,
        count: usize,
    ) -> Result<Self, PoolError> {
        if count == 0 || count > MAX_BUFFERS || buffer_size == 0 || base.is_null() {
            return Err(PoolError::InvalidGeometry);
        }

        let stride = align_up(buffer_size, BUFFER_ALIGN);
        let last = stride
            .checked_mul(count - 1)
            .and_then(|off| off.checked_add(buffer_size))
            .ok_or(PoolError::DeviceRefOverflow)?;
        device_base.offset(last).ok_or(PoolError::DeviceRefOverflow)?;

        Ok(Self {
            base,
            device_base,
            buffer_size,
            stride,
            count,
            states: [BufferState::Free; MAX_BUFFERS],
            claimed: 0,
        })
    }

    /// Claim a free buffer for the host (Free -> Host).
    ///
    /// Returns the buffer's device reference.
    pub fn claim(&mut self, index: usize) -> Result<DeviceRef, PoolError> {
        self.transition(index, BufferState::Free, BufferState::Host)?;
        self.claimed += 1;
        Ok(self.device_ref_unchecked(index))
    }

    /// Copy `bytes` into a host-owned buffer.
    pub fn write(&mut self, index: usize, bytes: &[u8]) -> Result<usize, PoolError> {
        self.expect_state(index, BufferState::Host)?;
        if bytes.len() > self.buffer_size {
            return Err(PoolError::TooLarge {
                len: bytes.len(),
                capacity: self.buffer_size,
            });
        }
        // SAFETY: index is in range, buffer is host-owned, length checked.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cpu_ptr(index), bytes.len());
        }
        Ok(bytes.len())
    }

    /// First `len` bytes of a host-owned buffer.
    pub fn read(&self, index: usize, len: usize) -> Result<&[u8], PoolError> {
        self.expect_state(index, BufferState::Host)?;
        if len > self.buffer_size {
            return Err(PoolError::TooLarge {
                len,
                capacity: self.buffer_size,
            });
        }
        // SAFETY: index is in range, buffer is host-owned, length checked.
        Ok(unsafe { core::slice::from_raw_parts(self.cpu_ptr(index), len) })
    }

    /// Hand a host-owned buffer to the device (Host -> Device).
    pub fn hand_to_device(&mut self, index: usize) -> Result<(), PoolError> {
        self.transition(index, BufferState::Host, BufferState::Device)
    }

    /// Take a buffer back after the device returned it (Device -> Host).
    pub fn reclaim(&mut self, index: usize) -> Result<(), PoolError> {
        self.transition(index, BufferState::Device, BufferState::Host)
    }

    /// Return a host-owned buffer to the free set (Host -> Free).
    pub fn release(&mut self, index: usize) -> Result<(), PoolError> {
        self.transition(index, BufferState::Host, BufferState::Free)?;
        self.claimed -= 1;
        Ok(())
    }

    /// Force every buffer back to `Free`.
    ///
    /// Only valid once the device has been told to stop using the region.
    pub fn release_all(&mut self) {
        for state in self.states[..self.count].iter_mut() {
            *state = BufferState::Free;
        }
        self.claimed = 0;
    }

    /// Device reference of a buffer.
    pub fn device_ref(&self, index: usize) -> Result<DeviceRef, PoolError> {
        self.check_index(index)?;
        Ok(self.device_ref_unchecked(index))
    }

    /// Index of the buffer a device reference points at, if any.
    pub fn index_of(&self, dref: DeviceRef) -> Option<usize> {
        let off = dref.raw().checked_sub(self.device_base.raw())? as usize;
        if off % self.stride != 0 {
            return None;
        }
        let index = off / self.stride;
        (index < self.count).then_some(index)
    }

    /// Ownership state of a buffer.
    pub fn state(&self, index: usize) -> Result<BufferState, PoolError> {
        self.check_index(index)?;
        Ok(self.states[index])
    }

    /// Device reference of the region start.
    pub fn device_base(&self) -> DeviceRef {
        self.device_base
    }

    /// Usable bytes per buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of buffers.
    pub fn capacity(&self) -> usize {
        self.count
    }

    /// Buffers currently claimed (host or device).
    pub fn in_use(&self) -> usize {
        self.claimed
    }

    /// Buffers available to claim.
    pub fn available(&self) -> usize {
        self.count - self.claimed
    }

    fn check_index(&self, index: usize) -> Result<(), PoolError> {
        if index >= self.count {
            return Err(PoolError::InvalidIndex(index));
        }
        Ok(())
    }

    fn expect_state(&self, index: usize, want: BufferState) -> Result<(), PoolError> {
        self.check_index(index)?;
        let state = self.states[index];
        if state != want {
            return Err(PoolError::WrongState { index, state });
        }
        Ok(())
    }

    fn transition(
        &mut self,
        index: usize,
        from: BufferState,
        to: BufferState,
    ) -> Result<(), PoolError> {
        self.expect_state(index, from)?;
        self.states[index] = to;
        Ok(())
    }

    #[inline]
    fn cpu_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: callers check index < count; region covers count strides.
        unsafe { self.base.add(index * self.stride) }
    }

    #[inline]
    fn device_ref_unchecked(&self, index: usize) -> DeviceRef {
        // Fits: checked for the last buffer in `new`.
        DeviceRef(self.device_base.raw() + (index * self.stride) as u32)
    }
}

// SAFETY: the pool exclusively manages its region; access is gated by
// ownership state and `&mut self`.
unsafe impl Send for PayloadPool {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 30;
    const COUNT: usize = 4;

    fn pool(arena: &mut [u8]) -> PayloadPool {
        unsafe {
            PayloadPool::new(arena.as_mut_ptr(), DeviceRef::from_raw(0x1000), SIZE, COUNT)
                .unwrap()
        }
    }

    #[test]
    fn test_align_functions() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(30, 4), 32);
        assert_eq!(arena_len(30, 4), 128);
    }

    #[test]
    fn test_device_refs_are_strided() {
        let mut arena = [0u8; 128];
        let pool = pool(&mut arena);
        assert_eq!(pool.device_ref(0).unwrap().raw(), 0x1000);
        assert_eq!(pool.device_ref(3).unwrap().raw(), 0x1000 + 3 * 32);
        assert_eq!(pool.index_of(DeviceRef::from_raw(0x1040)), Some(2));
        assert_eq!(pool.index_of(DeviceRef::from_raw(0x1041)), None);
        assert_eq!(pool.index_of(DeviceRef::from_raw(0x0fff)), None);
        assert_eq!(pool.index_of(DeviceRef::from_raw(0x1080)), None);
    }

    #[test]
    fn test_rejects_region_beyond_32_bits() {
        let mut arena = [0u8; 128];
        let result = unsafe {
            PayloadPool::new(arena.as_mut_ptr(), DeviceRef::from_raw(u32::MAX - 64), SIZE, COUNT)
        };
        assert_eq!(result.err(), Some(PoolError::DeviceRefOverflow));
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut arena = [0u8; 128];
        let ptr = arena.as_mut_ptr();
        let base = DeviceRef::from_raw(0x1000);
        assert_eq!(
            unsafe { PayloadPool::new(ptr, base, SIZE, 0) }.err(),
            Some(PoolError::InvalidGeometry)
        );
        assert_eq!(
            unsafe { PayloadPool::new(ptr, base, 0, 1) }.err(),
            Some(PoolError::InvalidGeometry)
        );
        assert_eq!(
            unsafe { PayloadPool::new(ptr, base, SIZE, MAX_BUFFERS + 1) }.err(),
            Some(PoolError::InvalidGeometry)
        );
    }

    #[test]
    fn test_full_ownership_cycle() {
        let mut arena = [0u8; 128];
        let mut pool = pool(&mut arena);

        pool.claim(1).unwrap();
        assert_eq!(pool.in_use(), 1);
        pool.write(1, b"hello").unwrap();
        assert_eq!(pool.read(1, 5).unwrap(), b"hello");

        pool.hand_to_device(1).unwrap();
        assert_eq!(
            pool.read(1, 5).err(),
            Some(PoolError::WrongState { index: 1, state: BufferState::Device })
        );

        pool.reclaim(1).unwrap();
        pool.release(1).unwrap();
        assert_eq!(pool.available(), COUNT);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut arena = [0u8; 128];
        let mut pool = pool(&mut arena);

        assert!(pool.release(0).is_err());
        assert!(pool.hand_to_device(0).is_err());
        pool.claim(0).unwrap();
        assert!(pool.claim(0).is_err());
        assert!(pool.reclaim(0).is_err());
        assert_eq!(pool.claim(9).err(), Some(PoolError::InvalidIndex(9)));
    }

    #[test]
    fn test_write_too_large() {
        let mut arena = [0u8; 128];
        let mut pool = pool(&mut arena);
        pool.claim(0).unwrap();
        let big = [0xAAu8; SIZE + 1];
        assert_eq!(
            pool.write(0, &big).err(),
            Some(PoolError::TooLarge { len: SIZE + 1, capacity: SIZE })
        );
    }

    #[test]
    fn test_writes_do_not_bleed_into_neighbours() {
        let mut arena = [0u8; 128];
        let mut pool = pool(&mut arena);
        pool.claim(0).unwrap();
        pool.claim(1).unwrap();
        pool.write(0, &[0x11; SIZE]).unwrap();
        pool.write(1, &[0x22; SIZE]).unwrap();
        assert!(pool.read(0, SIZE).unwrap().iter().all(|&b| b == 0x11));
        assert!(pool.read(1, SIZE).unwrap().iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_release_all() {
        let mut arena = [0u8; 128];
        let mut pool = pool(&mut arena);
        pool.claim(0).unwrap();
        pool.claim(2).unwrap();
        pool.hand_to_device(2).unwrap();
        pool.release_all();
        assert_eq!(pool.available(), COUNT);
        assert_eq!(pool.state(2).unwrap(), BufferState::Free);
    }
}
