use crate::hashing::HashMap;
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Alignment used when nothing in the stream stack asks for more
pub const DEFAULT_MEMORY_ALIGNMENT: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryType {
    ReadWrite,
    // Memory that is cheap to write to but expensive to read back, like write-combined memory
    WriteOnly,
}

#[derive(Debug)]
pub struct RequestMemoryAllocatorResult {
    pub address: Option<NonNull<u8>>,
    pub size: u64,
    pub memory_type: MemoryType,
}

/// Provides the memory that a read request writes into.
///
/// Every successful `allocate` must be matched by exactly one `release`. `lock_allocator` and
/// `unlock_allocator` bracket the lifetime of a request that will call back into the allocator, so
/// an allocator must not be destroyed while its lock count is non-zero. Prefer [`AllocatorLock`]
/// over calling these directly.
pub trait RequestMemoryAllocator: Send + Sync {
    fn lock_allocator(&self);
    fn unlock_allocator(&self);

    /// Allocates at least `minimal_size` bytes. `recommended_size` is the size that satisfies the
    /// alignment needs of the stream stack and should be used if the allocator can.
    fn allocate(
        &self,
        minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> RequestMemoryAllocatorResult;

    fn release(
        &self,
        address: Option<NonNull<u8>>,
    );

    fn num_locks(&self) -> usize;
}

/// Allocator that forwards to a [`GlobalAlloc`], the system allocator by default.
///
/// Allocation and release are internally synchronized since buffers are allocated on the streamer
/// thread but usually released by whoever received the completed read.
pub struct DefaultRequestMemoryAllocator<A = System> {
    allocator: A,
    // Layouts of outstanding allocations by address, the layout is needed again to free
    allocations: Mutex<HashMap<usize, Layout>>,
    lock_counter: AtomicUsize,
}

impl DefaultRequestMemoryAllocator<System> {
    pub fn new() -> Self {
        Self::with_allocator(System)
    }
}

impl Default for DefaultRequestMemoryAllocator<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: GlobalAlloc + Send + Sync> DefaultRequestMemoryAllocator<A> {
    pub fn with_allocator(allocator: A) -> Self {
        DefaultRequestMemoryAllocator {
            allocator,
            allocations: Default::default(),
            lock_counter: AtomicUsize::new(0),
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    fn allocate_aligned(
        &self,
        size: u64,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let size = usize::try_from(size).ok()?;
        let layout = match Layout::from_size_align(size, alignment.max(1)) {
            Ok(layout) => layout,
            Err(e) => {
                log::error!(
                    "Can't allocate {} bytes with alignment {}: {}",
                    size,
                    alignment,
                    e
                );
                return None;
            }
        };

        // Zeroed so a buffer can always be viewed as a byte slice, even before it's read into
        // SAFETY: size is non-zero, the caller handles zero sized requests
        let address = NonNull::new(unsafe { self.allocator.alloc_zeroed(layout) })?;
        self.allocations
            .lock()
            .unwrap()
            .insert(address.as_ptr() as usize, layout);
        Some(address)
    }
}

impl<A: GlobalAlloc + Send + Sync> RequestMemoryAllocator for DefaultRequestMemoryAllocator<A> {
    fn lock_allocator(&self) {
        self.lock_counter.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock_allocator(&self) {
        let previous = self.lock_counter.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Unlocked an allocator that wasn't locked.");
    }

    fn allocate(
        &self,
        _minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> RequestMemoryAllocatorResult {
        let address = if recommended_size > 0 {
            self.allocate_aligned(recommended_size, alignment)
        } else {
            None
        };

        RequestMemoryAllocatorResult {
            address,
            size: recommended_size,
            memory_type: MemoryType::ReadWrite,
        }
    }

    fn release(
        &self,
        address: Option<NonNull<u8>>,
    ) {
        if let Some(address) = address {
            let layout = self
                .allocations
                .lock()
                .unwrap()
                .remove(&(address.as_ptr() as usize));
            let layout =
                layout.expect("Released memory that wasn't allocated by this allocator or was already released.");
            // SAFETY: The address was returned by alloc_zeroed with this layout and is only freed once
            unsafe { self.allocator.dealloc(address.as_ptr(), layout) };
        }
    }

    fn num_locks(&self) -> usize {
        self.lock_counter.load(Ordering::Acquire)
    }
}

impl<A> Drop for DefaultRequestMemoryAllocator<A> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        let locks = *self.lock_counter.get_mut();
        assert_eq!(
            locks, 0,
            "There are still {} file requests using this allocator.",
            locks
        );

        let allocations = self
            .allocations
            .get_mut()
            .map(|allocations| allocations.len())
            .unwrap_or(0);
        debug_assert_eq!(
            allocations, 0,
            "There are still {} allocations from this allocator.",
            allocations
        );
    }
}

/// Keeps an allocator locked for as long as a request may still call into it
pub struct AllocatorLock {
    allocator: Arc<dyn RequestMemoryAllocator>,
}

impl AllocatorLock {
    pub fn new(allocator: Arc<dyn RequestMemoryAllocator>) -> Self {
        allocator.lock_allocator();
        AllocatorLock { allocator }
    }

    pub fn allocator(&self) -> &Arc<dyn RequestMemoryAllocator> {
        &self.allocator
    }
}

impl Drop for AllocatorLock {
    fn drop(&mut self) {
        self.allocator.unlock_allocator();
    }
}

impl std::fmt::Debug for AllocatorLock {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("AllocatorLock")
            .field("num_locks", &self.allocator.num_locks())
            .finish()
    }
}

/// Memory a read request is serviced into. Owns the allocation (and a lock on the allocator it came
/// from) and releases it when dropped.
///
/// The allocation may be larger than the requested data because of size and offset alignment,
/// `data()` returns just the bytes that were asked for.
pub struct RequestBuffer {
    address: Option<NonNull<u8>>,
    allocated_size: usize,
    data_offset: usize,
    data_size: usize,
    memory_type: MemoryType,
    lock: AllocatorLock,
}

// SAFETY: The buffer exclusively owns its allocation, mutable access requires &mut self
unsafe impl Send for RequestBuffer {}
// SAFETY: &self only hands out shared slices
unsafe impl Sync for RequestBuffer {}

impl RequestBuffer {
    /// Returns None if the allocator couldn't provide the memory
    pub fn allocate(
        allocator: Arc<dyn RequestMemoryAllocator>,
        minimal_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> Option<RequestBuffer> {
        let lock = AllocatorLock::new(allocator);
        let result = lock
            .allocator()
            .allocate(minimal_size, recommended_size, alignment);

        if result.size > 0 && result.address.is_none() {
            return None;
        }

        let allocated_size = usize::try_from(result.size).ok()?;
        let buffer = RequestBuffer {
            address: result.address,
            allocated_size,
            data_offset: 0,
            data_size: (minimal_size as usize).min(allocated_size),
            memory_type: result.memory_type,
            lock,
        };
        Some(buffer)
    }

    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Sets which part of the allocation holds the requested data
    pub fn set_data_range(
        &mut self,
        offset: usize,
        size: usize,
    ) {
        assert!(
            offset.checked_add(size).map_or(false, |end| end <= self.allocated_size),
            "Data range {}+{} doesn't fit in a {} byte buffer",
            offset,
            size,
            self.allocated_size
        );
        self.data_offset = offset;
        self.data_size = size;
    }

    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn len(&self) -> usize {
        self.data_size
    }

    pub fn is_empty(&self) -> bool {
        self.data_size == 0
    }

    /// The requested bytes
    pub fn data(&self) -> &[u8] {
        &self.as_slice()[self.data_offset..self.data_offset + self.data_size]
    }

    /// The whole allocation
    pub fn as_slice(&self) -> &[u8] {
        match self.address {
            // SAFETY: The allocation is owned by this buffer, zero-initialized and allocated_size long
            Some(address) => unsafe {
                std::slice::from_raw_parts(address.as_ptr(), self.allocated_size)
            },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.address {
            // SAFETY: As above, and &mut self guarantees exclusive access
            Some(address) => unsafe {
                std::slice::from_raw_parts_mut(address.as_ptr(), self.allocated_size)
            },
            None => &mut [],
        }
    }

    /// Raw view of the whole allocation that can be handed to other threads and split into
    /// disjoint parts for child reads. See [`BufferWindow`] for the rules on using it.
    pub fn window(&mut self) -> BufferWindow {
        BufferWindow {
            address: self.address,
            len: self.allocated_size,
        }
    }
}

impl Drop for RequestBuffer {
    fn drop(&mut self) {
        self.lock.allocator().release(self.address.take());
    }
}

impl std::fmt::Debug for RequestBuffer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RequestBuffer")
            .field("allocated_size", &self.allocated_size)
            .field("data_offset", &self.data_offset)
            .field("data_size", &self.data_size)
            .finish()
    }
}

/// A raw, sendable view into part of a [`RequestBuffer`].
///
/// The owning buffer must stay alive and untouched for as long as the window is written through,
/// and windows handed out at the same time must not overlap. The streamer guarantees this by
/// parking the request that owns the buffer until every read writing into it has completed.
#[derive(Debug)]
pub struct BufferWindow {
    address: Option<NonNull<u8>>,
    len: usize,
}

// SAFETY: A window is the only handle used to write to its range while it exists
unsafe impl Send for BufferWindow {}

impl BufferWindow {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if the start of the window is a multiple of `alignment`
    pub fn is_aligned(
        &self,
        alignment: usize,
    ) -> bool {
        self.address
            .map_or(true, |address| address.as_ptr() as usize % alignment.max(1) == 0)
    }

    /// Splits into [0, mid) and [mid, len)
    pub fn split_at(
        self,
        mid: usize,
    ) -> (BufferWindow, BufferWindow) {
        assert!(mid <= self.len);
        let tail_address = self
            .address
            // SAFETY: mid is within the allocation this window covers
            .map(|address| unsafe { NonNull::new_unchecked(address.as_ptr().add(mid)) });
        (
            BufferWindow {
                address: self.address,
                len: mid,
            },
            BufferWindow {
                address: if mid < self.len { tail_address } else { None },
                len: self.len - mid,
            },
        )
    }

    /// # Safety
    ///
    /// The buffer this window was taken from must still be alive and no other live window or
    /// slice may overlap this one.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.address {
            Some(address) => std::slice::from_raw_parts_mut(address.as_ptr(), self.len),
            None => &mut [],
        }
    }
}

fn align_down(
    value: u64,
    alignment: u64,
) -> u64 {
    let alignment = alignment.max(1);
    value - (value % alignment)
}

fn align_up(
    value: u64,
    alignment: u64,
) -> u64 {
    let alignment = alignment.max(1);
    align_down(value.saturating_add(alignment - 1), alignment)
}

/// What the stream stack would like requests to look like for the best performance
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Recommendations {
    /// How many requests can be processed at the same time before they start queueing up
    pub max_concurrent_requests: u64,
    /// Alignment of the memory reads are done into
    pub memory_alignment: usize,
    /// Reads are best done in multiples of this size, starting at an offset aligned to it
    pub size_alignment: u64,
    /// Reads larger than this are split up into multiple reads
    pub granularity: u64,
}

impl Default for Recommendations {
    fn default() -> Self {
        Recommendations {
            max_concurrent_requests: 1,
            memory_alignment: DEFAULT_MEMORY_ALIGNMENT,
            size_alignment: 1,
            granularity: 1024 * 1024,
        }
    }
}

impl Recommendations {
    /// The smallest multiple of the size alignment that covers the read once its offset has been
    /// aligned down.
    pub fn calculate_recommended_memory_size(
        &self,
        read_size: u64,
        read_offset: u64,
    ) -> u64 {
        let offset_adjustment = read_offset - align_down(read_offset, self.size_alignment);
        align_up(read_size.saturating_add(offset_adjustment), self.size_alignment)
    }

    /// The offset a read should start at to satisfy the size alignment
    pub fn aligned_read_offset(
        &self,
        read_offset: u64,
    ) -> u64 {
        align_down(read_offset, self.size_alignment)
    }

    /// Combines two sets of recommendations so both are satisfied
    pub fn merge(
        &mut self,
        other: &Recommendations,
    ) {
        self.max_concurrent_requests = self.max_concurrent_requests.max(other.max_concurrent_requests);
        self.memory_alignment = self.memory_alignment.max(other.memory_alignment);
        self.size_alignment = self.size_alignment.max(other.size_alignment);
        self.granularity = self.granularity.min(other.granularity);
    }
}
