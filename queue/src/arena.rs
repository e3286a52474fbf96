//! Fixed arena with a slab cursor and a size-bucketed freelist.
//!
//! A monotonically advancing slab pointer hands out fresh bytes the first
//! time a bucket size is seen; returned events are pushed onto a freelist
//! ordered by ascending bucket size, where chunks of equal size collapse
//! into a sibling chain threaded through the first entry of that size.
//! Alloc and dealloc are constant-time for any size that has been returned
//! before, and the arena never fragments under a fixed-size workload;
//! memory overhead grows only with the number of distinct sizes requested.
//!
//! Everything here runs under `memlock` and never touches the ready queue,
//! so an allocation can proceed concurrently with a queue traversal.

use core::alloc::Layout;
use core::ptr;
use core::ptr::NonNull;

use log::warn;

use crate::event::{
    ALIGN, Backref, EventHeader, EventId, HEADER_SIZE, USER_EVENT_DONE, header_of, payload_of,
};
use crate::queue::EventQueue;
use tickq_lib::Platform;

/// The queue's backing buffer plus the derived id-codec parameters.
pub(crate) struct Arena {
    pub(crate) base: *mut u8,
    pub(crate) size: usize,
    /// Bit length of `size`; the number of low id bits used for the offset.
    pub(crate) npw2: u32,
    /// Layout to release on drop when the buffer is owned.
    pub(crate) owned: Option<Layout>,
}

// SAFETY: the base pointer is either heap memory owned by the queue or a
// caller-provided 'static buffer; all mutation of arena contents is
// serialized by the queue's locks.
unsafe impl Send for Arena {}

impl Arena {
    pub(crate) fn new(base: *mut u8, size: usize, owned: Option<Layout>) -> Self {
        let npw2 = usize::BITS - size.leading_zeros();
        Self {
            base,
            size,
            npw2,
            owned,
        }
    }

    /// Whether `e` points into the arena. Events outside it are
    /// user-allocated and never enter the freelist.
    #[inline]
    pub(crate) fn contains(&self, e: *const EventHeader) -> bool {
        !self.base.is_null()
            && (e as usize) >= (self.base as usize)
            && (e as usize) < (self.base as usize) + self.size
    }

    /// Pack an event's rolling local id with its arena offset.
    ///
    /// # Safety
    /// `e` must point at a live header inside the arena.
    pub(crate) unsafe fn event_id(&self, e: *mut EventHeader) -> EventId {
        let offset = (e as usize - self.base as usize) as u32;
        // SAFETY: per contract.
        EventId((unsafe { (*e).id } as u32) << self.npw2 | offset)
    }

    /// Decode an id back to its candidate header. Returns `None` when the
    /// encoded offset cannot name a header in this arena; the local-id
    /// staleness check is the caller's job, under `queuelock`.
    pub(crate) fn decode(&self, id: EventId) -> Option<*mut EventHeader> {
        let offset = (id.0 & ((1u32 << self.npw2) - 1)) as usize;
        if offset % ALIGN != 0 || offset + HEADER_SIZE > self.size {
            return None;
        }
        // SAFETY: offset is in bounds and aligned, so the sum stays inside
        // the arena allocation.
        Some(unsafe { self.base.add(offset) } as *mut EventHeader)
    }

    /// Whether `id`'s local-id bits match the header's current counter.
    ///
    /// # Safety
    /// `e` must point at a header inside the arena; call under `queuelock`.
    pub(crate) unsafe fn id_matches(&self, e: *mut EventHeader, id: EventId) -> bool {
        // SAFETY: per contract.
        unsafe { (*e).id as u32 == id.0 >> self.npw2 }
    }

    /// Roll the local id forward, invalidating existing copies of the
    /// packed id. Wraps inside the bits above the offset, skipping 0 to
    /// preserve the "nonzero means valid" contract.
    ///
    /// # Safety
    /// `e` must point at a live header inside the arena.
    pub(crate) unsafe fn inc_id(&self, e: *mut EventHeader) {
        // SAFETY: per contract.
        unsafe {
            (*e).id = (*e).id.wrapping_add(1);
            if ((*e).id as u32) << self.npw2 == 0 {
                (*e).id = 1;
            }
        }
    }
}

/// Allocator state behind `memlock`.
pub(crate) struct Slab {
    /// Size-ordered list of free chunks; equal sizes chain via `sibling`.
    pub(crate) chunks: *mut EventHeader,
    /// First never-allocated byte.
    pub(crate) front: *mut u8,
    pub(crate) remaining: usize,
}

// SAFETY: only touched through the queue's `memlock`.
unsafe impl Send for Slab {}

impl Slab {
    pub(crate) fn new(base: *mut u8, size: usize) -> Self {
        Self {
            chunks: ptr::null_mut(),
            front: base,
            remaining: size,
        }
    }
}

impl<P: Platform> EventQueue<P> {
    /// Grab a chunk big enough for `size` payload bytes, reusing a freed
    /// bucket when one fits and carving from the slab front otherwise.
    fn mem_alloc(&self, size: usize) -> *mut EventHeader {
        let size = (size + HEADER_SIZE + ALIGN - 1) & !(ALIGN - 1);

        let mut slab = self.slab.lock();

        // SAFETY: the freelist only links headers inside the arena; list
        // surgery is serialized by `memlock` which we hold.
        unsafe {
            let mut p: *mut *mut EventHeader = &mut slab.chunks;
            while !(*p).is_null() {
                if (**p).size >= size {
                    let e = *p;
                    if !(*e).sibling.is_null() {
                        // Another chunk of this exact size takes our place
                        // in the size-ordered list.
                        *p = (*e).sibling;
                        (**p).next = (*e).next;
                    } else {
                        *p = (*e).next;
                    }
                    return e;
                }
                p = &mut (**p).next;
            }

            if slab.remaining >= size {
                let e = slab.front as *mut EventHeader;
                slab.front = slab.front.add(size);
                slab.remaining -= size;
                (*e).size = size;
                (*e).id = 1;
                return e;
            }
        }

        ptr::null_mut()
    }

    /// Return a chunk to the freelist, collapsing equal sizes into a
    /// sibling chain.
    fn mem_dealloc(&self, e: *mut EventHeader) {
        let mut slab = self.slab.lock();

        // SAFETY: as in `mem_alloc`; `e` was carved from this arena.
        unsafe {
            let mut p: *mut *mut EventHeader = &mut slab.chunks;
            while !(*p).is_null() && (**p).size < (*e).size {
                p = &mut (**p).next;
            }

            if !(*p).is_null() && (**p).size == (*e).size {
                (*e).sibling = *p;
                (*e).next = (**p).next;
            } else {
                (*e).sibling = ptr::null_mut();
                (*e).next = *p;
            }
            *p = e;
        }
    }

    /// Allocate an event with room for `size` payload bytes.
    ///
    /// Returns the payload pointer; the header precedes it. The event
    /// starts as an undelayed one-shot with no destructor. Returns `None`
    /// when no free chunk fits and the slab is exhausted.
    ///
    /// Safe to call from interrupt context.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let e = self.mem_alloc(size);
        if e.is_null() {
            warn!("event alloc of {size} bytes failed: arena exhausted");
            return None;
        }

        // SAFETY: `e` is a freshly detached chunk nothing else references.
        // Every header field is (re)initialized so a misdirected cancel can
        // never observe garbage links.
        unsafe {
            (*e).generation = 0;
            (*e).next = ptr::null_mut();
            (*e).sibling = ptr::null_mut();
            (*e).backref = Backref::None;
            (*e).target = 0;
            (*e).period = -1;
            (*e).dtor = None;
            (*e).cb = None;
            Some(NonNull::new_unchecked(payload_of(e)))
        }
    }

    /// Release an event that was never posted, or that the caller owns.
    ///
    /// Runs the destructor, then returns arena chunks to the freelist or
    /// flags user-allocated events as done.
    ///
    /// # Safety
    /// `payload` must come from [`alloc`](Self::alloc) on this queue (and
    /// not have been posted since), or be the payload of a user-allocated
    /// event this queue has finished with.
    pub unsafe fn dealloc(&self, payload: *mut u8) {
        let e = header_of(payload);

        // SAFETY: per contract the header is live and unreachable from the
        // ready queue, so no lock is needed to read it.
        unsafe {
            if let Some(dtor) = (*e).dtor {
                dtor(payload);
            }

            if self.arena.contains(e) {
                self.mem_dealloc(e);
            } else {
                (*e).id = USER_EVENT_DONE;
                (*e).backref = Backref::None;
            }
        }
    }
}
