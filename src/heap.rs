// The block-structured heap engine: boundary-tag codec, sentinel layer,
// segregated free lists, placement, release and heap growth.
//
// The heap is one contiguous region obtained from the sys layer. It starts
// with an allocated prologue divider, ends with an epilogue divider, and
// everything in between is a sequence of 16-byte-granular blocks. A block
// header records its own allocated bit plus the allocated bits of both
// neighbors, so release never scans; free blocks mirror the header in a
// footer and hold their list links in the payload.

use core::cmp;
use core::mem;
use core::ptr;

use static_assertions::{const_assert, const_assert_eq};

use crate::common::{align_up, checked_align_up};
use crate::sys;
use crate::verbose::{SM_CHECKS, VERBOSE_DEL};
use crate::{smassert, smverbose};

/// Block granularity; payload pointers keep this alignment.
pub const ALIGNMENT: usize = 16;
/// Size of one boundary-tag word.
const DIVIDER_SIZE: usize = 8;
/// Header plus two list links plus footer.
const MIN_BLOCK: usize = 32;
/// Upper size limits of the first five size classes; the sixth has none.
const CLASS_LIMITS: [usize; 5] = [32, 48, 64, 96, 2916];
const NUM_CLASSES: usize = 6;
/// Placement accepts the first candidate within this relative margin of
/// the request instead of scanning for the true best fit.
const BEST_FIT_MARGIN: f64 = 0.225;

const PTR_SIZE: usize = mem::size_of::<usize>();

// Divider flag bits; the size occupies the 60 bits above them.
const SIZE_SHIFT: u32 = 4;
const ALLOC_BIT: u64 = 1 << 3;
const PREV_ALLOC_BIT: u64 = 1 << 2;
const NEXT_ALLOC_BIT: u64 = 1 << 1;
const EPILOGUE_BIT: u64 = 1 << 0;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert_eq!(mem::size_of::<Divider>(), DIVIDER_SIZE);
const_assert_eq!(mem::size_of::<FreeBlock>(), 2 * PTR_SIZE);
const_assert_eq!(MIN_BLOCK, 2 * DIVIDER_SIZE + mem::size_of::<FreeBlock>());
const_assert_eq!(NUM_CLASSES, CLASS_LIMITS.len() + 1);
const_assert_eq!(2 * DIVIDER_SIZE, ALIGNMENT);

/// The boundary-tag word used as both block header and footer.
///
/// Bit layout, high to low: 60 bits of block size, then the allocated bit,
/// the previous-neighbor bit, the next-neighbor bit and the epilogue bit.
/// Header and footer of a free block must compare equal as whole words.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Divider(u64);

/// List links living in the payload of a free block. `MIN_BLOCK` exists so
/// that every free block can host the links and a footer.
#[repr(C)]
struct FreeBlock {
    prev: *mut FreeBlock,
    next: *mut FreeBlock,
}

pub struct Heap {
    base: *mut u8,
    /// Bytes handed out by `sbrk` so far; the heap ends at `base + size`.
    size: usize,
    /// Capacity of the backing reservation.
    reserved: usize,
    free_lists: [*mut FreeBlock; NUM_CLASSES],
}

unsafe impl Send for Heap {}

pub const HEAP_INIT: Heap = Heap {
    base: 0 as *mut _,
    size: 0,
    reserved: 0,
    free_lists: [0 as *mut _; NUM_CLASSES],
};

impl Divider {
    fn new(size: usize, alloc: bool, prev_alloc: bool, next_alloc: bool, epilogue: bool) -> Divider {
        let mut word = (size as u64) << SIZE_SHIFT;
        if alloc {
            word |= ALLOC_BIT;
        }
        if prev_alloc {
            word |= PREV_ALLOC_BIT;
        }
        if next_alloc {
            word |= NEXT_ALLOC_BIT;
        }
        if epilogue {
            word |= EPILOGUE_BIT;
        }
        Divider(word)
    }

    fn size(self) -> usize {
        (self.0 >> SIZE_SHIFT) as usize
    }

    fn is_alloc(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    fn prev_alloc(self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    fn next_alloc(self) -> bool {
        self.0 & NEXT_ALLOC_BIT != 0
    }

    fn is_epilogue(self) -> bool {
        self.0 & EPILOGUE_BIT != 0
    }

    /// Footer position; meaningful only while the block is free.
    unsafe fn footer(header: *mut Divider) -> *mut Divider {
        (header as *mut u8).add((*header).size() - DIVIDER_SIZE) as *mut Divider
    }

    unsafe fn next(header: *mut Divider) -> *mut Divider {
        (header as *mut u8).add((*header).size()) as *mut Divider
    }

    /// The divider right below the header. The prologue guarantees one
    /// exists; it is the predecessor's footer only when that block is free.
    unsafe fn prev_footer(header: *mut Divider) -> *mut Divider {
        (header as *mut u8).sub(DIVIDER_SIZE) as *mut Divider
    }

    /// Header of the preceding block; valid only when the predecessor is
    /// free, i.e. carries a footer with its size.
    unsafe fn prev(header: *mut Divider) -> *mut Divider {
        let size = (*Divider::prev_footer(header)).size();
        (header as *mut u8).sub(size) as *mut Divider
    }

    unsafe fn to_mem(header: *mut Divider) -> *mut u8 {
        (header as *mut u8).add(DIVIDER_SIZE)
    }

    unsafe fn from_mem(mem: *mut u8) -> *mut Divider {
        mem.sub(DIVIDER_SIZE) as *mut Divider
    }
}

impl FreeBlock {
    unsafe fn from_header(header: *mut Divider) -> *mut FreeBlock {
        Divider::to_mem(header) as *mut FreeBlock
    }

    unsafe fn to_header(node: *mut FreeBlock) -> *mut Divider {
        (node as *mut u8).sub(DIVIDER_SIZE) as *mut Divider
    }
}

/// Index of the smallest size class whose limit covers `size`.
fn class_for(size: usize) -> usize {
    for (class, limit) in CLASS_LIMITS.iter().enumerate() {
        if size <= *limit {
            return class;
        }
    }
    NUM_CLASSES - 1
}

/// Block size for a payload request: header plus payload, aligned up, at
/// least `MIN_BLOCK`. `None` when the request is too large to represent.
fn request2size(req: usize) -> Option<usize> {
    let size = checked_align_up(req.checked_add(DIVIDER_SIZE)?, ALIGNMENT)?;
    Some(cmp::max(size, MIN_BLOCK))
}

impl Heap {
    /// Reserves the first 16 bytes and writes the prologue and epilogue
    /// sentinels. Idempotent; fails only when the reservation fails.
    pub unsafe fn init(&mut self) -> bool {
        if !self.base.is_null() {
            return true;
        }
        let base = self.sbrk(2 * DIVIDER_SIZE);
        if base.is_null() {
            return false;
        }
        *(base as *mut Divider) = Divider::new(DIVIDER_SIZE, true, true, true, false);
        *(base.add(DIVIDER_SIZE) as *mut Divider) = Divider::new(0, true, true, true, true);
        self.free_lists = [ptr::null_mut(); NUM_CLASSES];
        smverbose!("INIT: heap [{:?}, {:?}]", self.heap_lo(), self.heap_hi());
        true
    }

    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        smverbose!("{}", VERBOSE_DEL);
        smverbose!("MALLOC: size = 0x{:x}", size);
        if size == 0 {
            return ptr::null_mut();
        }
        if self.base.is_null() && !self.init() {
            return ptr::null_mut();
        }
        self.check_malloc_state();

        let block_size = match request2size(size) {
            Some(block_size) => block_size,
            None => return ptr::null_mut(),
        };

        let mut header = self.find_free_space(block_size);
        if header.is_null() {
            header = self.increase_heap(block_size);
            if header.is_null() {
                return ptr::null_mut();
            }
        } else {
            self.remove_from_free_list(header);
        }

        smassert!((*header).is_alloc() && (*header).size() >= block_size);
        self.check_malloc_state();
        let mem = Divider::to_mem(header);
        smassert!(mem as usize % ALIGNMENT == 0);
        smverbose!("MALLOC: result mem {:?}", mem);
        mem
    }

    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        smverbose!("{}", VERBOSE_DEL);
        smverbose!("FREE: mem = {:?}", ptr);
        self.check_malloc_state();

        let header = Divider::from_mem(ptr);
        let next_header = Divider::next(header);
        smassert!((*header).is_alloc());

        // Neighbor state comes from the neighbor headers: the N bit of an
        // allocated block can be stale, since a block without a footer
        // cannot be reached from its successor.
        let d = Divider::new(
            (*header).size(),
            false,
            (*header).prev_alloc(),
            (*next_header).is_alloc(),
            false,
        );
        self.change_alloc(header, d);

        let prev_free = !(*header).prev_alloc();
        let next_free = !(*next_header).is_alloc() && !(*next_header).is_epilogue();

        let merged = if prev_free && next_free {
            let prev_header = Divider::prev(header);
            self.remove_from_free_list(prev_header);
            self.remove_from_free_list(next_header);
            self.coalesce(prev_header, Divider::next(next_header))
        } else if prev_free {
            let prev_header = Divider::prev(header);
            self.remove_from_free_list(prev_header);
            self.coalesce(prev_header, Divider::next(header))
        } else if next_free {
            self.remove_from_free_list(next_header);
            self.coalesce(header, Divider::next(next_header))
        } else {
            header
        };

        self.add_to_free_list(merged);
        self.check_malloc_state();
    }

    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        smverbose!("{}", VERBOSE_DEL);
        smverbose!("REALLOC: mem = {:?}, new size = 0x{:x}", ptr, new_size);
        self.check_malloc_state();

        let header = Divider::from_mem(ptr);
        let old_payload = (*header).size() - DIVIDER_SIZE;
        // Blocks are never shrunk in place.
        if old_payload >= new_size {
            return ptr;
        }

        let new_mem = self.malloc(new_size);
        if new_mem.is_null() {
            return ptr::null_mut();
        }
        let new_payload = (*Divider::from_mem(new_mem)).size() - DIVIDER_SIZE;
        ptr::copy_nonoverlapping(ptr, new_mem, cmp::min(old_payload, new_payload));
        self.free(ptr);
        self.check_malloc_state();
        new_mem
    }

    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        // An overflowing product saturates and then fails as out-of-memory.
        let bytes = nmemb.saturating_mul(size);
        let mem = self.malloc(bytes);
        if !mem.is_null() {
            ptr::write_bytes(mem, 0, bytes);
        }
        mem
    }

    /// Sum of the sizes of allocated blocks, headers included.
    pub unsafe fn allocated_bytes(&self) -> usize {
        if self.base.is_null() {
            return 0;
        }
        let mut size = 0;
        let mut header = self.first_block();
        while !(*header).is_epilogue() {
            if (*header).is_alloc() {
                size += (*header).size();
            }
            header = Divider::next(header);
        }
        size
    }

    // Heap growth

    /// Hands out `incr` more bytes of the contiguous region, or null when
    /// the region cannot grow. The heap state is untouched on failure.
    unsafe fn sbrk(&mut self, incr: usize) -> *mut u8 {
        smassert!(incr % ALIGNMENT == 0);
        if self.base.is_null() {
            let (base, reserved) = sys::alloc(incr);
            if base.is_null() {
                return ptr::null_mut();
            }
            smassert!(base as usize % ALIGNMENT == 0);
            self.base = base;
            self.reserved = reserved;
        }
        let needed = match self.size.checked_add(incr) {
            Some(needed) => needed,
            None => return ptr::null_mut(),
        };
        if needed > self.reserved {
            let wanted = align_up(needed - self.reserved, sys::page_size());
            let granted = sys::extend(self.base.add(self.reserved), wanted);
            if granted == 0 {
                return ptr::null_mut();
            }
            self.reserved += granted;
        }
        let old_brk = self.base.add(self.size);
        self.size += incr;
        old_brk
    }

    /// Grows the heap by exactly `size` bytes. The new block's header lands
    /// on the old epilogue, whose P bit still records the real
    /// predecessor's state, and a fresh epilogue is anchored at the new
    /// end.
    unsafe fn increase_heap(&mut self, size: usize) -> *mut Divider {
        let extended = self.sbrk(size);
        if extended.is_null() {
            return ptr::null_mut();
        }

        let header = Divider::from_mem(extended);
        smassert!((*header).is_epilogue());
        let d = Divider::new(size, true, (*header).prev_alloc(), true, false);
        *header = d;

        let epilogue = Divider::next(header);
        *epilogue = Divider::new(0, true, true, true, true);

        self.change_alloc(header, d);
        smverbose!("EXTEND: block [{:?}, 0x{:x}], epilogue {:?}", header, size, epilogue);
        header
    }

    fn heap_lo(&self) -> *mut u8 {
        self.base
    }

    /// Last byte of the managed region.
    unsafe fn heap_hi(&self) -> *mut u8 {
        self.base.add(self.size - 1)
    }

    unsafe fn in_heap(&self, ptr: *const u8) -> bool {
        ptr >= self.heap_lo() as *const u8 && ptr <= self.heap_hi() as *const u8
    }

    unsafe fn first_block(&self) -> *mut Divider {
        self.base.add(DIVIDER_SIZE) as *mut Divider
    }

    // Free-list index

    unsafe fn add_to_free_list(&mut self, header: *mut Divider) {
        smassert!(!(*header).is_alloc());
        let class = class_for((*header).size());
        let node = FreeBlock::from_header(header);
        (*node).prev = ptr::null_mut();
        (*node).next = self.free_lists[class];
        if !self.free_lists[class].is_null() {
            (*self.free_lists[class]).prev = node;
        }
        self.free_lists[class] = node;
        smverbose!("LIST: insert [{:?}, 0x{:x}] into class {}", header, (*header).size(), class);
    }

    /// Splices a block out of whichever list holds it. The head case walks
    /// the list heads instead of recomputing the class: `split` rewrites
    /// the header size before `malloc` unlinks the placed block.
    unsafe fn remove_from_free_list(&mut self, header: *mut Divider) {
        let node = FreeBlock::from_header(header);
        let prev = (*node).prev;
        let next = (*node).next;

        if !prev.is_null() {
            (*prev).next = next;
        } else {
            let mut found = false;
            for class in 0..NUM_CLASSES {
                if self.free_lists[class] == node {
                    self.free_lists[class] = next;
                    found = true;
                    break;
                }
            }
            smassert!(found);
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
    }

    // Placement

    /// Finds and marks a free block of at least `size` bytes, or returns
    /// null. The caller unlinks the returned block.
    unsafe fn find_free_space(&mut self, size: usize) -> *mut Divider {
        let mut best: *mut FreeBlock = ptr::null_mut();
        let mut best_size = 0usize;

        'classes: for class in class_for(size)..NUM_CLASSES {
            let mut node = self.free_lists[class];
            while !node.is_null() {
                let header = FreeBlock::to_header(node);
                if self.in_heap(node as *const u8)
                    && !(*header).is_alloc()
                    && (*header).size() >= size
                    && (best.is_null() || (*header).size() < best_size)
                {
                    best = node;
                    best_size = (*header).size();
                    // Close enough to the request; stop scanning.
                    if best_size as f64 <= size as f64 * (1.0 + BEST_FIT_MARGIN) {
                        break 'classes;
                    }
                }
                node = (*node).next;
            }
            if !best.is_null() {
                break;
            }
        }

        if best.is_null() {
            return ptr::null_mut();
        }

        let header = FreeBlock::to_header(best);
        smverbose!("MALLOC: use block [{:?}, 0x{:x}]", header, (*header).size());
        if (*header).size() > size + DIVIDER_SIZE + mem::size_of::<FreeBlock>() {
            self.split(header, size);
        } else {
            let d = Divider::new(
                (*header).size(),
                true,
                (*header).prev_alloc(),
                (*header).next_alloc(),
                false,
            );
            self.change_alloc(header, d);
        }
        header
    }

    /// Carves an allocated prefix of `size` bytes out of the free block at
    /// `header`; the rest stays free and joins its class list. Both halves
    /// go through `change_alloc` so every neighbor bit is refreshed.
    unsafe fn split(&mut self, header: *mut Divider, size: usize) -> *mut Divider {
        let old = *header;
        smassert!(!old.is_alloc() && old.size() >= size + MIN_BLOCK);

        let d = Divider::new(size, true, old.prev_alloc(), false, false);
        *header = d;

        let rest = (header as *mut u8).add(size) as *mut Divider;
        let rest_d = Divider::new(old.size() - size, false, true, old.next_alloc(), false);
        *rest = rest_d;
        *Divider::footer(rest) = rest_d;

        self.change_alloc(header, d);
        self.change_alloc(rest, rest_d);

        self.add_to_free_list(rest);
        smverbose!(
            "SPLIT: [{:?}, 0x{:x}] + [{:?}, 0x{:x}]",
            header,
            size,
            rest,
            old.size() - size
        );
        rest
    }

    // Release

    /// Central mutator: writes `d` into `header` (and the footer when the
    /// block is free), then pushes the allocated bit into both neighbors.
    /// The predecessor is reachable only through its footer, so it is
    /// touched only when free; the first real block always carries P=1, so
    /// the prologue is never rewritten.
    unsafe fn change_alloc(&mut self, header: *mut Divider, d: Divider) -> *mut Divider {
        *header = d;
        let footer = Divider::footer(header);
        if !d.is_alloc() {
            *footer = d;
        }

        let next = Divider::next(header);
        *next = Divider::new(
            (*next).size(),
            (*next).is_alloc(),
            d.is_alloc(),
            (*next).next_alloc(),
            (*next).is_epilogue(),
        );
        if !(*next).is_epilogue() && !(*next).is_alloc() {
            *Divider::footer(next) = *next;
        }

        if !d.prev_alloc() {
            let prev_footer = Divider::prev_footer(header);
            let prev_d = Divider::new(
                (*prev_footer).size(),
                (*prev_footer).is_alloc(),
                (*prev_footer).prev_alloc(),
                d.is_alloc(),
                (*prev_footer).is_epilogue(),
            );
            *prev_footer = prev_d;
            *Divider::prev(header) = prev_d;
        }
        footer
    }

    /// Merges the free run `[header, end)` into one block. `end` is the
    /// header of the block following the run; its allocated bit becomes
    /// the merged block's N bit.
    unsafe fn coalesce(&mut self, header: *mut Divider, end: *mut Divider) -> *mut Divider {
        let new_size = end as usize - header as usize;
        smassert!(new_size % ALIGNMENT == 0 && new_size >= MIN_BLOCK);

        let d = Divider::new(new_size, false, (*header).prev_alloc(), (*end).is_alloc(), false);
        *header = d;
        *Divider::footer(header) = d;
        self.change_alloc(header, d);
        smverbose!("COALESCE: [{:?}, 0x{:x}]", header, new_size);
        header
    }

    // Sanity checks

    /// Walks the heap and every free list, verifying the structural
    /// invariants. Returns `false` on the first violation; never repairs.
    pub unsafe fn check_heap(&mut self, line: u32) -> bool {
        if self.base.is_null() {
            return true;
        }
        self.traverse_heap(line) && self.traverse_free_lists(line)
    }

    unsafe fn traverse_heap(&self, line: u32) -> bool {
        let mut header = self.first_block();
        let mut prev_alloc = true;
        let mut prev_free = false;
        while !(*header).is_epilogue() {
            let size = (*header).size();
            if !self.in_heap(header as *const u8)
                || size < MIN_BLOCK
                || size % ALIGNMENT != 0
                || !self.in_heap((header as *const u8).add(size - 1))
            {
                smverbose!("CHECK at {}: bad block [{:?}, 0x{:x}]", line, header, size);
                return false;
            }
            if (*header).prev_alloc() != prev_alloc {
                smverbose!("CHECK at {}: stale P bit at {:?}", line, header);
                return false;
            }
            if !(*header).is_alloc() {
                if prev_free {
                    smverbose!("CHECK at {}: adjacent free blocks at {:?}", line, header);
                    return false;
                }
                if *Divider::footer(header) != *header {
                    smverbose!("CHECK at {}: header/footer mismatch at {:?}", line, header);
                    return false;
                }
                if !(*header).next_alloc() {
                    // A free block's successor can never be free.
                    smverbose!("CHECK at {}: stale N bit at {:?}", line, header);
                    return false;
                }
                if self.list_count(header) != 1 {
                    smverbose!("CHECK at {}: bad list membership for {:?}", line, header);
                    return false;
                }
            }
            prev_free = !(*header).is_alloc();
            prev_alloc = (*header).is_alloc();
            header = Divider::next(header);
        }
        // The epilogue must close the managed region exactly.
        (*header).size() == 0
            && (*header).is_alloc()
            && (header as *mut u8).add(DIVIDER_SIZE) == self.base.add(self.size)
            && (*header).prev_alloc() == prev_alloc
    }

    /// How many times the block sits in the list of its own size class.
    unsafe fn list_count(&self, header: *mut Divider) -> usize {
        let target = FreeBlock::from_header(header);
        let mut count = 0;
        let mut node = self.free_lists[class_for((*header).size())];
        while !node.is_null() {
            if node == target {
                count += 1;
            }
            node = (*node).next;
        }
        count
    }

    unsafe fn traverse_free_lists(&self, line: u32) -> bool {
        for class in 0..NUM_CLASSES {
            let mut node = self.free_lists[class];
            while !node.is_null() {
                let header = FreeBlock::to_header(node);
                if !self.in_heap(node as *const u8) {
                    smverbose!("CHECK at {}: list node {:?} outside the heap", line, node);
                    return false;
                }
                if (*header).is_alloc() {
                    smverbose!("CHECK at {}: allocated block {:?} in class {}", line, header, class);
                    return false;
                }
                if class_for((*header).size()) != class {
                    smverbose!("CHECK at {}: block {:?} in wrong class {}", line, header, class);
                    return false;
                }
                let next = (*node).next;
                if !next.is_null() && (*next).prev != node {
                    smverbose!("CHECK at {}: broken links at {:?}", line, node);
                    return false;
                }
                node = next;
            }
        }
        true
    }

    #[inline(never)]
    unsafe fn check_malloc_state(&mut self) {
        if !SM_CHECKS {
            return;
        }
        smassert!(self.check_heap(line!()));
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                sys::free(self.base, self.reserved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn list_len(heap: &Heap, class: usize) -> usize {
        let mut node = heap.free_lists[class];
        let mut len = 0;
        while !node.is_null() {
            len += 1;
            node = (*node).next;
        }
        len
    }

    unsafe fn free_blocks(heap: &Heap) -> usize {
        let mut total = 0;
        for class in 0..NUM_CLASSES {
            total += list_len(heap, class);
        }
        total
    }

    #[test]
    fn divider_packs_fields() {
        let d = Divider::new(0x120, true, false, true, false);
        assert_eq!(d.size(), 0x120);
        assert!(d.is_alloc());
        assert!(!d.prev_alloc());
        assert!(d.next_alloc());
        assert!(!d.is_epilogue());
        assert_eq!(d, Divider::new(0x120, true, false, true, false));
        assert_ne!(d, Divider::new(0x120, true, false, true, true));
    }

    #[test]
    fn size_is_kept_in_the_high_bits() {
        let d = Divider::new(48, false, true, true, false);
        assert_eq!(d.0, (48 << 4) | 0b0110);
    }

    #[test]
    fn class_limits_are_inclusive() {
        assert_eq!(class_for(32), 0);
        assert_eq!(class_for(33), 1);
        assert_eq!(class_for(48), 1);
        assert_eq!(class_for(64), 2);
        assert_eq!(class_for(96), 3);
        assert_eq!(class_for(97), 4);
        assert_eq!(class_for(2916), 4);
        assert_eq!(class_for(2917), 5);
        assert_eq!(class_for(1 << 20), 5);
    }

    #[test]
    fn request_sizing() {
        assert_eq!(request2size(1), Some(32));
        assert_eq!(request2size(24), Some(32));
        assert_eq!(request2size(25), Some(48));
        assert_eq!(request2size(100), Some(112));
        assert_eq!(request2size(2000), Some(2016));
        assert_eq!(request2size(usize::MAX - 4), None);
    }

    #[test]
    fn small_alloc_lifecycle() {
        let mut heap = HEAP_INIT;
        unsafe {
            let mem = heap.malloc(1);
            assert!(!mem.is_null());
            assert_eq!(mem as usize % ALIGNMENT, 0);
            let header = Divider::from_mem(mem);
            assert_eq!((*header).size(), 32);
            assert_eq!(heap.size, 2 * DIVIDER_SIZE + 32);
            *mem = 9;
            assert_eq!(*mem, 9);
            heap.free(mem);
            assert_eq!(list_len(&heap, 0), 1);
            assert_eq!(free_blocks(&heap), 1);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn split_leaves_the_rest_free() {
        let mut heap = HEAP_INIT;
        unsafe {
            let big = heap.malloc(2000);
            assert_eq!((*Divider::from_mem(big)).size(), 2016);
            heap.free(big);
            assert_eq!(list_len(&heap, 4), 1);

            let small = heap.malloc(16);
            assert_eq!(small, big);
            assert_eq!((*Divider::from_mem(small)).size(), 32);
            let rest = Divider::next(Divider::from_mem(small));
            assert!(!(*rest).is_alloc());
            assert_eq!((*rest).size(), 1984);
            // The remainder keeps living in class 4.
            assert_eq!(list_len(&heap, 4), 1);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn coalesce_both_neighbors() {
        let mut heap = HEAP_INIT;
        unsafe {
            let a = heap.malloc(64);
            let b = heap.malloc(64);
            let c = heap.malloc(64);
            assert_eq!((*Divider::from_mem(a)).size(), 80);
            heap.free(a);
            heap.free(c);
            assert_eq!(free_blocks(&heap), 2);
            heap.free(b);
            assert_eq!(free_blocks(&heap), 1);
            let merged = Divider::from_mem(a);
            assert!(!(*merged).is_alloc());
            assert_eq!((*merged).size(), 240);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn realloc_keeps_the_block_when_payload_fits() {
        let mut heap = HEAP_INIT;
        unsafe {
            let mem = heap.malloc(100);
            assert_eq!((*Divider::from_mem(mem)).size(), 112);
            assert_eq!(heap.realloc(mem, 100), mem);
            assert_eq!(heap.realloc(mem, 104), mem);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn realloc_moves_and_preserves_payload() {
        let mut heap = HEAP_INIT;
        unsafe {
            let mem = heap.malloc(16);
            for i in 0..16 {
                *mem.add(i) = i as u8;
            }
            let moved = heap.realloc(mem, 1000);
            assert!(!moved.is_null());
            assert_ne!(moved, mem);
            for i in 0..16 {
                assert_eq!(*moved.add(i), i as u8);
            }
            // The old block went back to a free list.
            assert_eq!(free_blocks(&heap), 1);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn calloc_zeroes_payload() {
        let mut heap = HEAP_INIT;
        unsafe {
            let mem = heap.calloc(4, 8);
            assert!(!mem.is_null());
            assert_eq!((*Divider::from_mem(mem)).size(), 48);
            for i in 0..32 {
                assert_eq!(*mem.add(i), 0);
            }
            assert_eq!(list_len(&heap, 1), 0);
            heap.free(mem);
            assert_eq!(list_len(&heap, 1), 1);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn calloc_rejects_overflowing_requests() {
        let mut heap = HEAP_INIT;
        unsafe {
            assert!(heap.calloc(usize::MAX, 2).is_null());
            assert!(heap.calloc(0, 8).is_null());
        }
    }

    #[test]
    fn null_and_zero_edge_cases() {
        let mut heap = HEAP_INIT;
        unsafe {
            assert!(heap.malloc(0).is_null());
            heap.free(ptr::null_mut());
            let mem = heap.realloc(ptr::null_mut(), 40);
            assert!(!mem.is_null());
            assert!(heap.realloc(mem, 0).is_null());
            assert_eq!(free_blocks(&heap), 1);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn grown_block_coalesces_with_trailing_free_block() {
        let mut heap = HEAP_INIT;
        unsafe {
            let a = heap.malloc(24);
            let b = heap.malloc(24);
            heap.free(b);
            // The trailing 32-byte block cannot satisfy this request, so
            // the heap grows right behind it.
            let big = heap.malloc(2000);
            assert!(!big.is_null());
            heap.free(big);
            assert_eq!(free_blocks(&heap), 1);
            assert_eq!((*Divider::from_mem(b)).size(), 32 + 2016);
            heap.free(a);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn tight_fit_wins_over_first_fit() {
        let mut heap = HEAP_INIT;
        unsafe {
            let big = heap.malloc(2000);
            let p1 = heap.malloc(24);
            let tight = heap.malloc(120);
            let p2 = heap.malloc(24);
            heap.free(tight);
            // Freed last, the big block heads the class-4 list.
            heap.free(big);
            let mem = heap.malloc(110);
            assert_eq!(mem, tight);
            heap.free(mem);
            heap.free(p1);
            heap.free(p2);
            assert_eq!(free_blocks(&heap), 1);
            assert!(heap.check_heap(line!()));
        }
    }

    #[test]
    fn allocated_bytes_tracks_live_blocks() {
        let mut heap = HEAP_INIT;
        unsafe {
            assert_eq!(heap.allocated_bytes(), 0);
            let a = heap.malloc(24);
            let b = heap.malloc(100);
            assert_eq!(heap.allocated_bytes(), 32 + 112);
            heap.free(a);
            assert_eq!(heap.allocated_bytes(), 112);
            heap.free(b);
            assert_eq!(heap.allocated_bytes(), 0);
        }
    }

    #[test]
    fn failed_growth_leaves_the_heap_usable() {
        let mut heap = HEAP_INIT;
        unsafe {
            let a = heap.malloc(24);
            assert!(!a.is_null());
            let before = heap.size;
            assert!(heap.malloc(1usize << 40).is_null());
            assert_eq!(heap.size, before);
            assert!(heap.check_heap(line!()));
            let b = heap.malloc(24);
            assert!(!b.is_null());
            heap.free(a);
            heap.free(b);
        }
    }

    #[test]
    fn mixed_traffic_keeps_the_invariants() {
        let mut heap = HEAP_INIT;
        unsafe {
            let mut ptrs = [ptr::null_mut(); 64];
            for (i, slot) in ptrs.iter_mut().enumerate() {
                *slot = heap.malloc(8 + i * 24);
                assert!(!slot.is_null());
            }
            assert!(heap.check_heap(line!()));
            for slot in ptrs.iter().step_by(2) {
                heap.free(*slot);
            }
            assert!(heap.check_heap(line!()));
            for (i, slot) in ptrs.iter_mut().enumerate().skip(1).step_by(2) {
                *slot = heap.realloc(*slot, 16 + i * 40);
                assert!(!slot.is_null());
            }
            assert!(heap.check_heap(line!()));
            for slot in ptrs.iter().skip(1).step_by(2) {
                heap.free(*slot);
            }
            assert!(heap.check_heap(line!()));
            assert_eq!(heap.allocated_bytes(), 0);
        }
    }
}
