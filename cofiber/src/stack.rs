//! Fiber stack memory.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};

use crate::error::FiberError;

/// Smallest stack a fiber may be created with.
///
/// A callback that panics needs room for unwinding and the fault report on its own stack.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

const STACK_ALIGN: usize = 16;

pub(crate) type EntryFn = extern "C" fn(Transfer) -> !;

/// A raw block of memory handed out by a [`StackAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBlock {
    base: NonNull<u8>,
    size: usize,
}

impl StackBlock {
    /// # Safety
    /// `base` must point to `size` writable bytes that stay valid until the block is deallocated.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    /// Lowest address of the block.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Allocation strategy for fiber stacks.
///
/// The allocator neither zeroes memory nor tracks lifetimes; the owning fiber releases the block
/// exactly once through [`StackAllocator::dealloc`].
pub trait StackAllocator {
    fn alloc(&self, size: usize) -> Result<StackBlock, FiberError>;

    /// # Safety
    /// `block` must come from `alloc` on this allocator and must not be in use by any context.
    unsafe fn dealloc(&self, block: StackBlock);
}

/// Default strategy backed by the global heap allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStackAllocator;

impl StackAllocator for HeapStackAllocator {
    fn alloc(&self, size: usize) -> Result<StackBlock, FiberError> {
        if size == 0 {
            return Err(FiberError::StackAlloc { size });
        }
        let layout =
            Layout::from_size_align(size, STACK_ALIGN).map_err(|_| FiberError::StackAlloc { size })?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or(FiberError::StackAlloc { size })?;
        Ok(StackBlock { base, size })
    }

    unsafe fn dealloc(&self, block: StackBlock) {
        // SAFETY: the layout was accepted by `alloc` with the same size and alignment.
        unsafe {
            let layout = Layout::from_size_align_unchecked(block.size, STACK_ALIGN);
            alloc::dealloc(block.base.as_ptr(), layout);
        }
    }
}

/// Strategy that places an inaccessible guard page below every stack.
///
/// Running off the end of the stack faults on the guard page instead of writing into
/// neighbouring memory. Sizes are rounded up to whole pages.
#[derive(Default)]
pub struct ProtectedStackAllocator {
    live: RefCell<HashMap<usize, ProtectedFixedSizeStack>>,
}

impl ProtectedStackAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stacks handed out and not yet returned.
    pub fn live_stacks(&self) -> usize {
        self.live.borrow().len()
    }
}

impl StackAllocator for ProtectedStackAllocator {
    fn alloc(&self, size: usize) -> Result<StackBlock, FiberError> {
        let stack = ProtectedFixedSizeStack::new(size).map_err(|e| {
            tracing::debug!(target: "cofiber::system", size, error = %e, "guarded stack allocation failed");
            FiberError::StackAlloc { size }
        })?;
        let base = NonNull::new(stack.bottom().cast::<u8>()).ok_or(FiberError::StackAlloc { size })?;
        let block = StackBlock {
            base,
            size: stack.len(),
        };
        self.live.borrow_mut().insert(base.as_ptr() as usize, stack);
        Ok(block)
    }

    unsafe fn dealloc(&self, block: StackBlock) {
        // Dropping the mapping releases the stack and its guard page.
        self.live.borrow_mut().remove(&(block.base.as_ptr() as usize));
    }
}

impl fmt::Debug for ProtectedStackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedStackAllocator")
            .field("live", &self.live_stacks())
            .finish()
    }
}

/// A stack block paired with the allocator it must return to.
pub(crate) struct FiberStack {
    block: StackBlock,
    allocator: Rc<dyn StackAllocator>,
}

impl FiberStack {
    pub(crate) fn new(size: usize, allocator: Rc<dyn StackAllocator>) -> Result<Self, FiberError> {
        if size < MIN_STACK_SIZE {
            return Err(FiberError::StackTooSmall {
                size,
                min: MIN_STACK_SIZE,
            });
        }
        let block = allocator.alloc(size)?;
        Ok(Self { block, allocator })
    }

    pub(crate) fn block(&self) -> StackBlock {
        self.block
    }

    /// Builds a fresh execution context at the top of this stack.
    ///
    /// # Safety
    /// No live context may be running on this stack.
    pub(crate) unsafe fn make_context(&self, entry: EntryFn) -> Context {
        let bottom = self.block.base.as_ptr();
        // SAFETY: the block spans `size` bytes starting at `bottom`.
        unsafe {
            let top = bottom.add(self.block.size);
            let stack = context::stack::Stack::new(top.cast(), bottom.cast());
            Context::new(&stack, entry)
        }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // SAFETY: the owning fiber guarantees nothing executes on this stack anymore.
        unsafe { self.allocator.dealloc(self.block) }
    }
}

impl fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberStack")
            .field("base", &self.block.base)
            .field("size", &self.block.size)
            .finish()
    }
}
