//! Recycling storage for task frames.
//!
//! Every spawned task lives in one heap block holding the type-erased
//! future. Completed frames are not returned to the system allocator:
//! their blocks go to a thread-local free list, overflowing into a
//! mutex-guarded global list shared by all threads. Blocks are keyed by
//! their layout, and a block is never handed out for a request larger
//! than the block itself.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::sync::Mutex;
use std::task::{Context, Poll};

/// Blocks kept per thread before spilling into the global list.
const MAX_LOCAL_FRAMES: usize = 64;
/// Blocks kept in the global overflow list before freeing for real.
const MAX_GLOBAL_FRAMES: usize = 256;

struct Block {
    ptr: *mut u8,
    layout: Layout,
}

// The raw pointer is exclusively owned by the block.
unsafe impl Send for Block {}

struct LocalFrames(Vec<Block>);

impl Drop for LocalFrames {
    fn drop(&mut self) {
        for block in self.0.drain(..) {
            unsafe { dealloc(block.ptr, block.layout) };
        }
    }
}

thread_local! {
    static LOCAL: RefCell<LocalFrames> = RefCell::new(LocalFrames(Vec::new()));
}

static GLOBAL: Mutex<Vec<Block>> = Mutex::new(Vec::new());

/// Fetches a block of at least `layout.size()` bytes with at least
/// `layout.align()` alignment, recycling a previous frame when one fits.
/// Returns the block pointer and the block's own layout, which must be
/// passed back to [`release`].
fn acquire(layout: Layout) -> (*mut u8, Layout) {
    let reuse = LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        let pos = local.0.iter().position(|block| {
            block.layout.size() >= layout.size() && block.layout.align() >= layout.align()
        })?;
        let block = local.0.swap_remove(pos);
        Some((block.ptr, block.layout))
    });
    if let Some(found) = reuse {
        return found;
    }

    if let Ok(mut global) = GLOBAL.lock() {
        if let Some(pos) = global.iter().position(|block| {
            block.layout.size() >= layout.size() && block.layout.align() >= layout.align()
        }) {
            let block = global.swap_remove(pos);
            return (block.ptr, block.layout);
        }
    }

    let ptr = unsafe { alloc(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    (ptr, layout)
}

/// Returns a block to the pool.
fn release(ptr: *mut u8, layout: Layout) {
    let spill = LOCAL.with(|local| match local.try_borrow_mut() {
        Ok(mut local) if local.0.len() < MAX_LOCAL_FRAMES => {
            local.0.push(Block { ptr, layout });
            None
        }
        _ => Some(Block { ptr, layout }),
    });
    let Some(block) = spill else { return };

    if let Ok(mut global) = GLOBAL.lock() {
        if global.len() < MAX_GLOBAL_FRAMES {
            global.push(block);
            return;
        }
    }
    unsafe { dealloc(block.ptr, block.layout) };
}

struct FrameVtable {
    poll: unsafe fn(*mut (), &mut Context<'_>) -> Poll<()>,
    drop: unsafe fn(*mut ()),
}

/// A type-erased task frame: one future stored in place in a recycled
/// block.
///
/// The frame never moves its contents after construction, which upholds
/// the pinning contract for the future inside.
pub(crate) struct FrameBox {
    ptr: *mut (),
    block: Layout,
    vtable: &'static FrameVtable,
}

// The frame owns its future exclusively; `F: Send` is enforced at
// construction.
unsafe impl Send for FrameBox {}

impl FrameBox {
    pub(crate) fn new<F>(future: F) -> FrameBox
    where
        F: Future<Output = ()> + Send + 'static,
    {
        unsafe fn poll_frame<F: Future<Output = ()>>(
            ptr: *mut (),
            cx: &mut Context<'_>,
        ) -> Poll<()> {
            Pin::new_unchecked(&mut *(ptr as *mut F)).poll(cx)
        }

        unsafe fn drop_frame<F>(ptr: *mut ()) {
            ptr::drop_in_place(ptr as *mut F);
        }

        let layout = Layout::new::<F>();
        let (ptr, block) = if layout.size() == 0 {
            (layout.align() as *mut u8, layout)
        } else {
            acquire(layout)
        };
        let ptr = ptr as *mut ();
        unsafe { (ptr as *mut F).write(future) };
        FrameBox {
            ptr,
            block,
            vtable: &FrameVtable {
                poll: poll_frame::<F>,
                drop: drop_frame::<F>,
            },
        }
    }

    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        unsafe { (self.vtable.poll)(self.ptr, cx) }
    }
}

impl Drop for FrameBox {
    fn drop(&mut self) {
        unsafe { (self.vtable.drop)(self.ptr) };
        if self.block.size() != 0 {
            release(self.ptr as *mut u8, self.block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop_waker() -> Waker {
        const VTABLE: RawWakerVTable = RawWakerVTable::new(
            |_| RawWaker::new(std::ptr::null(), &VTABLE),
            |_| {},
            |_| {},
            |_| {},
        );
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    #[test]
    fn frame_runs_and_drops_its_future() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let counter = DropCounter(drops.clone());
        let polled = Arc::new(AtomicUsize::new(0));
        let polled2 = polled.clone();
        let mut frame = FrameBox::new(async move {
            let _keep = counter;
            polled2.fetch_add(1, Ordering::SeqCst);
        });

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert_eq!(frame.poll(&mut cx), Poll::Ready(()));
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(frame);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocks_are_recycled_per_thread() {
        // Two same-shaped frames allocated back to back reuse the block.
        let frame = FrameBox::new(async { std::hint::black_box(()) });
        let first = frame.ptr as usize;
        drop(frame);
        let frame = FrameBox::new(async { std::hint::black_box(()) });
        let second = frame.ptr as usize;
        assert_eq!(first, second);
    }
}
