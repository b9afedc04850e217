//! Fiber management module
//! A fiber is a stackful coroutine driven by explicit `resume` / `yield` calls on one thread.

use std::rc::Rc;

use crate::{diag, runtime::registry};

pub(crate) mod fiber;

pub use fiber::{Fiber, State, DEFAULT_STACK_SIZE};

/// Id of the fiber running on this thread, or 0 if the thread never touched a fiber.
pub fn current_id() -> u64 {
    registry::current_id()
}

/// Number of fibers alive in the process, main fibers included.
pub fn total_fibers() -> u64 {
    fiber::total_fibers()
}

/// Suspends the running fiber; it stays resumable as `READY`.
pub fn yield_to_ready() {
    yield_current(State::Ready);
}

/// Suspends the running fiber as `HOLD`.
pub fn yield_to_hold() {
    yield_current(State::Hold);
}

fn yield_current(next: State) {
    let cur = registry::current_fiber();
    let raw = Rc::as_ptr(&cur);
    drop(cur);
    // SAFETY: a running task fiber is borrowed by the `resume` that entered it, and the main
    // fiber is owned by the registry, so the pointee outlives this call.
    let fiber = unsafe { &*raw };
    if let Err(e) = fiber.switch_out(next) {
        diag::fatal(e);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::error::FiberError;
    use crate::stack::{
        HeapStackAllocator, ProtectedStackAllocator, StackAllocator, StackBlock, MIN_STACK_SIZE,
    };
    use crate::thread::Thread;

    use super::*;

    const STACK: usize = 256 * 1024;

    #[test]
    fn fresh_fiber_is_init() {
        let fiber = Fiber::with_stack_size(|| {}, STACK).unwrap();
        assert_eq!(fiber.state(), State::Init);
        assert!(!fiber.is_main());
        assert_eq!(fiber.stack().unwrap().size(), STACK);
    }

    #[test]
    fn normal_callback_terminates() {
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let fiber = Fiber::with_stack_size(move || r.set(true), STACK).unwrap();
        fiber.resume();
        assert!(ran.get());
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(Fiber::current().state(), State::Exec);
    }

    #[test]
    fn yield_round_trip() {
        let counter = Rc::new(Cell::new(0));
        let c = counter.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                c.set(c.get() + 1);
                Fiber::current().yield_now();
                c.set(c.get() + 1);
            },
            STACK,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(counter.get(), 1);
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(counter.get(), 2);
        assert_eq!(fiber.state(), State::Term);

        let err = fiber.try_resume().unwrap_err();
        assert!(matches!(err, FiberError::InvalidState { state: State::Term, .. }));
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panic_stays_inside_fiber() {
        let marker = Rc::new(Cell::new(0));
        let m = marker.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                m.set(7);
                panic!("fiber fault");
            },
            STACK,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(marker.get(), 7);
        assert_eq!(fiber.state(), State::Except);
        assert!(fiber.try_resume().is_err());
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn running_fiber_rejects_resume() {
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                let me = Fiber::current();
                *s.borrow_mut() = Some(me.try_resume());
            },
            STACK,
        )
        .unwrap();
        fiber.resume();

        let result = seen.borrow_mut().take().unwrap();
        assert!(matches!(
            result,
            Err(FiberError::InvalidState { op: "resume", state: State::Exec, .. })
        ));
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn nested_resume_is_rejected() {
        let inner = Fiber::with_stack_size(|| {}, STACK).unwrap();
        let outcome = Rc::new(RefCell::new(None));
        let (i, o) = (inner.clone(), outcome.clone());
        let outer = Fiber::with_stack_size(
            move || {
                *o.borrow_mut() = Some(i.try_resume());
            },
            STACK,
        )
        .unwrap();
        outer.resume();

        let result = outcome.borrow_mut().take().unwrap();
        assert!(matches!(result, Err(FiberError::NotOnMainFiber { .. })));
        assert_eq!(inner.state(), State::Init);
        inner.resume();
        assert_eq!(inner.state(), State::Term);
    }

    #[test]
    fn reset_runs_new_callback() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = log.clone();
        let fiber = Fiber::with_stack_size(move || l1.borrow_mut().push("first"), STACK).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let l2 = log.clone();
        fiber.reset(move || l2.borrow_mut().push("second"));
        assert_eq!(fiber.state(), State::Init);
        fiber.resume();

        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_from_init_and_except() {
        let fiber = Fiber::with_stack_size(|| panic!("never runs"), STACK).unwrap();
        fiber.try_reset(|| panic!("fault")).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);

        let ok = Rc::new(Cell::new(false));
        let o = ok.clone();
        fiber.try_reset(move || o.set(true)).unwrap();
        fiber.resume();
        assert!(ok.get());
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_rejects_suspended_fiber() {
        let fiber = Fiber::with_stack_size(yield_to_ready, STACK).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);

        let err = fiber.try_reset(|| {}).unwrap_err();
        assert!(matches!(err, FiberError::InvalidState { op: "reset", .. }));
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_keeps_stack_block() {
        let fiber = Fiber::with_stack_size(|| {}, STACK).unwrap();
        let before = fiber.stack().unwrap();
        fiber.resume();
        fiber.reset(|| {});
        assert_eq!(fiber.stack().unwrap(), before);
        fiber.resume();
        assert_eq!(fiber.stack().unwrap(), before);
    }

    #[test]
    fn main_fiber_cannot_be_reset_or_yielded() {
        let main = Fiber::current();
        assert!(main.is_main());
        assert!(main.stack().is_none());
        assert!(matches!(main.try_reset(|| {}), Err(FiberError::NoStack { .. })));
        assert!(matches!(main.try_yield(), Err(FiberError::MainFiberYield { .. })));
        assert!(matches!(
            main.try_resume(),
            Err(FiberError::InvalidState { state: State::Exec, .. })
        ));
        assert_eq!(main.state(), State::Exec);
    }

    #[test]
    fn suspended_fiber_rejects_yield_from_outside() {
        let fiber = Fiber::with_stack_size(yield_to_ready, STACK).unwrap();
        fiber.resume();
        assert!(matches!(
            fiber.try_yield(),
            Err(FiberError::InvalidState { op: "yield", state: State::Ready, .. })
        ));
        fiber.resume();
    }

    #[test]
    fn running_fiber_cannot_yield_another_fiber() {
        let done = Fiber::with_stack_size(|| {}, STACK).unwrap();
        done.resume();
        assert_eq!(done.state(), State::Term);

        let seen = Rc::new(RefCell::new(None));
        let (d, s) = (done.clone(), seen.clone());
        let runner = Fiber::with_stack_size(
            move || {
                *s.borrow_mut() = Some(d.try_yield());
            },
            STACK,
        )
        .unwrap();
        runner.resume();

        let result = seen.borrow_mut().take().unwrap();
        assert!(matches!(
            result,
            Err(FiberError::NotRunning { id, current }) if id == done.id() && current == runner.id()
        ));
        assert_eq!(runner.state(), State::Term);
        assert_eq!(done.state(), State::Term);
        assert_eq!(Fiber::current().state(), State::Exec);
    }

    #[test]
    fn panic_fits_in_smallest_stack() {
        let fiber =
            Fiber::with_stack_size(|| panic!("fault on a small stack"), MIN_STACK_SIZE).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn guarded_stacks_run_and_are_returned() {
        let protected = Rc::new(ProtectedStackAllocator::new());
        let fiber = Fiber::with_allocator(
            || {
                yield_to_ready();
                panic!("fault on a guarded stack");
            },
            MIN_STACK_SIZE,
            protected.clone(),
        )
        .unwrap();
        assert_eq!(protected.live_stacks(), 1);
        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);
        drop(fiber);
        assert_eq!(protected.live_stacks(), 0);
    }

    #[test]
    fn yield_to_hold_parks_fiber() {
        let fiber = Fiber::with_stack_size(yield_to_hold, STACK).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Hold);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn main_fiber_is_parked_while_task_runs() {
        let main = Fiber::current();
        let main_id = main.id();
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let m = main.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                *s.borrow_mut() = Some((m.state(), current_id()));
            },
            STACK,
        )
        .unwrap();
        let task_id = fiber.id();
        fiber.resume();

        assert_eq!(*seen.borrow(), Some((State::Hold, task_id)));
        assert_eq!(main.state(), State::Exec);
        assert_eq!(current_id(), main_id);
    }

    #[test]
    fn main_fiber_identity_is_stable() {
        let first = Fiber::current();
        let second = Fiber::current();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.id(), second.id());
        assert_eq!(current_id(), first.id());
    }

    #[test]
    fn threads_have_separate_main_fibers() {
        let here = Fiber::current().id();
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = Thread::spawn("fiber-registry", move || {
            assert_eq!(current_id(), 0);
            let a = Fiber::current().id();
            let b = Fiber::current().id();
            tx.send((a, b)).unwrap();
        })
        .unwrap();
        thread.join().unwrap();

        let (a, b) = rx.recv().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, here);
    }

    #[test]
    fn trampoline_releases_its_handle() {
        let payload = Rc::new(());
        let p = payload.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                let _keep = &p;
            },
            STACK,
        )
        .unwrap();
        assert_eq!(Rc::strong_count(&payload), 2);
        fiber.resume();
        assert_eq!(Rc::strong_count(&fiber), 1);
        assert_eq!(Rc::strong_count(&payload), 1);
    }

    #[test]
    fn faulted_fiber_drops_its_callback() {
        let payload = Rc::new(());
        let p = payload.clone();
        let fiber = Fiber::with_stack_size(
            move || {
                let _keep = &p;
                panic!("drop me");
            },
            STACK,
        )
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);
        assert_eq!(Rc::strong_count(&fiber), 1);
        assert_eq!(Rc::strong_count(&payload), 1);
    }

    #[test]
    fn many_fibers_interleave() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let fibers: Vec<_> = (0..3)
            .map(|i| {
                let l = log.clone();
                Fiber::with_stack_size(
                    move || {
                        l.borrow_mut().push((i, 0));
                        yield_to_ready();
                        l.borrow_mut().push((i, 1));
                    },
                    STACK,
                )
                .unwrap()
            })
            .collect();

        while fibers.iter().any(|f| !f.state().is_terminal()) {
            for fiber in &fibers {
                if !fiber.state().is_terminal() {
                    fiber.resume();
                }
            }
        }
        assert_eq!(
            *log.borrow(),
            vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (2, 1)]
        );
    }

    struct CountingAllocator {
        allocs: Cell<usize>,
        deallocs: Cell<usize>,
    }

    impl StackAllocator for CountingAllocator {
        fn alloc(&self, size: usize) -> Result<StackBlock, FiberError> {
            self.allocs.set(self.allocs.get() + 1);
            HeapStackAllocator.alloc(size)
        }

        unsafe fn dealloc(&self, block: StackBlock) {
            self.deallocs.set(self.deallocs.get() + 1);
            unsafe { HeapStackAllocator.dealloc(block) }
        }
    }

    #[test]
    fn custom_allocator_sees_one_alloc_per_fiber() {
        let counting = Rc::new(CountingAllocator {
            allocs: Cell::new(0),
            deallocs: Cell::new(0),
        });
        let fiber = Fiber::with_allocator(|| {}, STACK, counting.clone()).unwrap();
        for _ in 0..3 {
            fiber.resume();
            fiber.reset(|| {});
        }
        assert_eq!(counting.allocs.get(), 1);
        assert_eq!(counting.deallocs.get(), 0);
        drop(fiber);
        assert_eq!(counting.deallocs.get(), 1);
    }

    #[test]
    fn too_small_stack_produces_no_fiber() {
        let err = Fiber::with_stack_size(|| {}, 64).unwrap_err();
        assert!(matches!(err, FiberError::StackTooSmall { size: 64, .. }));
    }

    #[test]
    fn state_names() {
        let names: Vec<_> = [
            State::Init,
            State::Hold,
            State::Exec,
            State::Term,
            State::Ready,
            State::Except,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(names, ["INIT", "HOLD", "EXEC", "TERM", "READY", "EXCEPT"]);
    }
}
