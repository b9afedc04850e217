//! Per-thread fiber slots.
//!
//! Each thread tracks the fiber it is running (non-owning) and owns its main fiber. Both slots are
//! thread-local and never observed from another thread, so they need no locking.

use std::cell::RefCell;
use std::ptr;
use std::rc::{Rc, Weak};

use context::Context;

use crate::diag;
use crate::error::FiberError;
use crate::fiber::{Fiber, State};

thread_local! {
    static CURRENT: RefCell<Weak<Fiber>> = const { RefCell::new(Weak::new()) };
    static MAIN: RefCell<Option<Rc<Fiber>>> = const { RefCell::new(None) };
}

pub(crate) fn current_fiber() -> Rc<Fiber> {
    if let Some(cur) = CURRENT.with(|c| c.borrow().upgrade()) {
        return cur;
    }
    let main = MAIN.with(|m| {
        m.borrow_mut()
            .get_or_insert_with(Fiber::new_main)
            .clone()
    });
    set_current_fiber(&main);
    main
}

pub(crate) fn current_id() -> u64 {
    CURRENT
        .try_with(|c| c.borrow().upgrade().map(|f| f.id()))
        .ok()
        .flatten()
        .unwrap_or(0)
}

pub(crate) fn set_current_fiber(fiber: &Fiber) {
    CURRENT.with(|c| *c.borrow_mut() = fiber.downgrade());
}

pub(crate) fn set_current_main() {
    MAIN.with(|m| {
        if let Some(main) = m.borrow().as_ref() {
            set_current_fiber(main);
        }
    });
}

/// Empties the current slot if it refers to `fiber`. Tolerates thread teardown.
pub(crate) fn clear_current_if(fiber: &Fiber) {
    let _ = CURRENT.try_with(|c| {
        let mut c = c.borrow_mut();
        if ptr::eq(c.as_ptr(), fiber) {
            *c = Weak::new();
        }
    });
}

pub(crate) fn set_main_state(state: State) {
    MAIN.with(|m| {
        if let Some(main) = m.borrow().as_ref() {
            main.set_state(state);
        }
    });
}

pub(crate) fn take_main_context() -> Result<Context, FiberError> {
    MAIN.with(|m| match m.borrow().as_ref() {
        Some(main) => main
            .take_context()
            .ok_or(FiberError::MissingContext { id: main.id() }),
        None => Err(FiberError::MissingContext { id: 0 }),
    })
}

pub(crate) fn store_main_context(cx: Context) {
    MAIN.with(|m| match m.borrow().as_ref() {
        Some(main) => main.store_context(cx),
        None => diag::fatal("switched back to a thread without a main fiber"),
    });
}
