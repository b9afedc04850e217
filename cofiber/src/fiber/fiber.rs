//! The fiber handle and its state machine.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use context::Context;

use crate::config::{Config, ConfigVar};
use crate::diag;
use crate::error::FiberError;
use crate::runtime::{registry, trampoline};
use crate::stack::{FiberStack, HeapStackAllocator, StackAllocator, StackBlock};

/// Stack size used when neither the caller nor `fiber.stack_size` says otherwise.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: LazyLock<Option<Arc<ConfigVar<usize>>>> = LazyLock::new(|| {
    match Config::lookup("fiber.stack_size", DEFAULT_STACK_SIZE, "fiber stack size") {
        Ok(var) => Some(var),
        Err(e) => {
            diag::report(&format!("fiber.stack_size unavailable, using {DEFAULT_STACK_SIZE}: {e}"));
            None
        }
    }
});

fn default_stack_size() -> usize {
    STACK_SIZE
        .as_ref()
        .map_or(DEFAULT_STACK_SIZE, |var| var.value())
}

pub(crate) fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed or reset, never run.
    Init,
    /// Suspended, waiting for something outside the fiber.
    Hold,
    /// Running on its thread.
    Exec,
    /// Callback returned.
    Term,
    /// Suspended, may be resumed at any time.
    Ready,
    /// Callback panicked.
    Except,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::Hold => "HOLD",
            State::Exec => "EXEC",
            State::Term => "TERM",
            State::Ready => "READY",
            State::Except => "EXCEPT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Callback = Box<dyn FnOnce() + 'static>;

/// A stackful coroutine.
///
/// Task fibers own a stack and start in [`State::Init`]. Each thread also has one implicit main
/// fiber, created on first use, which runs on the thread's native stack and is the target of
/// every yield. Handles are `Rc`s and never leave the thread that built them.
pub struct Fiber {
    id: u64,
    stack: Option<FiberStack>,
    cx: Cell<Option<Context>>,
    state: Cell<State>,
    callback: Cell<Option<Callback>>,
    this: Weak<Fiber>,
}

impl Fiber {
    /// Creates a fiber with the configured default stack size.
    pub fn new<F>(callback: F) -> Result<Rc<Fiber>, FiberError>
    where
        F: FnOnce() + 'static,
    {
        Self::with_stack_size(callback, 0)
    }

    /// Creates a fiber; a `stack_size` of zero selects `fiber.stack_size`.
    pub fn with_stack_size<F>(callback: F, stack_size: usize) -> Result<Rc<Fiber>, FiberError>
    where
        F: FnOnce() + 'static,
    {
        Self::with_allocator(callback, stack_size, Rc::new(HeapStackAllocator))
    }

    pub fn with_allocator<F>(
        callback: F,
        stack_size: usize,
        allocator: Rc<dyn StackAllocator>,
    ) -> Result<Rc<Fiber>, FiberError>
    where
        F: FnOnce() + 'static,
    {
        let stack_size = if stack_size == 0 {
            default_stack_size()
        } else {
            stack_size
        };
        let stack = FiberStack::new(stack_size, allocator)?;
        let callback: Callback = Box::new(callback);
        // SAFETY: the stack was just allocated and nothing runs on it.
        let cx = unsafe { stack.make_context(trampoline) };

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "cofiber::system", id, stack_size, "fiber created");

        Ok(Rc::new_cyclic(|this| Fiber {
            id,
            stack: Some(stack),
            cx: Cell::new(Some(cx)),
            state: Cell::new(State::Init),
            callback: Cell::new(Some(callback)),
            this: this.clone(),
        }))
    }

    /// The implicit fiber standing for a thread's native stack.
    pub(crate) fn new_main() -> Rc<Fiber> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "cofiber::system", id, "main fiber created");

        Rc::new_cyclic(|this| Fiber {
            id,
            stack: None,
            cx: Cell::new(None),
            state: Cell::new(State::Exec),
            callback: Cell::new(None),
            this: this.clone(),
        })
    }

    /// Returns the fiber running on this thread, bootstrapping the main fiber if needed.
    pub fn current() -> Rc<Fiber> {
        registry::current_fiber()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// The stack block owned by this fiber, `None` for a main fiber.
    pub fn stack(&self) -> Option<StackBlock> {
        self.stack.as_ref().map(FiberStack::block)
    }

    /// Switches from the main fiber into this one until it yields or finishes.
    ///
    /// Aborts the process if the fiber cannot be resumed, see [`Fiber::try_resume`].
    pub fn resume(&self) {
        if let Err(e) = self.try_resume() {
            diag::fatal(e);
        }
    }

    /// Like [`Fiber::resume`], but reports a rejected call instead of aborting.
    ///
    /// Fails when the fiber is running or finished, or when the caller is not the main fiber.
    /// A rejected call leaves every fiber untouched.
    pub fn try_resume(&self) -> Result<(), FiberError> {
        let state = self.state.get();
        // An EXCEPT fiber would re-enter a trampoline that has already finished.
        if matches!(state, State::Exec | State::Term | State::Except) {
            return Err(self.invalid("resume", state));
        }
        let current = registry::current_fiber();
        if !current.is_main() {
            return Err(FiberError::NotOnMainFiber {
                id: self.id,
                current: current.id,
            });
        }
        drop(current);
        let cx = self
            .cx
            .take()
            .ok_or(FiberError::MissingContext { id: self.id })?;

        tracing::trace!(target: "cofiber::system", id = self.id, from = %state, "resume");
        registry::set_current_fiber(self);
        registry::set_main_state(State::Hold);
        self.state.set(State::Exec);

        // SAFETY: `cx` is this fiber's suspension point and is consumed exactly once.
        let from = unsafe { cx.resume(0) };
        self.cx.set(Some(from.context));
        registry::set_main_state(State::Exec);
        Ok(())
    }

    /// Suspends this fiber and switches back to the main fiber.
    ///
    /// Aborts the process if called on anything but the running task fiber.
    pub fn yield_now(&self) {
        if let Err(e) = self.try_yield() {
            diag::fatal(e);
        }
    }

    pub fn try_yield(&self) -> Result<(), FiberError> {
        self.switch_out(State::Ready)
    }

    /// Yields with `next` as the post-suspend state. A finished fiber keeps its state.
    pub(crate) fn switch_out(&self, next: State) -> Result<(), FiberError> {
        let state = self.state.get();
        if !matches!(state, State::Exec | State::Term) {
            return Err(self.invalid("yield", state));
        }
        if self.is_main() {
            return Err(FiberError::MainFiberYield { id: self.id });
        }
        let current = registry::current_id();
        if current != self.id {
            return Err(FiberError::NotRunning {
                id: self.id,
                current,
            });
        }
        tracing::trace!(target: "cofiber::system", id = self.id, to = %next, "yield");
        if state != State::Term {
            self.state.set(next);
        }
        self.switch_to_main()
    }

    /// Raw switch back to the main fiber, without state checks.
    pub(crate) fn switch_to_main(&self) -> Result<(), FiberError> {
        let main_cx = registry::take_main_context()?;
        registry::set_current_main();
        // SAFETY: the main context was saved by the switch that entered this fiber.
        let from = unsafe { main_cx.resume(0) };
        registry::store_main_context(from.context);
        Ok(())
    }

    /// Rebinds a finished or never-run fiber to a new callback on the same stack.
    ///
    /// Aborts the process if the fiber is live or owns no stack, see [`Fiber::try_reset`].
    pub fn reset<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        if let Err(e) = self.try_reset(callback) {
            diag::fatal(e);
        }
    }

    pub fn try_reset<F>(&self, callback: F) -> Result<(), FiberError>
    where
        F: FnOnce() + 'static,
    {
        let stack = self
            .stack
            .as_ref()
            .ok_or(FiberError::NoStack { id: self.id })?;
        let state = self.state.get();
        if !matches!(state, State::Init | State::Term | State::Except) {
            return Err(self.invalid("reset", state));
        }

        // SAFETY: the fiber is not suspended mid-callback, so no live frame remains on the stack.
        let cx = unsafe { stack.make_context(trampoline) };
        let callback: Callback = Box::new(callback);
        self.cx.set(Some(cx));
        self.callback.set(Some(callback));
        self.state.set(State::Init);
        tracing::debug!(target: "cofiber::system", id = self.id, from = %state, "fiber reset");
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> Weak<Fiber> {
        self.this.clone()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state);
    }

    pub(crate) fn take_callback(&self) -> Option<Callback> {
        self.callback.take()
    }

    pub(crate) fn take_context(&self) -> Option<Context> {
        self.cx.take()
    }

    pub(crate) fn store_context(&self, cx: Context) {
        self.cx.set(Some(cx));
    }

    fn invalid(&self, op: &'static str, state: State) -> FiberError {
        FiberError::InvalidState {
            op,
            id: self.id,
            state,
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state.get();

        match self.stack.take() {
            Some(stack) => {
                if state == State::Exec {
                    diag::fatal(format!("dropping fiber {} while it is {state}", self.id));
                }
                drop(stack);
                tracing::debug!(target: "cofiber::system", id = self.id, %state, "fiber destroyed");
            }
            None => {
                if self.callback.take().is_some() {
                    diag::fatal(format!("main fiber {} holds a callback", self.id));
                }
                if !matches!(state, State::Exec | State::Ready | State::Hold) {
                    diag::fatal(format!("dropping main fiber {} while it is {state}", self.id));
                }
                registry::clear_current_if(self);
                tracing::debug!(target: "cofiber::system", id = self.id, "main fiber destroyed");
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("stack", &self.stack)
            .finish()
    }
}
