// The runtime glues raw context switches to fibers: per-thread slots and the entry trampoline.

pub(crate) mod registry;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use context::Transfer;

use crate::fiber::{Fiber, State};
use crate::{diag, thread};

/// Entry point of every task fiber context.
///
/// Saves the main fiber's context handed over by the first switch, runs the callback inside a
/// panic boundary and switches back for good.
pub(crate) extern "C" fn trampoline(from_main: Transfer) -> ! {
    registry::store_main_context(from_main.context);

    let fiber: *const Fiber = {
        let cur = registry::current_fiber();
        run_callback(&cur);
        Rc::as_ptr(&cur)
    };

    // SAFETY: `cur` is gone, so the fiber lives only through its external owner, which is
    // borrowed by the `resume` call that switched in here.
    let fiber = unsafe { &*fiber };
    let id = fiber.id();
    if let Err(e) = fiber.switch_to_main() {
        diag::fatal(e);
    }
    diag::fatal(format!("never reach fiber_id = {id}"))
}

fn run_callback(fiber: &Fiber) {
    let Some(callback) = fiber.take_callback() else {
        diag::fatal(format!("fiber {} entered without a callback", fiber.id()));
    };
    tracing::trace!(target: "cofiber::system", id = fiber.id(), "fiber entered");

    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => fiber.set_state(State::Term),
        Err(payload) => {
            fiber.set_state(State::Except);
            diag::report(&format!(
                "Fiber Except: {}  fiber id = {} thread = {}\n{}",
                panic_message(payload.as_ref()),
                fiber.id(),
                thread::current_name(),
                diag::backtrace_to_string(false, "    "),
            ));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
