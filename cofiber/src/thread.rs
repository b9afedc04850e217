//! Named OS threads.
//!
//! Every OS thread gets its own fiber registry, so a thread is the unit fibers are bound to. This
//! wrapper gives threads a name that fibers and diagnostics can refer to.

use std::cell::RefCell;
use std::io;
use std::thread::{self as std_thread, JoinHandle, ThreadId};

thread_local! {
    static NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Name of the calling thread: the last name set on it, else its std name, else `UNKNOWN`.
pub fn current_name() -> String {
    NAME.try_with(|n| n.borrow().clone())
        .ok()
        .flatten()
        .or_else(|| std_thread::current().name().map(str::to_string))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

pub fn set_current_name(name: impl Into<String>) {
    let name = name.into();
    NAME.with(|n| *n.borrow_mut() = Some(name));
}

#[derive(Debug)]
pub struct Thread {
    name: String,
    id: ThreadId,
    handle: JoinHandle<()>,
}

impl Thread {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let thread_name = name.clone();
        let handle = std_thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_current_name(thread_name.clone());
                let span = tracing::debug_span!("thread", name = %thread_name);
                let _enter = span.enter();
                f();
            })?;
        let id = handle.thread().id();
        tracing::debug!(target: "cofiber::thread", name = %name, ?id, "thread spawned");

        Ok(Thread {
            name,
            id,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Waits for the thread. Returns the panic payload if its body panicked.
    pub fn join(self) -> std_thread::Result<()> {
        self.handle.join()
    }
}
