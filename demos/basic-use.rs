use std::cell::Cell;
use std::rc::Rc;

use cofiber::{fiber, Fiber};

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let main_fiber = Fiber::current();
    println!("main fiber {} is {}", main_fiber.id(), main_fiber.state());

    let counter = Rc::new(Cell::new(0));
    let c = counter.clone();
    let task = Fiber::new(move || {
        for step in 0..3 {
            c.set(c.get() + 1);
            println!("  fiber {} step {}", fiber::current_id(), step);
            fiber::yield_to_ready();
        }
    })
    .expect("fiber stack");

    while !task.state().is_terminal() {
        task.resume();
        println!("back in main: counter = {}, task is {}", counter.get(), task.state());
    }
    println!("live fibers: {}", fiber::total_fibers());
}
