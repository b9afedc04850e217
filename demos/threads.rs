use cofiber::{fiber, thread::Thread, Fiber};

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let threads: Vec<_> = (0..3)
        .map(|i| {
            Thread::spawn(format!("worker-{}", i), move || {
                let main_fiber = Fiber::current();
                let task = Fiber::new(move || {
                    println!(
                        "{}: task fiber {} running",
                        cofiber::thread::current_name(),
                        fiber::current_id()
                    );
                    fiber::yield_to_hold();
                    println!("{}: task fiber done", cofiber::thread::current_name());
                })
                .expect("fiber stack");

                task.resume();
                println!(
                    "{}: main fiber {} sees task in {}",
                    cofiber::thread::current_name(),
                    main_fiber.id(),
                    task.state()
                );
                task.resume();
            })
            .expect("spawn thread")
        })
        .collect();

    for thread in threads {
        let name = thread.name().to_string();
        thread.join().unwrap_or_else(|_| panic!("{} panicked", name));
    }
}
