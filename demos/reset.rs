use cofiber::Fiber;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let task = Fiber::with_stack_size(|| println!("first job"), 128 * 1024).expect("fiber stack");
    let block = task.stack().expect("task fibers own a stack");
    task.resume();

    for job in 0..3 {
        task.reset(move || println!("recycled job {}", job));
        task.resume();
        assert_eq!(task.stack(), Some(block));
    }
    println!("stack at {:p} ({} bytes) reused for every job", block.base(), block.size());
}
