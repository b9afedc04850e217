use cofiber::fiber;

#[cofiber::main(stack_size = 262144)]
fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let me = cofiber::Fiber::current();
    println!("main body runs in fiber {} on a {} byte stack", me.id(), me.stack().map_or(0, |b| b.size()));
    for i in 0..3 {
        println!("step {}", i);
        fiber::yield_to_ready();
    }
}
