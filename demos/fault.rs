use cofiber::{diag, Fiber, State};

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    diag::set_report_hook(|text| eprintln!("[report] {}", text));

    let task = Fiber::new(|| {
        println!("about to fail");
        panic!("something went wrong inside the fiber");
    })
    .expect("fiber stack");

    task.resume();
    assert_eq!(task.state(), State::Except);
    println!("resume returned normally, fiber {} is {}", task.id(), task.state());

    if let Err(e) = task.try_resume() {
        println!("second resume rejected: {}", e);
    }

    task.reset(|| println!("recovered"));
    task.resume();
    println!("fiber {} is {}", task.id(), task.state());
}
