use cofiber::{Config, Fiber};

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let stack_size = Config::lookup("fiber.stack_size", 1024 * 1024usize, "fiber stack size")
        .expect("valid config name");
    println!("default fiber stack: {} bytes", stack_size.value());

    Config::load_from_toml(
        r#"
        [fiber]
        stack_size = 262144
        "#,
    )
    .expect("valid config");

    let task = Fiber::new(|| println!("running on a configured stack")).expect("fiber stack");
    task.resume();
    println!(
        "fiber {} got a {} byte stack",
        task.id(),
        task.stack().map_or(0, |block| block.size())
    );
}
