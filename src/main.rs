fn main() {
    let opts = match handle_cli_flags() {
        Some(opts) => opts,
        None => return,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lurker=info")),
        )
        .init();

    if let Err(err) = lurker::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `None` when a flag already handled the invocation.
fn handle_cli_flags() -> Option<lurker::RunOptions> {
    let mut opts = lurker::RunOptions::default();
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lurker {}", lurker::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "lurker — Read a Discourse forum the way a patient human would.\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --once               Run a single read cycle and exit"
                );
                saw_flag = true;
            }
            "--once" => opts.once = true,
            _ => {}
        }
    }
    if saw_flag {
        None
    } else {
        Some(opts)
    }
}
