use lib_gateway::{build_runtime, init, AppConfig, CliArgs};

fn main() {
    let args = CliArgs::parse();

    // The runtime must exist before the async config loader can run.
    let workers = args
        .workers
        .unwrap_or_else(|| AppConfig::peek_worker_threads(&args.config_path));

    let runtime = match build_runtime(workers) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(init(args)) {
        eprintln!("❌ Gateway error: {e}");
        std::process::exit(1);
    }
}
