use owo_colors::OwoColorize;

pub mod args;
pub mod shutdown;

/// Process-wide startup glue shared by every binary in the workspace:
/// installs a panic hook that exits the process non-zero on any thread
/// panic, so a supervisor restarts the container instead of it limping
/// along with a dead task.
pub fn init() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    println!("{}", "🌱 starting node-termination-handler".green());
}

/// Marks the process as ready. A stand-in for a readiness probe endpoint.
pub fn signal_ready() {
    println!("{}", "✅ ready".green());
}
