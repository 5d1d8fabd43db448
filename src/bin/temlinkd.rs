//! temlink daemon - microscope bridge onto a message bus
//!
//! Usage: temlinkd [start [-d] [--config FILE] | stop | status]

fn main() -> anyhow::Result<()> {
    temlinkd::cli::run()
}
