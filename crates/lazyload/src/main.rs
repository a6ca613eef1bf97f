//! Lazyload.
//!
//! Command line frontend of the lazyload artifact loader. It fetches artifacts through the same
//! memory cache, artifact store and download workers that an embedding host would use, and
//! reports what happened to every URL.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
