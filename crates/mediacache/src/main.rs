//! Mediacache.
//!
//! Command line access to the media cache: fetch media through the cache, probe the connection
//! to the media store, and ask the loading advisor how a resource should be loaded.

#![warn(missing_debug_implementations, clippy::all)]

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
