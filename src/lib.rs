#![deny(rust_2018_compatibility)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod buffer;
pub mod config;
pub mod error;
pub mod input;
pub mod protocol;
pub mod receiver;
pub mod sink;
pub mod submitter;
pub mod tls;

pub use crate::error::Error;

use failure::Fail;
use log::error;

/// Logs every `Fail` in the chain of a failed future, matching the
/// teacher crate's `print_error` helper (`countermeasures/src/lib.rs`).
pub async fn print_error<F, T, E>(future: F)
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Fail,
{
    use std::fmt::Write;

    if let Err(err) = future.await {
        let mut msg = String::new();
        for fail in Fail::iter_chain(&err) {
            let _ = writeln!(&mut msg, "{}", fail);
        }
        if let Some(backtrace) = err.backtrace() {
            let _ = writeln!(&mut msg, "{}", backtrace);
        }
        error!("{}", msg);
    }
}
