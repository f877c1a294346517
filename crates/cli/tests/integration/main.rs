//! End-to-end tests driving the kiln binary.

mod common;
mod info_tests;
#[cfg(unix)]
mod install_tests;
