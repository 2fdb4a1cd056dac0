//! provisioning integration tests.

mod support;
mod prefill;
mod delivery;

#[cfg(feature = "http")]
mod http;
