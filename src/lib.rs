#![deny(warnings, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub(crate) mod api;
pub mod app;
pub mod broker;
pub mod cache;
pub mod config;
pub mod ingestion;
pub mod observability;
pub mod pipeline;
pub mod reader;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod test_support;
pub mod util;
