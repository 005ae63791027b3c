pub(crate) mod redact;
pub mod shutdown;
