pub mod channel;
pub mod protocol;
pub mod sourcemap;
pub mod tracer;
pub mod transport;
