//! Counter buffer write path and flush protocol.

pub mod buffer;
pub mod codec;
pub mod dimension;
pub mod flush;
pub mod writer;
