//! Wire plumbing shared by both ends of the bridge.
//!
//! # Architecture
//!
//! - **protocol**: frame types for the request and notify paths, tagged device events
//! - **codec**: length-prefixed, LZ4-compressed JSON framing
//! - **transport**: endpoint parsing and the TCP socket pair

pub mod codec;
pub mod protocol;
pub mod transport;
