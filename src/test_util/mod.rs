//! Utilities for testing code that uses peer connections: an in-memory datagram channel with
//!  fault injection and a delivery handler that records callbacks. They are used for testing
//!  the protocol itself, but they are also exported for application testing.

pub mod collecting_handler;
pub mod lossy_link;
