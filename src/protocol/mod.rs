//! Wire protocol shared by the daemon and its client driver.
//!
//! - `wire`: byte-level constants, frame classification, and request builders.
//! - `codec`: [`tokio_util::codec`] framing for inbound frames and outbound responses.

pub mod codec;
pub mod wire;
