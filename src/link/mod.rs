//! C1: link driver abstraction. See spec.md §4.1.

pub mod driver;
pub mod led;
pub mod sicb;
pub mod stats;
pub mod xcvr;

pub use driver::{LinkDriver, MockLinkDriver, NetworkBufferConfig};
