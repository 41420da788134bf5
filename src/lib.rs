//! Device-side LonTalk/LonWorks control-network protocol stack.
//!
//! C1 [`link`] (MIP link driver) → C2 MIP bridge (the receive loop in
//! [`stack`]) → C3 [`lsip`] (LS/IP address map) → C4 [`socketmap`]
//! (device-socket map) → C5 [`tables`] (device stack tables) → C6
//! [`netmgmt`] (network-management dispatcher) → C7 [`mipapp`] (MIP-app
//! translation).

pub mod error;
pub mod link;
pub mod lsip;
pub mod mipapp;
pub mod netmgmt;
pub mod persist;
pub mod socketmap;
pub mod stack;
pub mod tables;

pub use error::{LtError, NmStatus};
pub use stack::DeviceStack;
