//! Shared leaf utilities for recoup services.
//!
//! Everything in this crate is I/O-free (aside from the OS entropy source)
//! so it can be depended on from anywhere without dragging in the store or
//! HTTP stacks.

pub mod aes;
pub mod env;
pub mod hmac;
pub mod plan;
pub mod rng;
pub mod shutdown;
pub mod task;
pub mod time;
