//! Types shared between the `burrow` library and its front ends.

pub mod bootstrap_state;
