//! Low-level cross-thread signalling.

mod gate;

pub use gate::Gate;
