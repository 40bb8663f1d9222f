//! Plumbing shared by the care billing crates.

pub mod distributed;
pub mod logging;
