//! Whole-image pixel operations used by layer tasks. Each takes the current
//! pixels by reference and returns a fresh buffer; nothing is edited in place.

pub mod background;
pub mod tint;
