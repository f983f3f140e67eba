//! MaskFE: a mask-driven image compositor.
//!
//! A base image is segmented interactively with prompt points; overlay layers
//! are stacked, transformed and optionally clipped to the resulting mask; the
//! composite is exported at source resolution. Model inference sits behind the
//! service traits in [`segmentation::service`], so the engine itself never
//! depends on a particular runtime.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

#[macro_use]
pub mod logger;

pub mod backend;
pub mod cli;
pub mod compositor;
pub mod editor;
pub mod error;
pub mod geometry;
pub mod io;
pub mod layers;
pub mod onnx;
pub mod ops;
pub mod segmentation;
pub mod settings;
pub mod tasks;

pub use editor::{EditMode, Editor, Export, Frame};
pub use error::EngineError;
