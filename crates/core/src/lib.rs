//! Domain logic shared by the comfyrun crates.
//!
//! Holds the typed ComfyUI workflow document and the parameterization
//! passes applied to it before submission.

pub mod error;
pub mod params;
pub mod workflow;
