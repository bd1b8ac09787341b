//! Zoom-aware GeoJSON serving for large vector map layers.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod geometry;
pub mod infra;
pub mod source;
