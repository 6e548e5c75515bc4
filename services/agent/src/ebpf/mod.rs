//! Kernel-side plumbing: interface lookup, object loading and map access

pub mod interface;
pub mod loader;
pub mod maps;
