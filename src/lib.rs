//! Capture deriver library.
//!
//! Works through a shared backlog of archived page captures, cutting each
//! full-page screenshot into a thumbnail and fixed-height tiles and recording
//! them in a catalog that viewers serve from.

pub mod config;
pub mod db;
pub mod derivation;
pub mod fs_utils;
