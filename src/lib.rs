//! modcore - mod package core for Android games
//!
//! Reads mod archives (ZIP, 7z, RAR) with passwords and legacy filename
//! encodings, decides how a game directory can be written, and places mod
//! files there through the matching file backend.

pub mod archive;
pub mod config;
pub mod fileops;
pub mod hash;
pub mod injection;
pub mod installer;
pub mod logging;
pub mod paths;
pub mod permission;
