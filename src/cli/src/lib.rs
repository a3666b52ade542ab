//! Image Squash CLI - flatten container image layers into one archive.

pub mod commands;
pub mod output;
