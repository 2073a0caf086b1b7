//! `duat-worker` -- batch card animation runner.
//!
//! Turns card specifications into generation requests ([`cards`]) and
//! loads the batch manifest the binary runs ([`manifest`]).

pub mod cards;
pub mod manifest;
