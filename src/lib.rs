//! Onirec - Recording and playback engine for ONI sensor streams
//!
//! A [`recording::Recorder`] serializes live depth/colour/IR streams into a
//! compact record-oriented file from a single writer thread. A
//! [`replay::Player`] decodes such a file and replays it through
//! [`replay::NodeNotifications`], with frame-accurate seeking, and a
//! [`replay::PlaybackController`] drives a player in real time.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod codec;
pub mod config;
mod cursor;
pub mod error;
pub mod properties;
pub mod recording;
pub mod replay;
pub mod storage;

pub use error::{OniError, Result};
