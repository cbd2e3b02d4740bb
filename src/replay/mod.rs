//! Playback of recorded ONI files
//!
//! [`Player`] decodes a recording record by record and reports what it
//! finds through [`NodeNotifications`]. [`PlaybackController`] runs a
//! player on its own thread at the recorded pace.

mod controller;
mod event;
mod notifications;
mod player;

pub use controller::{PlaybackController, PlaybackState, SPEED_FASTEST, SPEED_MANUAL};
pub use notifications::{NodeNotifications, NullNotifications};
pub use player::{Player, SeekOrigin};
