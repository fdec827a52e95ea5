//! Overlay protocol state machine.
//!
//! Each sub-protocol lives in its own manager; [`handler`] composes them and
//! routes transport events between them.

pub mod addrmgr;
pub mod bootmgr;
pub mod event;
pub mod handler;
pub mod handshake;
pub mod output;
pub mod peermgr;
pub mod pingmgr;

use crate::net::LocalDuration;

/// Draw a uniformly random duration from the given inclusive bounds.
pub(crate) fn random_delay(
    rng: &mut fastrand::Rng,
    (min, max): (LocalDuration, LocalDuration),
) -> LocalDuration {
    LocalDuration::from_millis(rng.u64(min.as_millis()..=max.as_millis()))
}
