//! End-to-end playback sessions: a store, a loader and a scripted history
//! source wired together the way an application does.

#[path = "../common/mod.rs"]
mod common;

mod config_file;
mod live_values;
mod scenario;
