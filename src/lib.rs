//! vocu-tts library
//!
//! Cached, deduplicated text-to-speech on top of the Vocu API: request
//! fingerprinting, an on-disk artifact store, a retrying job coordinator,
//! and the voice catalogue and history commands built on the same client.

pub mod cli;
pub mod config;
pub mod logging;
pub mod synthesis;
pub mod vocu;
pub mod voices;
