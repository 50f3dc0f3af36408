// ABOUTME: Library root for change-relay
// ABOUTME: Exposes the configuration surface and the sync pipeline

pub mod config;
pub mod sync;
