//! QMP (QEMU Machine Protocol) control channel.
//!
//! The runner uses QMP to tell QEMU to quit at the end of a run, and to dump
//! registers or start a gdb server when something goes wrong. It is never
//! used to drive the guest.

mod client;

pub use client::{ChannelState, ControlChannel, ControlPipes, QmpError, Response};
