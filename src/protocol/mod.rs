//! Protocol module for parsing sensor data streams.
//!
//! This module contains the implementation of the ThinkGear packet
//! protocol spoken by the EEG headset family.

pub mod thinkgear;

pub use thinkgear::{DataRow, PacketParser};
