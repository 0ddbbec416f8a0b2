//! # schip8
//!
//! A CHIP-8/S-CHIP virtual machine core for hosts that own their main loop.
//!
//! The crate implements the interpreter only: memory, registers, the
//! fetch-decode-execute cycle with its nine legacy-vs-S-CHIP quirk toggles,
//! the packed monochrome framebuffer with the draw/scroll engine, the
//! tri-state keypad, and a scheduler that paces execution, timers, and
//! refresh against a caller-supplied millisecond clock.
//!
//! Everything hardware-facing stays outside: the surrounding loop feeds key
//! events and clock readings in, calls [`Machine::cycle`] once per pass, and
//! samples the framebuffer and the `display_updated`/`beep`/`exit` flags
//! afterwards.

pub use crate::config::{Config, Quirks};
pub use crate::display::{Display, FrameBuffer};
pub use crate::error::{Fault, LoadError};
pub use crate::instruction::Instruction;
pub use crate::keypad::{KeyState, Keypad};
pub use crate::machine::Machine;

mod config;
pub mod constants;
mod display;
mod error;
mod instruction;
mod keypad;
mod machine;
mod opcode;
mod operations;
