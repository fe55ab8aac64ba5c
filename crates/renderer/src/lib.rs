//! Gapless network renderer: Symphonia decoding, the streaming core, a file
//! transport and the control facade that ties them together.

pub mod cli;
pub mod config;
pub mod renderer;
pub mod runtime;

pub mod decode;
pub mod position;
pub mod sink;
pub mod transport;
