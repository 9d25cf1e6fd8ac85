//! relaypipe-stages — the stage abstraction, the chain that stacks stages,
//! and the stages themselves: reliable transport, framing, and the
//! interfaces that talk to the outside world.

pub mod chain;
pub mod framing;
pub mod interfaces;
pub mod reliable;
pub mod stage;

#[cfg(test)]
mod testing;

pub use chain::{Chain, MessageStream};
pub use framing::{CobsCodec, FrameCodec, FramingStage};
pub use interfaces::{
    FileInputInterface, FileOutputInterface, LoopbackInterface, SerialInterface, UdpTransceiver,
};
pub use reliable::{ArqStatsSnapshot, ReliableTransport};
pub use stage::{Direction, Fault, Stage, StageCore, StageError, StageEvent};
