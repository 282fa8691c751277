pub mod muxer;
pub mod segments;
pub mod subsystem;

pub use subsystem::ClipSubsystem;
