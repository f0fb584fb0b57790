pub mod service;
pub mod wire;

pub use service::{build_aggregator, AnalysisService, SourcePaths};
pub use wire::{Ack, AnalysisRequestDto, Command, ErrorEnvelope, Reply};
