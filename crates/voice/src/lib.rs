//! Real-time voice for voxgate
//!
//! The streaming STT → LLM → TTS loop and everything around it:
//! - The single-flight synthesis cache with pinned greetings
//! - The latency-budgeted turn pipeline behind per-provider breakers
//! - The per-call session state machine
//! - Pregeneration workers for bulk synthesis and cache warming
//! - HTTP and scripted provider backends

pub mod cache;
pub mod fingerprint;
pub mod latency;
pub mod pipeline;
pub mod pregen;
pub mod providers;
pub mod quality;
pub mod session;

pub use cache::{CacheOutcome, CachedArtifact, SynthesisCache};
pub use fingerprint::fingerprint;
pub use latency::{LatencyTracker, Stage, StageStats};
pub use pipeline::{PipelineBudgets, TurnPipeline, TurnResult, TurnTimings};
pub use pregen::{PregenConfig, PregenWorkerPool};
pub use quality::{analyze, QualityReport};
pub use session::{
    LiveSession, SessionManagerConfig, TurnReply, VoiceSessionManager,
};
