//! Provider backends for the pipeline seams.

pub mod http;
pub mod scripted;

pub use http::{HttpProviderConfig, HttpSpeechToText, HttpTextToSpeech, HttpTurnModel};
pub use scripted::{ScriptedSpeechToText, ScriptedTextToSpeech, ScriptedTurnModel};
