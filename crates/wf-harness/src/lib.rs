//! Harness for the calls weft makes outside its own process.
//!
//! - Generation provider abstraction ([`provider::LlmProvider`]) with an
//!   OpenAI-compatible chat completions client that supports tool calling
//! - Code sandbox running Python scripts under a timeout
//! - Knowledge search client used for externally-informed retries
//! - Cooperative shutdown coordination tied to OS signals

pub mod knowledge;
pub mod provider;
pub mod sandbox;
pub mod shutdown;
