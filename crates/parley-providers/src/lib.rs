//! Text-generation backend abstraction.
//!
//! A backend implements [`GenerationBackend`] to turn one prompt into a
//! stream of [`GenerationToken`]s ending in a completion sentinel. The
//! [`connection::GenerationConnection`] wraps one such request per turn with
//! a connection state, timeouts, and cancellation.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use parley_core::types::GenerationToken;

pub mod connection;
pub mod openai;
pub mod sse;

pub use connection::{GenerationConnection, GenerationTimeouts};
pub use openai::OpenAiGenerator;

/// One generation request: a system prompt plus the user's transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub system: Option<String>,
    pub user: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            user: user.into(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        let system = system.into();
        self.system = (!system.is_empty()).then_some(system);
        self
    }
}

/// Stream of generated tokens. The last item is a token with `is_final` set.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<GenerationToken>> + Send>>;

/// A streaming text-generation backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Backend identifier (e.g., "openai").
    fn id(&self) -> &str;

    /// Issue one request and return the token stream once the backend has
    /// accepted it.
    async fn stream(&self, request: &GenerationRequest) -> anyhow::Result<TokenStream>;
}
