//! Model gateway: the single long-latency external call the harness makes.
//!
//! Retries and rate limiting are the provider's concern; callers get exactly one
//! attempt per [`ModelGateway::generate`].

pub mod error;
pub mod openrouter;
pub mod types;

pub use error::{ErrorContext, ModelError};
pub use openrouter::OpenRouterAdapter;
pub use types::*;

#[async_trait::async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ModelError>;
}
