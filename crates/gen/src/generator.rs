use async_trait::async_trait;

use crate::artifact::{ArtifactRef, GenError};
use crate::request::GenRequest;

/// The injected generation capability.
///
/// One method, one request, one artifact reference. Implementations may call
/// out to a model provider and take seconds to return; callers are expected
/// to wrap invocations in their own bounded timeout. Cancellation is
/// cooperative: nothing forcibly interrupts an in-flight `execute`.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn execute(&self, request: &GenRequest) -> Result<ArtifactRef, GenError>;
}

#[async_trait]
impl<G: Generator + ?Sized> Generator for std::sync::Arc<G> {
    async fn execute(&self, request: &GenRequest) -> Result<ArtifactRef, GenError> {
        (**self).execute(request).await
    }
}
