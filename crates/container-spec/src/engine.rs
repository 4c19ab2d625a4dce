use async_trait::async_trait;

use crate::errors::EngineError;
use crate::{Container, File, Service, ServiceHandle};

/// The backend that evaluates container plans.
///
/// Plans are pure values; nothing happens until one is handed to an engine.
/// Implementations decide how steps run (a remote build API, a local runtime,
/// the in-process [`MemoryEngine`](crate::memory::MemoryEngine), ...).
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use container_spec::{Container, Engine, File, Service, ServiceHandle};
/// use container_spec::errors::EngineError;
///
/// struct DryRun;
///
/// #[async_trait]
/// impl Engine for DryRun {
///     async fn sync(&self, container: &Container) -> Result<(), EngineError> {
///         for command in container_spec::render::commands(container) {
///             println!("{}", container_spec::render::shell_line(&command));
///         }
///         Ok(())
///     }
///
///     async fn contents(&self, file: &File) -> Result<Vec<u8>, EngineError> {
///         self.sync(file.container()).await?;
///         Ok(Vec::new())
///     }
///
///     async fn start(&self, service: &Service) -> Result<ServiceHandle, EngineError> {
///         self.sync(service.container()).await?;
///         Ok(ServiceHandle::new("dry-run", service.ports()))
///     }
///
///     async fn stop(&self, _handle: &ServiceHandle) -> Result<(), EngineError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Engine: Send + Sync {
    /// Evaluates every step of `container`.
    async fn sync(&self, container: &Container) -> Result<(), EngineError>;

    /// Evaluates the container that produces `file` and returns the file's bytes.
    async fn contents(&self, file: &File) -> Result<Vec<u8>, EngineError>;

    /// Evaluates the service's container and starts its process. Returns once
    /// the service is up; it keeps running until [`Engine::stop`] is called.
    async fn start(&self, service: &Service) -> Result<ServiceHandle, EngineError>;

    /// Stops a service started by this engine.
    async fn stop(&self, handle: &ServiceHandle) -> Result<(), EngineError>;
}
