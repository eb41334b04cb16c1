use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::types::{Container, ContainerEvent};

pub mod docker;
pub use docker::DockerRuntime;

/// What the reconciler needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers currently running.
    async fn running_containers(&self) -> Result<Vec<Container>>;

    /// Current view of one container, `None` if it no longer exists.
    async fn inspect(&self, id: &str) -> Result<Option<Container>>;

    /// Lifecycle events as they happen.  The stream ends or yields an
    /// error when the connection to the runtime drops; calling `events`
    /// again reconnects.
    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>>;
}
