// ABOUTME: Container runtime integration: the capability trait and its Docker implementation

pub mod container_manager;
pub mod runtime;

pub use container_manager::{ContainerError, ContainerManager};
pub use runtime::{ContainerRuntime, ContainerSpec, ExecOutput, WORKSPACE_MOUNT};

#[cfg(test)]
pub use runtime::MockContainerRuntime;
