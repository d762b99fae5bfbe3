//! Container runtime abstraction
//!
//! The daemon talks to the container host exclusively through the
//! [`ContainerRuntime`] trait so controllers and the orchestrator stay
//! agnostic of the underlying engine. The production implementation
//! wraps the local Docker socket; tests use [`fake::FakeRuntime`].

mod traits;

pub mod docker;
pub mod fake;

pub use docker::DockerRuntime;
pub use traits::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, HealthState,
    MountSpec, PortMap, ResourceLimits, RestartPolicyKind, RuntimeError, RuntimeEvent,
    RuntimeResult,
};
