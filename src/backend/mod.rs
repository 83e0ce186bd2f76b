//! Concrete resource backends

pub mod k8s;

pub use k8s::{KubeClaimProvider, KubePodProvider, ProjectNamespace, unique_name};
