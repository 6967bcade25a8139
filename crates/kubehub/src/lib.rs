//! converge kubehub: kube-rs adapters for every collaborator the engine consumes.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod credentials;
pub mod discovery;
pub mod source;
pub mod status;
pub mod watch;

pub use cluster::KubeCluster;
pub use credentials::KubeCredentials;
pub use discovery::discover_into;
pub use source::ArtifactSource;
pub use status::KubeStatusWriter;
pub use watch::watch_units;
