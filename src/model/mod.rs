//! Deployment model.
//!
//! Entities shared by every stage of reconciliation: identities, deployment
//! configuration, keyed deployment sets, cluster definitions, the desired
//! state as a whole and the scope filter.

mod deployment;
mod deployments;
mod filter;
mod hash;
mod id;
mod resources;
mod state;

pub use deployment::{
    Deployment, Env, ManifestKind, Metadata, OwnerSet, Startup, Volume, VolumeMode,
};
pub use deployments::Deployments;
pub use filter::ResolveFilter;
pub use hash::RevisionHasher;
pub use id::{DeploymentId, SourceId, SourceLocation};
pub use resources::{
    CPUS, DEFAULT_CPUS, DEFAULT_MEMORY, DEFAULT_PORTS, Flaw, MEMORY, PORTS, Resources,
};
pub use state::{Cluster, ClusterKind, Defs, State};
