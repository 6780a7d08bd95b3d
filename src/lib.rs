// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! Continuous reconciliation of declared multi-cluster deployments against a
//! remote scheduler.
//!
//! ## Overview
//!
//! Operators declare which version of each source repository should run on
//! which cluster, with how many instances and which resources. Converge keeps
//! the scheduler in line with that declaration:
//!
//! - Desired state is stored append-only, so every earlier configuration stays
//!   retrievable and removals leave a tombstone
//! - Each reconciliation cycle diffs desired against running deployments
//! - Every difference becomes exactly one scheduler call, serialised per
//!   deployment and parallel across deployments
//! - Failures are isolated per deployment and retried by the next cycle
//!
//! ## Architecture
//!
//! 1. **Desired State**: Read from the [`state`] store
//! 2. **Observed State**: Queried from the scheduler ([`scheduler`])
//! 3. **Diff Engine**: Classifies every deployment ([`planner`])
//! 4. **Rectification**: Turns each diff into scheduler calls ([`rectify`])
//! 5. **Reconciler**: Drives cycles, once or on an interval ([`reconciler`])
//!
//! ## Modules
//!
//! - [`model`]: Deployment identities, configuration and desired state
//! - [`planner`]: Diff computation
//! - [`rectify`]: Rectification state machine and per-deployment queues
//! - [`scheduler`]: Scheduler and artifact registry capabilities
//! - [`state`]: Desired-state storage (`SQLite`, in-memory)
//! - [`reconciler`]: Reconciliation loop
//! - [`config`]: Service configuration and manifest files
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! clusters:
//!   east:
//!     base_url: http://singularity.east.example
//! manifests:
//!   - repo: github.com/acme/web
//!     owners: [web@acme.example]
//!     deployments:
//!       east:
//!         version: 1.4.0
//!         num_instances: 3
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod reconciler;
pub mod rectify;
pub mod scheduler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ManifestFile, ServiceConfig};
pub use error::{ConvergeError, Result};
pub use model::{Deployment, DeploymentId, Deployments, ResolveFilter, State};
pub use planner::{Diff, DiffEngine, DiffKind, DiffResult};
pub use reconciler::{AutoReconciler, AutoReconcilerHandle, CycleReport, Reconciler};
pub use rectify::{QueueSet, Rectification, RectificationOutcome, RectifyContext, Resolution};
pub use scheduler::{Deployer, DockerRegistry, InMemoryRegistry, Registry, SingularityClient};
pub use state::{MemoryStateManager, SqlStateManager, StateManager, User};
