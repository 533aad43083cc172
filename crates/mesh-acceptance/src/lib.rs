//! Mesh Acceptance Runner
//!
//! End-to-end acceptance checks for the bookinfo sample application running
//! behind the service mesh. The runner provisions the control plane and the
//! sample app into a fresh namespace, installs traffic rules, and asserts on
//! the HTTP behavior observed through the ingress.
//!
//! # Stages
//!
//! 1. Setup: render templates, create the namespace, deploy, resolve ingress
//! 2. Default route: product page answers 200 (fatal on exhaustion)
//! 3. Version routing: `normal-user` sees v1, `test-user` sees v2
//! 4. Fault injection: delay window checks per identity
//! 5. Fault removal: the injected delay is gone after rule removal
//! 6. Traffic split: weighted split between v1 and v3
//! 7. Teardown (skipped with `-s`)
//!
//! # Prerequisites
//!
//! 1. A cluster reachable through the configured `kubectl`
//! 2. A load balancer that assigns the ingress service an address
//! 3. Template and fixture directories (see [`config::Config`])
//!
//! # Usage
//!
//! ```bash
//! # Full run with generated namespace
//! mesh-acceptance
//!
//! # Keep the environment for debugging
//! mesh-acceptance -s -n mesh-debug
//! ```

pub mod checks;
pub mod cluster;
pub mod config;
pub mod environment;
pub mod errors;
pub mod eventual;
pub mod fixtures;
pub mod probe;
pub mod report;
pub mod rules;
pub mod runner;
