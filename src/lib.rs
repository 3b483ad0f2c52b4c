//! RGW Standalone Operator: provisions standalone Ceph Object Gateways on Kubernetes
//!
//! Each `ObjectStore` resource becomes a PVC, a Service and a single-replica
//! gateway Deployment. Object stores can federate: an origin site bootstraps a
//! realm and publishes its token in a Secret, a joining site uses that token to
//! create its own zone in the realm.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rgw;
pub mod telemetry;

pub use crate::config::OperatorConfig;
pub use crate::error::{Error, Result};
