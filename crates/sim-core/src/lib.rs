//! Building blocks for preparing cosmological simulation runs: the error
//! taxonomy, parameter-file format, derived cosmology and the cluster
//! profiles that job scripts are rendered for.

pub mod cluster;
pub mod cosmology;
pub mod error;
pub mod fsutil;
pub mod paramfile;

pub use cluster::{
    ClusterCapabilities, ClusterKind, ClusterOptions, ClusterProfile, ClusterRegistry,
    ConfigStage,
};
pub use cosmology::{DarkEnergy, NuHierarchy};
pub use error::{Result, SimError};
pub use paramfile::{ParamFile, ParamValue};
