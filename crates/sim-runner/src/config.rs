use crate::descriptor::{RunPaths, SimulationDescriptor, SimulationParams};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sim_core::cluster::{ClusterOptions, ClusterRegistry};
use sim_core::fsutil::expand_home;
use std::fs;
use std::path::{Path, PathBuf};

fn default_python() -> String {
    "python".to_string()
}

fn default_class() -> String {
    "class".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPaths {
    pub outdir: String,
    /// N-body source tree; overrides `resources.gadget_dir` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gadget_dir: Option<String>,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_class")]
    pub class_binary: String,
    /// Spectrum check script copied next to the submission scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectrum_checker: Option<String>,
}

/// A YAML simulation request:
///
/// ```yaml
/// cluster: bio
/// resources: { nproc: 256, threads: 16 }
/// simulation: { box: 256, npart: 128, m_nu: 0.06 }
/// paths: { outdir: ~/sims/test-0001 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub cluster: String,
    #[serde(default)]
    pub resources: ClusterOptions,
    pub simulation: SimulationParams,
    pub paths: RequestPaths,
}

impl SimulationRequest {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let request: SimulationRequest =
            serde_yaml::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        Ok(request)
    }

    pub fn cluster_options(&self) -> ClusterOptions {
        let mut opts = self.resources.clone();
        if let Some(dir) = &self.paths.gadget_dir {
            opts.gadget_dir = Some(dir.clone());
        }
        opts
    }

    pub fn checker_path(&self) -> Option<PathBuf> {
        self.paths.spectrum_checker.as_deref().map(expand_home)
    }

    /// Builds the cluster profile through the registry and validates the
    /// physical inputs. Nothing is written.
    pub fn descriptor(&self) -> Result<SimulationDescriptor> {
        let cluster = ClusterRegistry::builtin().build(&self.cluster, &self.cluster_options())?;
        let paths = RunPaths {
            outdir: expand_home(&self.paths.outdir),
            python: self.paths.python.clone(),
        };
        Ok(SimulationDescriptor::new(
            self.simulation.clone(),
            paths,
            cluster,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_core::{ClusterKind, SimError};

    const REQUEST: &str = "cluster: clusters.BIOClass
resources:
  nproc: 256
  threads: 16
  gadget_dir: /opt/old-gadget
simulation:
  box: 256
  npart: 128
  hubble: 0.68
paths:
  outdir: /tmp/sims/test-0001
  gadget_dir: /opt/MP-Gadget
";

    #[test]
    fn request_builds_descriptor_with_defaults() {
        let req: SimulationRequest = serde_yaml::from_str(REQUEST).expect("yaml");
        assert_eq!(req.paths.python, "python");
        assert_eq!(req.paths.class_binary, "class");
        let d = req.descriptor().expect("descriptor");
        assert_eq!(d.cluster().kind, ClusterKind::Bio);
        assert_eq!(d.cluster().nproc, 256);
        assert_eq!(d.cluster().gadget_dir, PathBuf::from("/opt/MP-Gadget"));
        assert_eq!(d.params.hubble, 0.68);
        assert_eq!(d.params.omega0, 0.288);
        assert_eq!(d.job_name(), "est-0001");
    }

    #[test]
    fn unknown_cluster_name_is_reported() {
        let mut req: SimulationRequest = serde_yaml::from_str(REQUEST).expect("yaml");
        req.cluster = "summit".to_string();
        let err = req.descriptor().expect_err("unknown");
        assert!(matches!(
            err.downcast_ref::<SimError>(),
            Some(SimError::UnknownCluster(_))
        ));
    }

    #[test]
    fn request_survives_yaml_round_trip() {
        let req: SimulationRequest = serde_yaml::from_str(REQUEST).expect("yaml");
        let text = serde_yaml::to_string(&req).expect("dump");
        let back: SimulationRequest = serde_yaml::from_str(&text).expect("reload");
        assert_eq!(back, req);
    }
}
