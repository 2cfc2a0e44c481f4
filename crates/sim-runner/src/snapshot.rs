//! Reproducibility record of a prepared simulation.
//!
//! The cluster profile is not stored; only its registry name is, so a
//! reloaded descriptor must be given a profile of the same kind.

use crate::descriptor::{DerivedQuantities, Provenance, RunPaths, SimulationDescriptor, SimulationParams};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sim_core::cluster::{ClusterProfile, ClusterRegistry};
use sim_core::fsutil::{atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest};
use sim_core::SimError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SNAPSHOT_SCHEMA: &str = "simulation_ics_v1";
pub const SNAPSHOT_FILE: &str = "SimulationICs.json";
pub const DIGEST_FILE: &str = "SimulationICs.digest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DescriptorRecord {
    params: SimulationParams,
    derived: DerivedQuantities,
    paths: RunPaths,
    provenance: Provenance,
}

impl SimulationDescriptor {
    fn snapshot_value(&self) -> Result<Value> {
        let record = DescriptorRecord {
            params: self.params.clone(),
            derived: self.derived.clone(),
            paths: self.paths.clone(),
            provenance: self.provenance.clone(),
        };
        Ok(serde_json::to_value(record)?)
    }

    /// Stage 5: writes `SimulationICs.json` and its digest.
    pub fn save_snapshot(&self) -> Result<PathBuf> {
        self.prepare_outdir()?;
        let descriptor = self.snapshot_value()?;
        let digest = canonical_json_digest(&descriptor);
        let envelope = json!({
            "schema_version": SNAPSHOT_SCHEMA,
            "created_at": Utc::now().to_rfc3339(),
            "cluster": self.cluster().kind.name(),
            "descriptor": descriptor,
        });
        let path = self.outdir().join(SNAPSHOT_FILE);
        atomic_write_json_pretty(&path, &envelope)
            .with_context(|| format!("write {}", path.display()))?;
        atomic_write_bytes(&self.outdir().join(DIGEST_FILE), digest.as_bytes())?;
        info!(path = %path.display(), digest = %digest, "saved reproducibility snapshot");
        Ok(path)
    }

    /// Restores a descriptor from `outdir`, re-attaching `cluster`.
    pub fn load_snapshot(outdir: &Path, cluster: ClusterProfile) -> Result<Self> {
        let path = outdir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Err(SimError::MissingArtifact(path).into());
        }
        let bytes = fs::read(&path)?;
        let envelope: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        let version = envelope
            .get("schema_version")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if version != SNAPSHOT_SCHEMA {
            return Err(SimError::ConsistencyFailure(format!(
                "unsupported snapshot schema_version: {}",
                version
            ))
            .into());
        }
        let recorded = envelope
            .get("cluster")
            .and_then(Value::as_str)
            .ok_or_else(|| SimError::ConsistencyFailure("snapshot has no cluster".to_string()))?;
        let kind = ClusterRegistry::builtin().lookup(recorded)?;
        if kind != cluster.kind {
            return Err(SimError::ConsistencyFailure(format!(
                "snapshot was prepared for {} but {} was supplied",
                kind, cluster.kind
            ))
            .into());
        }
        let descriptor = envelope
            .get("descriptor")
            .cloned()
            .ok_or_else(|| SimError::ConsistencyFailure("snapshot has no descriptor".to_string()))?;
        let record: DescriptorRecord = serde_json::from_value(descriptor)
            .with_context(|| format!("decode descriptor in {}", path.display()))?;
        Ok(SimulationDescriptor::from_parts(
            record.params,
            record.derived,
            record.paths,
            record.provenance,
            cluster,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{descriptor_in, scratch_dir};
    use sim_core::cluster::{ClusterKind, ClusterOptions};
    use sim_core::NuHierarchy;

    #[test]
    fn snapshot_round_trips_every_field() {
        let root = scratch_dir("snapshot");
        let mut p = SimulationParams::new(300, 256);
        p.m_nu = 0.15;
        p.nu_hierarchy = NuHierarchy::Inverted;
        p.w0_fld = -0.95;
        p.wa_fld = 0.05;
        let mut d = descriptor_in(&root, p);
        d.provenance.solver_version = Some("class@abc".to_string());

        d.save_snapshot().expect("save");
        assert!(root.join(DIGEST_FILE).exists());
        let back = SimulationDescriptor::load_snapshot(&root, d.cluster().clone()).expect("load");
        assert_eq!(back, d);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reload_rejects_other_cluster_kind() {
        let root = scratch_dir("snapshotkind");
        let d = descriptor_in(&root, SimulationParams::new(256, 128));
        d.save_snapshot().expect("save");
        let bio = ClusterProfile::new(ClusterKind::Bio, &ClusterOptions::default()).expect("bio");
        let err = SimulationDescriptor::load_snapshot(&root, bio).expect_err("kind mismatch");
        assert!(matches!(
            err.downcast_ref::<SimError>(),
            Some(SimError::ConsistencyFailure(_))
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reload_rejects_unknown_schema() {
        let root = scratch_dir("snapshotschema");
        let d = descriptor_in(&root, SimulationParams::new(256, 128));
        let path = d.save_snapshot().expect("save");
        let mut v: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        v["schema_version"] = json!("simulation_ics_v0");
        atomic_write_json_pretty(&path, &v).expect("rewrite");
        let err = SimulationDescriptor::load_snapshot(&root, d.cluster().clone()).expect_err("schema");
        assert!(err.to_string().contains("simulation_ics_v0"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn digest_tracks_descriptor_content() {
        let root = scratch_dir("snapshotdigest");
        let mut d = descriptor_in(&root, SimulationParams::new(256, 128));
        d.save_snapshot().expect("save");
        let first = fs::read_to_string(root.join(DIGEST_FILE)).expect("digest");
        d.save_snapshot().expect("save again");
        assert_eq!(first, fs::read_to_string(root.join(DIGEST_FILE)).expect("digest"));
        d.provenance.gadget_git = Some("deadbeef".to_string());
        d.save_snapshot().expect("save changed");
        assert_ne!(first, fs::read_to_string(root.join(DIGEST_FILE)).expect("digest"));
        let _ = fs::remove_dir_all(root);
    }
}
