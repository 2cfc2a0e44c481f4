use crate::descriptor::{SimulationDescriptor, CHECKER_SCRIPT};
use anyhow::{Context, Result};
use sim_core::fsutil::atomic_write_bytes;
use sim_core::SimError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUBMIT_ONE: &str = "mpi_submit_one";
pub const SUBMIT_GENIC: &str = "mpi_submit_genic";
pub const SUBMIT_NBODY: &str = "mpi_submit";

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitScripts {
    /// IC generation, N-body run and spectrum check in one job.
    pub one: PathBuf,
    pub genic: PathBuf,
    pub nbody: PathBuf,
}

pub(crate) fn write_script(path: &Path, body: &str) -> Result<()> {
    atomic_write_bytes(path, body.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

impl SimulationDescriptor {
    /// Stage 4: renders the submission scripts. Both generated configs must
    /// exist. When `checker` is given it is copied next to the scripts.
    pub fn submission_artifacts(&self, checker: Option<&Path>) -> Result<SubmitScripts> {
        for required in [self.genic_param_path(), self.gadget_param_path()] {
            if !required.exists() {
                return Err(SimError::MissingArtifact(required).into());
            }
        }
        let job = self.job_name();
        let check = self.spectrum_check_command();
        let cluster = self.cluster();
        let outdir = self.outdir();

        let scripts = SubmitScripts {
            one: outdir.join(SUBMIT_ONE),
            genic: outdir.join(SUBMIT_GENIC),
            nbody: outdir.join(SUBMIT_NBODY),
        };
        write_script(&scripts.one, &cluster.submit_one(&job, Some(&check)))?;
        write_script(
            &scripts.genic,
            &cluster.submit_genic(&self.run_name(), Some(&check)),
        )?;
        write_script(&scripts.nbody, &cluster.submit_nbody(&job))?;

        if let Some(src) = checker {
            if !src.exists() {
                return Err(SimError::MissingArtifact(src.to_path_buf()).into());
            }
            let dest = outdir.join(CHECKER_SCRIPT);
            fs::copy(src, &dest)
                .with_context(|| format!("copy {} -> {}", src.display(), dest.display()))?;
        }
        info!(
            cluster = cluster.cluster_name(),
            job = %job,
            "wrote submission scripts"
        );
        Ok(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{descriptor_in, scratch_dir};
    use crate::descriptor::{RunPaths, SimulationParams};
    use sim_core::cluster::{ClusterKind, ClusterOptions, ClusterProfile};

    #[test]
    fn scripts_require_both_configs() {
        let root = scratch_dir("submitmissing");
        let d = descriptor_in(&root, SimulationParams::new(256, 128));
        let err = d.submission_artifacts(None).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<SimError>(),
            Some(SimError::MissingArtifact(_))
        ));
        assert!(!root.join(SUBMIT_ONE).exists());
    }

    #[test]
    fn scripts_are_written_and_deterministic() {
        let root = scratch_dir("submit-run-0001");
        let d = descriptor_in(&root, SimulationParams::new(256, 128));
        fs::create_dir_all(&root).expect("outdir");
        fs::write(d.genic_param_path(), "Seed = 1\n").expect("genic");
        fs::write(d.gadget_param_path(), "TimeMax = 1.0\n").expect("gadget");
        let checker = root.join("checker-src.py");
        fs::write(&checker, "print('ok')\n").expect("checker");

        let first = d.submission_artifacts(Some(&checker)).expect("scripts");
        let one = fs::read_to_string(&first.one).expect("one");
        d.submission_artifacts(Some(&checker)).expect("again");
        assert_eq!(one, fs::read_to_string(&first.one).expect("one again"));

        assert!(one.starts_with("#!/bin/bash\n#PBS -j eo\n"));
        assert!(one.contains("mpirun -np 256 /opt/MP-Gadget/genic/MP-GenIC _genic_params.ini\n"));
        assert!(one.contains("python3 cambpower.py ICS/256_128_99 --czstr 99 --mnu 0\n"));
        let genic = fs::read_to_string(&first.genic).expect("genic");
        assert!(genic.contains("walltime=0:30:00"));
        let nbody = fs::read_to_string(&first.nbody).expect("nbody");
        assert!(nbody.ends_with("mpirun -np 256 /opt/MP-Gadget/gadget/MP-Gadget mpgadget.param\n"));
        assert!(root.join(CHECKER_SCRIPT).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn genic_job_keeps_full_run_name() {
        let root = scratch_dir("submit-names");
        let cluster = ClusterProfile::new(
            ClusterKind::Bio,
            &ClusterOptions {
                nproc: Some(256),
                ..ClusterOptions::default()
            },
        )
        .expect("bio");
        let d = SimulationDescriptor::new(
            SimulationParams::new(256, 128),
            RunPaths {
                outdir: root.clone(),
                python: "python".to_string(),
            },
            cluster,
        )
        .expect("descriptor");
        fs::create_dir_all(&root).expect("outdir");
        fs::write(d.genic_param_path(), "Seed = 1\n").expect("genic");
        fs::write(d.gadget_param_path(), "TimeMax = 1.0\n").expect("gadget");

        let scripts = d.submission_artifacts(None).expect("scripts");
        let full = d.run_name();
        assert!(full.len() > 8);
        let genic = fs::read_to_string(&scripts.genic).expect("genic");
        assert!(genic.contains(&format!("#SBATCH --job-name={}\n", full)), "{}", genic);
        let one = fs::read_to_string(&scripts.one).expect("one");
        assert!(one.contains(&format!("#SBATCH --job-name={}\n", d.job_name())));
        let _ = fs::remove_dir_all(root);
    }
}
