use crate::descriptor::{SimulationDescriptor, NBODY_OUTPUT_DIR, OPTIONS_FILE};
use crate::process::{git_revision, run_captured};
use anyhow::{Context, Result};
use sim_core::fsutil::{atomic_write_bytes, ensure_dir};
use sim_core::cluster::CPU_TIME_MARGIN_SECS;
use sim_core::{ClusterCapabilities, ConfigStage, ParamFile, SimError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;
use tracing::{info, warn};

const CLOSURE_TOLERANCE: f64 = 1e-10;

impl SimulationDescriptor {
    /// N-body runtime parameters for ICs stored at `ic_path`.
    pub fn gadget_params(&self, ic_path: &str) -> sim_core::Result<ParamFile> {
        let p = &self.params;
        let d = &self.derived;
        let mut c = ParamFile::new();
        c.set("InitCondFile", ic_path);
        c.set("OutputDir", NBODY_OUTPUT_DIR);
        c.set(
            "TimeLimitCPU",
            (3600.0 * self.cluster().timelimit - CPU_TIME_MARGIN_SECS) as i64,
        );
        c.set("TimeMax", 1.0 / (1.0 + p.redend));
        c.set("Omega0", p.omega0);

        let dark = 1.0 - p.omega0 - d.omegag - d.omega_ur;
        let de = p.dark_energy();
        if de.is_dynamic() {
            c.set("OmegaLambda", 0i64);
            c.set("Omega_fld", dark);
            c.set("w0_fld", de.w0);
            c.set("wa_fld", de.wa);
        } else {
            c.set("OmegaLambda", dark);
        }
        c.set("Omega_ur", d.omega_ur);
        // Dark matter only: no gas particles.
        c.set("OmegaBaryon", 0.0);
        c.set("HubbleParam", p.hubble);
        c.set("RadiationOn", 1i64);
        c.set("HydroOn", 1i64);
        c.set("MassiveNuLinRespOn", p.m_nu > 0.0);
        let [m1, m2, m3] = d.neutrino_masses;
        c.set("MNue", m3);
        c.set("MNum", m2);
        c.set("MNut", m1);

        c.set("SnapshotWithFOF", 1i64);
        c.set("FOFHaloLinkingLength", 0.2);
        c.set("OutputList", d.output_times.clone());

        // Gas-only knobs that the code still requires.
        c.set("MinGasTemp", 100i64);
        c.set("InitGasTemp", 2.7 * (1.0 + p.redshift));
        c.set("DensityIndependentSphOn", 1i64);
        c.set("PartAllocFactor", 2i64);
        c.set("WindOn", 0i64);
        c.set("WindModel", "nowind");
        c.set("BlackHoleOn", 0i64);
        c.set("OutputPotential", 0i64);
        c.set("MetalReturnOn", 0i64);
        c.set("CoolingOn", 0i64);
        c.set("StarformationOn", 0i64);

        c.merge(self.cluster().extra_config_overrides(ConfigStage::NBody));
        self.check_density_closure(&c)?;
        Ok(c)
    }

    fn check_density_closure(&self, c: &ParamFile) -> sim_core::Result<()> {
        let total = c.get_f64("Omega0").unwrap_or(0.0)
            + c.get_f64("OmegaLambda").unwrap_or(0.0)
            + c.get_f64("Omega_fld").unwrap_or(0.0)
            + c.get_f64("Omega_ur").unwrap_or(0.0)
            + self.derived.omegag;
        if (total - 1.0).abs() > CLOSURE_TOLERANCE {
            return Err(SimError::ConsistencyFailure(format!(
                "density budget sums to {} instead of 1",
                total
            )));
        }
        Ok(())
    }

    /// Build options for compiling the N-body code on this cluster.
    pub fn compiler_options(&self, prefix: &str) -> String {
        let mut s = String::from("MPICC = mpicc\nMPICXX = mpic++\n");
        s.push_str(&format!(
            "OPTIMIZE = {}\n",
            self.cluster().compiler_optimization_flags()
        ));
        s.push_str("GSL_INCL = $(shell gsl-config --cflags)\n");
        s.push_str("GSL_LIBS = $(shell gsl-config --libs)\n");
        self.cluster().runtime_config_options(&mut s, prefix);
        s
    }

    /// Writes `Options.mk` into the output directory.
    pub fn write_compiler_options(&self) -> Result<PathBuf> {
        self.prepare_outdir()?;
        let path = self.outdir().join(OPTIONS_FILE);
        atomic_write_bytes(&path, self.compiler_options("OPT += -D").as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "wrote compiler options");
        Ok(path)
    }

    /// Stage 3: writes the N-body config. The IC-generator config from
    /// stage 2 must exist.
    pub fn nbody_config(&mut self) -> Result<PathBuf> {
        let genic = self.genic_param_path();
        if !genic.exists() {
            return Err(SimError::MissingArtifact(genic).into());
        }
        let config = self.gadget_params(&self.ic_path())?;
        ensure_dir(&self.outdir().join(NBODY_OUTPUT_DIR))?;
        let path = self.gadget_param_path();
        config
            .write(&path)
            .with_context(|| format!("write {}", path.display()))?;
        info!(
            path = %path.display(),
            snapshots = self.derived.output_times.len(),
            "wrote N-body config"
        );
        Ok(path)
    }

    /// Runs the IC generator in the output directory.
    pub fn run_genic_locally(&self) -> Result<String> {
        let param = self.genic_param_path();
        if !param.exists() {
            return Err(SimError::MissingArtifact(param).into());
        }
        let mut cmd = Command::new(&self.cluster().genicexe);
        cmd.arg(&self.cluster().genicparam).current_dir(self.outdir());
        info!(exe = %self.cluster().genicexe.display(), "running IC generator");
        run_captured(cmd)
    }

    /// Links `options` into the N-body source tree, rebuilds and copies the
    /// fresh binary into the output directory.
    pub fn do_gadget_build(&mut self, options: &Path) -> Result<PathBuf> {
        if !options.exists() {
            return Err(SimError::MissingArtifact(options.to_path_buf()).into());
        }
        let gadget_dir = self.cluster().gadget_dir.clone();
        let conffile = gadget_dir.join(OPTIONS_FILE);
        match fs::symlink_metadata(&conffile) {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&conffile)?,
            Ok(_) => {
                let backup = gadget_dir.join(format!("{}.backup", OPTIONS_FILE));
                warn!(path = %conffile.display(), "backing up existing build options");
                fs::rename(&conffile, &backup)?;
            }
            Err(_) => {}
        }
        let options = fs::canonicalize(options)?;
        link_file(&options, &conffile)
            .with_context(|| format!("link {} -> {}", conffile.display(), options.display()))?;

        let binary = self.cluster().gadgetexe.clone();
        let before = modified(&binary);
        self.provenance.gadget_git = git_revision(&gadget_dir);

        let mut cmd = Command::new("make");
        cmd.arg("-j").current_dir(&gadget_dir);
        info!(dir = %gadget_dir.display(), "building N-body code");
        run_captured(cmd)?;

        let after = modified(&binary);
        if after.is_none() || after == before {
            return Err(SimError::ConsistencyFailure(format!(
                "{} was not rebuilt",
                binary.display()
            ))
            .into());
        }
        let file_name = binary
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| SimError::MissingArtifact(binary.clone()))?;
        let dest = self.outdir().join(file_name);
        fs::copy(&binary, &dest)
            .with_context(|| format!("copy {} -> {}", binary.display(), dest.display()))?;
        info!(binary = %dest.display(), "N-body binary rebuilt");
        Ok(dest)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(unix)]
fn link_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn link_file(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::copy(target, link).map(|_| ())
}
