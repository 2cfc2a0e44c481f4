//! Prepares cosmological simulations: linear spectra, initial-condition and
//! N-body configs, batch scripts for a target cluster and a reproducibility
//! snapshot, in that order.

pub mod batch;
pub mod config;
pub mod descriptor;
pub mod gadget;
pub mod genic;
pub mod power;
pub mod process;
pub mod snapshot;
pub mod submit;

pub use batch::{generate_batch, BatchEntry, BatchOptions, DesignTable};
pub use config::SimulationRequest;
pub use descriptor::{
    DerivedQuantities, Provenance, RunPaths, SimulationDescriptor, SimulationParams, UvbModel,
};
pub use power::{BoltzmannSolver, ClassExecutable, LinearSpectra};
pub use submit::SubmitScripts;

use anyhow::Result;
use sim_core::SimError;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MakeOptions {
    /// Run the IC generator and spectrum check locally, then rebuild the N-body code.
    pub do_build: bool,
    /// Relative tolerance for the IC spectrum check.
    pub pk_accuracy: f64,
    /// Spectrum check script to ship with the submission scripts.
    pub checker: Option<PathBuf>,
}

impl Default for MakeOptions {
    fn default() -> Self {
        Self {
            do_build: false,
            pk_accuracy: 0.05,
            checker: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub outdir: PathBuf,
    pub linear_dir: PathBuf,
    pub genic_param: PathBuf,
    pub ic_path: String,
    pub compiler_options: PathBuf,
    pub gadget_param: PathBuf,
    pub scripts: SubmitScripts,
    pub rebuilt_binary: Option<PathBuf>,
    pub snapshot: PathBuf,
}

/// Runs every stage in order and persists the snapshot last, so a snapshot
/// on disk means the run directory is complete.
pub fn make_simulation(
    descriptor: &mut SimulationDescriptor,
    solver: &dyn BoltzmannSolver,
    opts: &MakeOptions,
) -> Result<SimulationResult> {
    info!(
        outdir = %descriptor.outdir().display(),
        cluster = descriptor.cluster().cluster_name(),
        "making simulation"
    );

    info!("stage 1: linear power spectrum");
    let linear_dir = descriptor.power_spectrum_config(solver)?;
    info!("stage 2: initial-condition config");
    let ics = descriptor.ic_generator_config()?;
    let compiler_options = descriptor.write_compiler_options()?;
    info!("stage 3: N-body config");
    let gadget_param = descriptor.nbody_config()?;
    info!("stage 4: submission scripts");
    let scripts = descriptor.submission_artifacts(opts.checker.as_deref())?;

    let rebuilt_binary = if opts.do_build {
        descriptor.run_genic_locally()?;
        check_ic_power(descriptor, opts.pk_accuracy)?;
        Some(descriptor.do_gadget_build(&compiler_options)?)
    } else {
        None
    };

    info!("stage 5: reproducibility snapshot");
    let snapshot = descriptor.save_snapshot()?;
    info!(outdir = %descriptor.outdir().display(), "simulation ready");
    Ok(SimulationResult {
        outdir: descriptor.outdir().to_path_buf(),
        linear_dir,
        genic_param: ics.param_file,
        ic_path: ics.ic_path,
        compiler_options,
        gadget_param,
        scripts,
        rebuilt_binary,
        snapshot,
    })
}

/// Runs the shipped spectrum check against the freshly generated ICs.
fn check_ic_power(descriptor: &SimulationDescriptor, accuracy: f64) -> Result<String> {
    let script = descriptor.outdir().join(descriptor::CHECKER_SCRIPT);
    if !script.exists() {
        return Err(SimError::MissingArtifact(script).into());
    }
    let mut cmd = std::process::Command::new(&descriptor.paths.python);
    cmd.arg(descriptor::CHECKER_SCRIPT)
        .arg(descriptor.ic_path())
        .arg("--czstr")
        .arg(descriptor.start_label())
        .arg("--mnu")
        .arg(descriptor.params.m_nu.to_string())
        .arg("--accuracy")
        .arg(accuracy.to_string())
        .current_dir(descriptor.outdir());
    info!(accuracy, "checking IC power spectrum");
    process::run_captured(cmd)
}
