use serde::{Deserialize, Serialize};
use sim_core::cluster::{job_name, run_name, ClusterProfile};
use sim_core::cosmology::{
    neutrino_mass_splitting, output_time_schedule, radiation_and_ur_density, redshift_label,
    solver_redshifts, DarkEnergy, NuHierarchy, T_CMB,
};
use sim_core::error::{ensure_param, Result};
use sim_core::fsutil::ensure_dir;
use sim_core::ClusterCapabilities;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CLASS_PARAMS_FILE: &str = "_class_params.ini";
pub const LINEAR_DIR: &str = "camb_linear";
pub const IC_DIR: &str = "ICS";
pub const NBODY_OUTPUT_DIR: &str = "output";
pub const OPTIONS_FILE: &str = "Options.mk";
pub const CHECKER_SCRIPT: &str = "cambpower.py";

/// Ultraviolet background table; only consulted for runs with gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UvbModel {
    Hm,
    Fg,
    Sh,
    #[default]
    Pu,
}

fn default_seed() -> u64 {
    9281110
}
fn default_redshift() -> f64 {
    99.0
}
fn default_omega0() -> f64 {
    0.288
}
fn default_omegab() -> f64 {
    0.0472
}
fn default_hubble() -> f64 {
    0.7
}
fn default_scalar_amp() -> f64 {
    2.427e-9
}
fn default_ns() -> f64 {
    0.97
}
fn default_w0() -> f64 {
    -1.0
}
fn default_n_ur() -> f64 {
    3.044
}
fn default_nu_acc() -> f64 {
    1e-5
}
fn default_true() -> bool {
    true
}

/// Primary inputs of one simulation. Box size is in comoving Mpc/h and
/// `npart` is the cube root of the particle count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    #[serde(rename = "box")]
    pub box_size: u32,
    pub npart: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_redshift")]
    pub redshift: f64,
    #[serde(default)]
    pub redend: f64,
    #[serde(default = "default_omega0")]
    pub omega0: f64,
    #[serde(default = "default_omegab")]
    pub omegab: f64,
    #[serde(default = "default_hubble")]
    pub hubble: f64,
    #[serde(default = "default_scalar_amp")]
    pub scalar_amp: f64,
    #[serde(default = "default_ns")]
    pub ns: f64,
    #[serde(default)]
    pub alpha_s: f64,
    #[serde(default)]
    pub m_nu: f64,
    #[serde(default)]
    pub nu_hierarchy: NuHierarchy,
    #[serde(default = "default_w0")]
    pub w0_fld: f64,
    #[serde(default)]
    pub wa_fld: f64,
    #[serde(default = "default_n_ur")]
    pub n_ur: f64,
    #[serde(default, rename = "mwdm_therm")]
    pub mwdm_therm: f64,
    #[serde(default = "default_nu_acc")]
    pub nu_acc: f64,
    #[serde(default = "default_true")]
    pub unitary: bool,
    #[serde(default)]
    pub uvb: UvbModel,
}

impl SimulationParams {
    pub fn new(box_size: u32, npart: u32) -> Self {
        Self {
            box_size,
            npart,
            seed: default_seed(),
            redshift: default_redshift(),
            redend: 0.0,
            omega0: default_omega0(),
            omegab: default_omegab(),
            hubble: default_hubble(),
            scalar_amp: default_scalar_amp(),
            ns: default_ns(),
            alpha_s: 0.0,
            m_nu: 0.0,
            nu_hierarchy: NuHierarchy::default(),
            w0_fld: default_w0(),
            wa_fld: 0.0,
            n_ur: default_n_ur(),
            mwdm_therm: 0.0,
            nu_acc: default_nu_acc(),
            unitary: true,
            uvb: UvbModel::default(),
        }
    }

    pub fn dark_energy(&self) -> DarkEnergy {
        DarkEnergy {
            w0: self.w0_fld,
            wa: self.wa_fld,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_param(self.box_size < 20000, "box", self.box_size, "< 20000")?;
        ensure_param(
            self.npart > 1 && self.npart < 16000,
            "npart",
            self.npart,
            "1 < npart < 16000",
        )?;
        ensure_param(
            self.omega0 > 0.0 && self.omega0 <= 1.0,
            "omega0",
            self.omega0,
            "0 < omega0 <= 1",
        )?;
        ensure_param(
            self.omegab > 0.0 && self.omegab < 1.0,
            "omegab",
            self.omegab,
            "0 < omegab < 1",
        )?;
        ensure_param(
            self.redshift > 1.0 && self.redshift < 1100.0,
            "redshift",
            self.redshift,
            "1 < redshift < 1100",
        )?;
        ensure_param(
            self.redend >= 0.0 && self.redend < 1100.0,
            "redend",
            self.redend,
            "0 <= redend < 1100",
        )?;
        ensure_param(
            self.hubble > 0.0 && self.hubble < 1.0,
            "hubble",
            self.hubble,
            "0 < hubble < 1",
        )?;
        ensure_param(
            self.scalar_amp > 0.0 && self.scalar_amp < 1e-7,
            "scalar_amp",
            self.scalar_amp,
            "0 < scalar_amp < 1e-7",
        )?;
        ensure_param(self.ns > 0.0 && self.ns < 2.0, "ns", self.ns, "0 < ns < 2")?;
        ensure_param(
            self.alpha_s > -1.0 && self.alpha_s < 1.0,
            "alpha_s",
            self.alpha_s,
            "-1 < alpha_s < 1",
        )?;
        ensure_param(self.n_ur >= 0.0, "n_ur", self.n_ur, ">= 0")?;
        ensure_param(self.mwdm_therm >= 0.0, "mwdm_therm", self.mwdm_therm, ">= 0")?;
        ensure_param(
            self.m_nu.is_finite() && self.m_nu >= 0.0,
            "m_nu",
            self.m_nu,
            ">= 0",
        )?;
        ensure_param(self.nu_acc > 0.0, "nu_acc", self.nu_acc, "> 0")?;
        ensure_param(
            self.w0_fld.is_finite() && self.wa_fld.is_finite(),
            "w0_fld/wa_fld",
            format!("{}/{}", self.w0_fld, self.wa_fld),
            "finite",
        )?;
        Ok(())
    }
}

/// Quantities computed once from [`SimulationParams`] at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedQuantities {
    pub omegag: f64,
    pub omega_ur: f64,
    /// Snapshot scale factors.
    pub output_times: Vec<f64>,
    /// Redshifts the linear tables are produced at.
    pub solver_redshifts: Vec<f64>,
    /// `[m1, m2, m3]` in eV.
    pub neutrino_masses: [f64; 3],
}

impl DerivedQuantities {
    pub fn derive(params: &SimulationParams) -> Result<Self> {
        let (omegag, omega_ur) = radiation_and_ur_density(params.hubble, params.n_ur, T_CMB);
        let output_times = output_time_schedule(params.redshift, params.redend)?;
        let solver_redshifts = solver_redshifts(params.redshift, params.redend, &output_times);
        let neutrino_masses = neutrino_mass_splitting(params.m_nu, params.nu_hierarchy)?;
        Ok(Self {
            omegag,
            omega_ur,
            output_times,
            solver_redshifts,
            neutrino_masses,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPaths {
    pub outdir: PathBuf,
    /// Interpreter that runs the spectrum check script.
    pub python: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub tool_version: String,
    pub tool_git: Option<String>,
    pub solver_version: Option<String>,
    pub gadget_git: Option<String>,
}

pub fn tool_version() -> String {
    format!("sim-runner {}", env!("CARGO_PKG_VERSION"))
}

/// Git revision this crate was built from, captured at compile time.
pub fn tool_revision() -> Option<String> {
    option_env!("SIM_RUNNER_GIT_REVISION").map(str::to_string)
}

/// One simulation being prepared: its inputs, derived quantities, output
/// location, provenance and the cluster it is prepared for.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationDescriptor {
    pub params: SimulationParams,
    pub derived: DerivedQuantities,
    pub paths: RunPaths,
    pub provenance: Provenance,
    cluster: ClusterProfile,
}

impl SimulationDescriptor {
    /// Validates every input and derives secondary quantities. Nothing is
    /// written to disk; the output directory is created by the first stage.
    pub fn new(params: SimulationParams, paths: RunPaths, cluster: ClusterProfile) -> Result<Self> {
        params.validate()?;
        let derived = DerivedQuantities::derive(&params)?;
        Ok(Self {
            params,
            derived,
            paths,
            provenance: Provenance {
                tool_version: tool_version(),
                tool_git: tool_revision(),
                ..Provenance::default()
            },
            cluster,
        })
    }

    pub(crate) fn from_parts(
        params: SimulationParams,
        derived: DerivedQuantities,
        paths: RunPaths,
        provenance: Provenance,
        cluster: ClusterProfile,
    ) -> Self {
        Self {
            params,
            derived,
            paths,
            provenance,
            cluster,
        }
    }

    pub fn cluster(&self) -> &ClusterProfile {
        &self.cluster
    }

    pub fn outdir(&self) -> &Path {
        &self.paths.outdir
    }

    pub fn job_name(&self) -> String {
        job_name(&self.paths.outdir)
    }

    /// Untruncated output directory name; the IC job is queued under it.
    pub fn run_name(&self) -> String {
        run_name(&self.paths.outdir)
    }

    /// Label of the starting redshift in table file names.
    pub fn start_label(&self) -> String {
        redshift_label(self.params.redshift)
    }

    /// Base name of the initial-condition files, e.g. `256_128_99`.
    pub fn ic_file_base(&self) -> String {
        format!(
            "{}_{}_{}",
            self.params.box_size, self.params.npart, self.params.redshift
        )
    }

    /// IC location relative to the output directory.
    pub fn ic_path(&self) -> String {
        format!("{}/{}", IC_DIR, self.ic_file_base())
    }

    pub fn matterpow_file(&self, z: f64) -> PathBuf {
        self.paths
            .outdir
            .join(LINEAR_DIR)
            .join(format!("ics_matterpow_{}.dat", redshift_label(z)))
    }

    pub fn transfer_file(&self, z: f64) -> PathBuf {
        self.paths
            .outdir
            .join(LINEAR_DIR)
            .join(format!("ics_transfer_{}.dat", redshift_label(z)))
    }

    pub fn genic_param_path(&self) -> PathBuf {
        self.paths.outdir.join(&self.cluster.genicparam)
    }

    pub fn gadget_param_path(&self) -> PathBuf {
        self.paths.outdir.join(&self.cluster.gadgetparam)
    }

    /// Command that compares the generated ICs against the linear spectrum.
    pub fn spectrum_check_command(&self) -> String {
        format!(
            "{} {} {} --czstr {} --mnu {}",
            self.paths.python,
            CHECKER_SCRIPT,
            self.ic_path(),
            self.start_label(),
            self.params.m_nu
        )
    }

    /// Creates the output directory, warning when it already holds files.
    pub(crate) fn prepare_outdir(&self) -> std::io::Result<()> {
        let outdir = &self.paths.outdir;
        if outdir.exists() {
            if std::fs::read_dir(outdir)?.next().is_some() {
                warn!(outdir = %outdir.display(), "output directory is not empty");
            }
            Ok(())
        } else {
            ensure_dir(outdir)
        }
    }

    /// Human-readable summary with an example submission script.
    pub fn describe(&self) -> String {
        let p = &self.params;
        let mut s = format!("MP-Gadget path: {}\n\n", self.cluster.gadget_dir.display());
        s.push_str("HyperParameters:\n----\n");
        s.push_str(&format!(
            "box {} Mpc/h; npart {}; redshift {}-{}\n\n",
            p.box_size, p.npart, p.redshift, p.redend
        ));
        s.push_str("Cosmology:\n----\n");
        s.push_str(&format!(
            "Omega0 = {}; OmegaB = {}; H = {}; scalar amp = {};\n",
            p.omega0, p.omegab, p.hubble, p.scalar_amp
        ));
        s.push_str(&format!(
            "n_s = {}; alpha_s = {}; m_nu = {}; nu_hierarchy = {}; w0 = {}; wa = {}; N_ur = {};\n\n",
            p.ns, p.alpha_s, p.m_nu, p.nu_hierarchy, p.w0_fld, p.wa_fld, p.n_ur
        ));
        s.push_str(&format!("Cluster: *{}*\n----\n", self.cluster.cluster_name()));
        s.push_str(&self.cluster.to_string());
        s.push('\n');
        s.push_str("Example Submission Script:\n----\n");
        let job = self.job_name();
        s.push_str(
            &self
                .cluster
                .submit_genic(&self.run_name(), Some(&self.spectrum_check_command())),
        );
        s.push('\n');
        s.push_str(&self.cluster.submit_nbody(&job));
        s
    }

    /// Compiler optimisation flags for building the N-body code here.
    pub fn optimize_flags(&self) -> &'static str {
        self.cluster.compiler_optimization_flags()
    }
}

impl fmt::Display for SimulationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use sim_core::cluster::{ClusterKind, ClusterOptions};
    use sim_core::SimError;

    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "simrunner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    pub(crate) fn descriptor_in(outdir: &Path, params: SimulationParams) -> SimulationDescriptor {
        let cluster = ClusterProfile::new(
            ClusterKind::Template,
            &ClusterOptions {
                nproc: Some(256),
                gadget_dir: Some("/opt/MP-Gadget".to_string()),
                ..ClusterOptions::default()
            },
        )
        .expect("cluster");
        SimulationDescriptor::new(
            params,
            RunPaths {
                outdir: outdir.to_path_buf(),
                python: "python3".to_string(),
            },
            cluster,
        )
        .expect("descriptor")
    }

    #[test]
    fn derived_quantities_follow_inputs() {
        let d = descriptor_in(&scratch_dir("derive"), SimulationParams::new(256, 128));
        assert_eq!(d.derived.output_times.len(), 8);
        assert_eq!(d.derived.solver_redshifts.len(), 10);
        assert_eq!(d.derived.neutrino_masses, [0.0, 0.0, 0.0]);
        assert!(d.derived.omegag > 0.0);
        assert_eq!(d.ic_path(), "ICS/256_128_99");
    }

    #[test]
    fn provenance_carries_build_revision() {
        let d = descriptor_in(&scratch_dir("prov"), SimulationParams::new(256, 128));
        assert_eq!(d.provenance.tool_git, tool_revision());
        assert!(d.provenance.tool_version.starts_with("sim-runner "));
    }

    #[test]
    fn construction_writes_nothing() {
        let root = scratch_dir("nowrite");
        let _ = descriptor_in(&root, SimulationParams::new(256, 128));
        assert!(!root.exists());
    }

    #[test]
    fn out_of_range_inputs_rejected() {
        let cases: Vec<(&str, Box<dyn Fn(&mut SimulationParams)>)> = vec![
            ("omega0", Box::new(|p| p.omega0 = 1.5)),
            ("omegab", Box::new(|p| p.omegab = 0.0)),
            ("hubble", Box::new(|p| p.hubble = 1.2)),
            ("scalar_amp", Box::new(|p| p.scalar_amp = 1e-6)),
            ("ns", Box::new(|p| p.ns = 2.5)),
            ("redshift", Box::new(|p| p.redshift = 1.0)),
            ("redend", Box::new(|p| p.redend = -0.5)),
            ("alpha_s", Box::new(|p| p.alpha_s = 1.0)),
            ("n_ur", Box::new(|p| p.n_ur = -1.0)),
            ("mwdm_therm", Box::new(|p| p.mwdm_therm = -0.1)),
            ("box", Box::new(|p| p.box_size = 20000)),
            ("npart", Box::new(|p| p.npart = 1)),
        ];
        for (name, mutate) in cases {
            let mut p = SimulationParams::new(256, 128);
            mutate(&mut p);
            match p.validate() {
                Err(SimError::InvalidParameter { name: got, .. }) => assert_eq!(got, name),
                other => panic!("{}: expected InvalidParameter, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn spectrum_check_names_ic_and_redshift() {
        let mut p = SimulationParams::new(256, 128);
        p.m_nu = 0.06;
        let d = descriptor_in(&scratch_dir("check"), p);
        assert_eq!(
            d.spectrum_check_command(),
            "python3 cambpower.py ICS/256_128_99 --czstr 99 --mnu 0.06"
        );
    }

    #[test]
    fn describe_includes_cluster_and_script() {
        let d = descriptor_in(&scratch_dir("describe"), SimulationParams::new(256, 128));
        let text = d.to_string();
        assert!(text.contains("box 256 Mpc/h; npart 128; redshift 99-0"));
        assert!(text.contains("Cluster: *Template*"));
        assert!(text.contains("#!/bin/bash\n#PBS -j eo"));
        assert!(text.contains("walltime=0:30:00"));
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let p: SimulationParams = serde_yaml::from_str("box: 100\nnpart: 75\nm_nu: 0.1\n").expect("yaml");
        assert_eq!(p.box_size, 100);
        assert_eq!(p.seed, 9281110);
        assert_eq!(p.omega0, 0.288);
        assert_eq!(p.n_ur, 3.044);
        assert_eq!(p.uvb, UvbModel::Pu);
        assert!(p.unitary);
        assert_eq!(p.m_nu, 0.1);
    }
}
