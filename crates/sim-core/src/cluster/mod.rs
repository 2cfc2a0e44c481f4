//! Scheduler and resource conventions of the HPC targets we submit to.
//!
//! Every target is a [`ClusterProfile`] record tagged with a [`ClusterKind`].
//! The behaviour that differs between targets is reached only through
//! [`ClusterCapabilities`], which dispatches on the tag to the per-dialect
//! functions in [`pbs`] and [`slurm`].

pub mod pbs;
mod registry;
pub mod slurm;

pub use registry::{ClusterRegistry, Constructor};

use crate::error::{ensure_param, Result, SimError};
use crate::fsutil::expand_home;
use crate::paramfile::ParamValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Template,
    Hipatia,
    Marcc,
    Bio,
    Stampede,
    Frontera,
    Hypatia,
}

impl ClusterKind {
    pub const ALL: [ClusterKind; 7] = [
        ClusterKind::Template,
        ClusterKind::Hipatia,
        ClusterKind::Marcc,
        ClusterKind::Bio,
        ClusterKind::Stampede,
        ClusterKind::Frontera,
        ClusterKind::Hypatia,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ClusterKind::Template => "template",
            ClusterKind::Hipatia => "hipatia",
            ClusterKind::Marcc => "marcc",
            ClusterKind::Bio => "bio",
            ClusterKind::Stampede => "stampede",
            ClusterKind::Frontera => "frontera",
            ClusterKind::Hypatia => "hypatia",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ClusterKind::Template => "Template",
            ClusterKind::Hipatia => "Hipatia",
            ClusterKind::Marcc => "MARCC",
            ClusterKind::Bio => "BIOCluster",
            ClusterKind::Stampede => "Stampede",
            ClusterKind::Frontera => "Frontera",
            ClusterKind::Hypatia => "Hypatia",
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            ClusterKind::Template | ClusterKind::Hipatia | ClusterKind::Hypatia => Dialect::Pbs,
            _ => Dialect::Slurm,
        }
    }

    pub fn defaults(&self) -> ResourceDefaults {
        let base = ResourceDefaults {
            nproc: 256,
            cores: 16,
            mpi_ranks: 8,
            threads: 16,
            timelimit: 24.0,
            memory: 1800,
            policy: NodePolicy::Partial,
        };
        match self {
            ClusterKind::Template => base,
            ClusterKind::Hipatia => ResourceDefaults {
                memory: 2500,
                ..base
            },
            ClusterKind::Marcc => ResourceDefaults {
                nproc: 48,
                cores: 24,
                timelimit: 8.0,
                memory: 5000,
                policy: NodePolicy::FullNodes,
                ..base
            },
            ClusterKind::Bio => ResourceDefaults {
                nproc: 8,
                cores: 32,
                timelimit: 2.0,
                memory: slurm::BIO_MEMORY_CAP_GB,
                ..base
            },
            // Charged in node-hours: one "process" is one node.
            ClusterKind::Stampede => ResourceDefaults {
                nproc: 2,
                cores: 1,
                timelimit: 3.0,
                ..base
            },
            ClusterKind::Frontera => ResourceDefaults {
                nproc: 8,
                cores: 56,
                ..base
            },
            ClusterKind::Hypatia => ResourceDefaults {
                cores: 32,
                policy: NodePolicy::SingleNode,
                ..base
            },
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Pbs,
    Slurm,
}

impl Dialect {
    pub fn prefix(&self) -> &'static str {
        match self {
            Dialect::Pbs => "#PBS",
            Dialect::Slurm => "#SBATCH",
        }
    }
}

/// How process counts map onto nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePolicy {
    /// Node count rounds up; the last node may be partially used.
    Partial,
    /// Process count must be an exact multiple of cores-per-node.
    FullNodes,
    /// Everything runs on one shared-memory node.
    SingleNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceDefaults {
    pub nproc: u32,
    pub cores: u32,
    pub mpi_ranks: u32,
    pub threads: u32,
    pub timelimit: f64,
    pub memory: u32,
    pub policy: NodePolicy,
}

/// Which generated config a runtime override is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStage {
    InitialConditions,
    NBody,
}

/// User-supplied resource request; unset fields take the variant's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    pub nproc: Option<u32>,
    pub cores: Option<u32>,
    pub mpi_ranks: Option<u32>,
    pub threads: Option<u32>,
    /// Wall-time limit in hours.
    pub timelimit: Option<f64>,
    pub memory: Option<u32>,
    pub email: Option<String>,
    pub account: Option<String>,
    pub gadget_dir: Option<String>,
}

pub const DEFAULT_GADGET_DIR: &str = "~/codes/MP-Gadget/";
pub const GADGET_EXE: &str = "MP-Gadget";
pub const GENIC_EXE: &str = "MP-GenIC";
pub const GADGET_PARAM: &str = "mpgadget.param";
pub const GENIC_PARAM: &str = "_genic_params.ini";
/// Seconds kept back from the wall-time limit for writing the final snapshot.
pub const CPU_TIME_MARGIN_SECS: f64 = 300.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterProfile {
    pub kind: ClusterKind,
    pub nproc: u32,
    pub cores: u32,
    pub mpi_ranks: u32,
    pub threads: u32,
    /// Wall-time limit in hours.
    pub timelimit: f64,
    /// Memory budget; the unit follows the scheduler request it feeds
    /// (MB per task for PBS/MARCC, GB per job for BIO).
    pub memory: u32,
    pub email: String,
    pub account: Option<String>,
    pub gadget_dir: PathBuf,
    pub gadgetexe: PathBuf,
    pub genicexe: PathBuf,
    pub gadgetparam: String,
    pub genicparam: String,
}

impl ClusterProfile {
    pub fn new(kind: ClusterKind, opts: &ClusterOptions) -> Result<Self> {
        let d = kind.defaults();
        let nproc = opts.nproc.unwrap_or(d.nproc);
        let cores = opts.cores.unwrap_or(d.cores);
        let mpi_ranks = opts.mpi_ranks.unwrap_or(d.mpi_ranks);
        let threads = opts.threads.unwrap_or(d.threads);
        let timelimit = opts.timelimit.unwrap_or(d.timelimit);

        ensure_param(nproc > 0, "nproc", nproc, "> 0")?;
        ensure_param(cores > 0, "cores", cores, "> 0")?;
        ensure_param(mpi_ranks > 0, "mpi_ranks", mpi_ranks, "> 0")?;
        ensure_param(threads > 0, "threads", threads, "> 0")?;
        ensure_param(
            timelimit.is_finite() && timelimit * 3600.0 > CPU_TIME_MARGIN_SECS,
            "timelimit",
            timelimit,
            "more than the 300 s snapshot margin, in hours",
        )?;
        if d.policy == NodePolicy::FullNodes {
            ensure_param(
                nproc % cores == 0,
                "nproc",
                nproc,
                &format!("a multiple of {} (whole nodes on {})", cores, kind.display_name()),
            )?;
        }

        let memory = match (kind, opts.memory) {
            (_, Some(m)) => m,
            (ClusterKind::Bio, None) => slurm::bio_memory_budget(nproc),
            (_, None) => d.memory,
        };

        let gadget_dir = expand_home(opts.gadget_dir.as_deref().unwrap_or(DEFAULT_GADGET_DIR));
        let profile = ClusterProfile {
            kind,
            nproc,
            cores,
            mpi_ranks,
            threads,
            timelimit,
            memory,
            email: opts.email.clone().unwrap_or_default(),
            account: opts.account.clone(),
            gadgetexe: gadget_dir.join("gadget").join(GADGET_EXE),
            genicexe: gadget_dir.join("genic").join(GENIC_EXE),
            gadget_dir,
            gadgetparam: GADGET_PARAM.to_string(),
            genicparam: GENIC_PARAM.to_string(),
        };
        if matches!(kind, ClusterKind::Bio | ClusterKind::Frontera) {
            let nodes = profile.node_count(nproc);
            ensure_param(
                mpi_ranks >= nodes && mpi_ranks <= nproc,
                "mpi_ranks",
                mpi_ranks,
                &format!("between the node count {} and nproc {}", nodes, nproc),
            )?;
        }
        Ok(profile)
    }

    pub fn policy(&self) -> NodePolicy {
        self.kind.defaults().policy
    }

    pub fn node_count(&self, nproc: u32) -> u32 {
        match self.policy() {
            NodePolicy::SingleNode => 1,
            _ => nproc.div_ceil(self.cores),
        }
    }

    pub fn cluster_name(&self) -> &'static str {
        self.kind.display_name()
    }

    /// Batch script running the IC generator, the N-body code and an
    /// optional trailing command in one allocation.
    pub fn submit_one(&self, job_name: &str, extra_command: Option<&str>) -> String {
        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&self.queue_directives(job_name, self.timelimit, self.nproc));
        s.push_str("hostname\n");
        s.push_str("date\n");
        s.push_str(&self.launch_command(&self.genic_command(), self.threads));
        s.push_str(&format!("{} {}\n", self.launcher(), self.gadget_command()));
        if let Some(extra) = extra_command {
            s.push_str(extra);
            s.push('\n');
        }
        s.push_str("date\n");
        s
    }

    /// Batch script for the IC generator alone, with a half-hour limit.
    pub fn submit_genic(&self, job_name: &str, extra_command: Option<&str>) -> String {
        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&self.queue_directives(job_name, 0.5, self.nproc));
        s.push_str(&self.launch_command(&self.genic_command(), self.threads));
        if let Some(extra) = extra_command {
            s.push_str(extra);
            s.push('\n');
        }
        s
    }

    /// Batch script for the N-body code alone.
    pub fn submit_nbody(&self, job_name: &str) -> String {
        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&self.queue_directives(job_name, self.timelimit, self.nproc));
        s.push_str(&self.launch_command(&self.gadget_command(), self.threads));
        s
    }

    fn genic_command(&self) -> String {
        format!("{} {}", self.genicexe.display(), self.genicparam)
    }

    fn gadget_command(&self) -> String {
        format!("{} {}", self.gadgetexe.display(), self.gadgetparam)
    }

    /// Directives for a small single-process job that runs the orchestrator
    /// itself on the cluster.
    pub fn generator_directives(&self, job_name: &str) -> String {
        match self.kind {
            ClusterKind::Bio => slurm::bio_generator_directives(self, job_name),
            ClusterKind::Frontera => slurm::frontera_generator_directives(self, job_name),
            _ => self.queue_directives(job_name, 4.0, 1),
        }
    }
}

/// Formats fractional hours as `H:M:00`.
pub fn timestring(hours: f64) -> String {
    let hr = hours.trunc() as u64;
    let minute = ((hours - hours.trunc()) * 60.0) as u64;
    format!("{}:{}:00", hr, minute)
}

/// Final component of the output directory.
pub fn run_name(outdir: &std::path::Path) -> String {
    outdir
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// The last eight characters of the output directory name, the job name
/// schedulers display.
pub fn job_name(outdir: &std::path::Path) -> String {
    let chars: Vec<char> = run_name(outdir).chars().collect();
    let start = chars.len().saturating_sub(8);
    chars[start..].iter().collect()
}

/// Behaviour that varies between clusters.
pub trait ClusterCapabilities {
    /// Scheduler resource request block, one directive per line.
    fn queue_directives(&self, job_name: &str, timelimit: f64, nproc: u32) -> String;
    /// Bare parallel launcher invocation, without environment setup.
    fn launcher(&self) -> String;
    /// Environment setup plus launcher wrapped around `command`.
    fn launch_command(&self, command: &str, threads: u32) -> String;
    fn compiler_optimization_flags(&self) -> &'static str;
    /// Runtime knobs merged into the generated config for `stage`.
    fn extra_config_overrides(&self, stage: ConfigStage) -> BTreeMap<String, ParamValue>;
    /// Extra compile-time toggles, one `prefix`ed line each.
    fn runtime_config_options(&self, out: &mut String, prefix: &str);
}

impl ClusterCapabilities for ClusterProfile {
    fn queue_directives(&self, job_name: &str, timelimit: f64, nproc: u32) -> String {
        match self.kind {
            ClusterKind::Template => pbs::template_directives(self, timelimit),
            ClusterKind::Hipatia => pbs::hipatia_directives(self, timelimit, nproc),
            ClusterKind::Hypatia => pbs::hypatia_directives(self, job_name, nproc),
            ClusterKind::Marcc => slurm::marcc_directives(self, job_name, timelimit, nproc),
            ClusterKind::Bio => slurm::bio_directives(self, job_name, timelimit, nproc),
            ClusterKind::Stampede => slurm::stampede_directives(self, job_name, timelimit, nproc),
            ClusterKind::Frontera => slurm::frontera_directives(self, job_name, timelimit, nproc),
        }
    }

    fn launcher(&self) -> String {
        match self.kind {
            ClusterKind::Template | ClusterKind::Hipatia => format!("mpirun -np {}", self.nproc),
            ClusterKind::Hypatia => format!(
                "mpirun -v -hostfile $PBS_NODEFILE -npernode {}",
                self.nproc
            ),
            ClusterKind::Marcc => "mpirun --map-by core".to_string(),
            ClusterKind::Bio => "mpirun".to_string(),
            ClusterKind::Stampede | ClusterKind::Frontera => "ibrun".to_string(),
        }
    }

    fn launch_command(&self, command: &str, threads: u32) -> String {
        let preamble = match self.kind {
            ClusterKind::Template => String::new(),
            ClusterKind::Hipatia => pbs::hipatia_preamble(),
            ClusterKind::Hypatia => pbs::hypatia_preamble(),
            ClusterKind::Marcc => slurm::marcc_preamble(),
            ClusterKind::Bio => slurm::bio_preamble(threads),
            ClusterKind::Stampede => slurm::stampede_preamble(),
            ClusterKind::Frontera => slurm::frontera_preamble(threads),
        };
        format!("{}{} {}\n", preamble, self.launcher(), command)
    }

    fn compiler_optimization_flags(&self) -> &'static str {
        match self.kind {
            ClusterKind::Marcc => "-fopenmp -O3 -g -Wall -march=native",
            ClusterKind::Bio => "-fopenmp -O3 -g -Wall -ffast-math -march=corei7",
            ClusterKind::Frontera => "-fopenmp -O2 -g -Wall -xCORE-AVX2 -Zp16 -fp-model fast=1",
            _ => "-fopenmp -O3 -g -Wall -ffast-math -march=native",
        }
    }

    fn extra_config_overrides(&self, stage: ConfigStage) -> BTreeMap<String, ParamValue> {
        let mut out = BTreeMap::new();
        match self.kind {
            ClusterKind::Bio => {
                out.insert(
                    "MaxMemSizePerNode".to_string(),
                    ParamValue::Float(self.memory as f64 * slurm::BIO_MB_PER_GB),
                );
            }
            ClusterKind::Stampede => {
                // Printing a backtrace hangs the job on exit.
                out.insert("ShowBacktrace".to_string(), ParamValue::Int(0));
            }
            ClusterKind::Frontera => {
                out.insert("ShowBacktrace".to_string(), ParamValue::Int(0));
                if stage == ConfigStage::NBody {
                    out.insert("MaxMemSizePerNode".to_string(), ParamValue::Float(0.8));
                }
            }
            _ => {}
        }
        out
    }

    fn runtime_config_options(&self, out: &mut String, prefix: &str) {
        if self.kind == ClusterKind::Stampede {
            // isend/irecv allocations are slow on the Skylake fabric.
            out.push_str(&format!("{}NO_ISEND_IRECV_IN_DOMAIN\n", prefix));
            out.push_str(&format!("{}NO_ISEND_IRECV_IN_PM\n", prefix));
        }
    }
}

impl fmt::Display for ClusterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "N Processors: {}; N cores: {}; N nodes: {}; Email: {}",
            self.nproc,
            self.cores,
            self.node_count(self.nproc),
            if self.email.is_empty() { "none" } else { &self.email }
        )?;
        writeln!(f, "Timelimit: {}", timestring(self.timelimit))
    }
}

impl std::str::FromStr for ClusterKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        ClusterRegistry::builtin().lookup(s)
    }
}
