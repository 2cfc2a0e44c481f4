//! Batch authoring over an experimental design: one request file and one
//! generator-job script per design point.

use crate::config::SimulationRequest;
use crate::descriptor::SimulationParams;
use crate::submit::write_script;
use anyhow::{Context, Result};
use serde_json::Value;
use sim_core::cluster::{job_name, ClusterRegistry};
use sim_core::fsutil::{atomic_write_bytes, ensure_dir};
use sim_core::SimError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Columns of sampled parameter values, one row per design point.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignTable {
    pub names: Vec<String>,
    columns: BTreeMap<String, Vec<f64>>,
    len: usize,
}

impl DesignTable {
    pub fn from_json(value: &Value) -> sim_core::Result<Self> {
        let names: Vec<String> = value
            .get("parameter_names")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SimError::invalid("parameter_names", "missing", "an array of column names")
            })?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| SimError::invalid("parameter_names", "non-string", "strings"))?;

        let mut columns = BTreeMap::new();
        let mut len = None;
        for name in &names {
            let column: Vec<f64> = value
                .get(name)
                .and_then(Value::as_array)
                .ok_or_else(|| SimError::invalid(name, "missing", "a numeric column"))?
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| SimError::invalid(name, "non-numeric", "a numeric column"))?;
            match len {
                None => len = Some(column.len()),
                Some(n) if n != column.len() => {
                    return Err(SimError::invalid(
                        name,
                        column.len(),
                        &format!("{} values like the other columns", n),
                    ))
                }
                Some(_) => {}
            }
            columns.insert(name.clone(), column);
        }
        Ok(Self {
            names,
            columns,
            len: len.unwrap_or(0),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let value: Value =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Ok(Self::from_json(&value)?)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn point(&self, index: usize) -> Vec<(&str, f64)> {
        self.names
            .iter()
            .filter_map(|n| {
                self.columns
                    .get(n)
                    .and_then(|c| c.get(index))
                    .map(|v| (n.as_str(), *v))
            })
            .collect()
    }
}

/// Applies one design coordinate to the simulation inputs.
pub fn apply_design_value(params: &mut SimulationParams, name: &str, value: f64) -> sim_core::Result<()> {
    match name {
        "hubble" => params.hubble = value,
        "omega0" => params.omega0 = value,
        "omegab" => params.omegab = value,
        "scalar_amp" => params.scalar_amp = value,
        "ns" => params.ns = value,
        "w0" => params.w0_fld = value,
        "wa" => params.wa_fld = value,
        "mnu" => params.m_nu = value,
        "Neff" => params.n_ur = value,
        "alphas" => params.alpha_s = value,
        "MWDM" => params.mwdm_therm = value,
        other => {
            return Err(SimError::invalid(
                "design parameter",
                other,
                "one of hubble, omega0, omegab, scalar_amp, ns, w0, wa, mnu, Neff, alphas, MWDM",
            ))
        }
    }
    Ok(())
}

/// Parses a `"1, 2, 5"` point list.
pub fn parse_points(raw: &str) -> sim_core::Result<Vec<usize>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| SimError::invalid("points", s, "comma-separated indices"))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Restrict to these design rows; all rows otherwise.
    pub points: Option<Vec<usize>>,
    pub outdir_base: String,
    pub submit_base: String,
    /// Where request and submit files are written.
    pub dest: PathBuf,
    /// Command that runs the orchestrator on the cluster.
    pub runner: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub index: usize,
    pub outdir: String,
    pub request: PathBuf,
    pub submit: PathBuf,
}

/// Writes one request and one generator-job script per selected point.
/// Every point is validated before anything is written.
pub fn generate_batch(
    design: &DesignTable,
    base: &SimulationRequest,
    opts: &BatchOptions,
) -> Result<Vec<BatchEntry>> {
    let cluster = ClusterRegistry::builtin().build(&base.cluster, &base.cluster_options())?;
    let indices: Vec<usize> = match &opts.points {
        Some(points) => points.clone(),
        None => (0..design.len()).collect(),
    };

    let mut planned = Vec::with_capacity(indices.len());
    for index in indices {
        if index >= design.len() {
            return Err(SimError::invalid(
                "points",
                index,
                &format!("an index below {}", design.len()),
            )
            .into());
        }
        let mut request = base.clone();
        for (name, value) in design.point(index) {
            apply_design_value(&mut request.simulation, name, value)?;
        }
        request.simulation.validate()?;
        let stem = format!(
            "_Box{}_Part{}_{:04}",
            request.simulation.box_size, request.simulation.npart, index
        );
        request.paths.outdir = format!("{}{}", opts.outdir_base, stem);
        planned.push((index, stem, request));
    }

    ensure_dir(&opts.dest)?;
    let mut entries = Vec::with_capacity(planned.len());
    for (index, stem, request) in planned {
        let name = format!("{}{}", opts.submit_base, stem);
        let request_path = opts.dest.join(format!("{}.yaml", name));
        let submit_path = opts.dest.join(format!("{}.submit", name));
        let yaml = serde_yaml::to_string(&request)?;
        atomic_write_bytes(&request_path, yaml.as_bytes())
            .with_context(|| format!("write {}", request_path.display()))?;

        let job = job_name(Path::new(&request.paths.outdir));
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&cluster.generator_directives(&job));
        script.push_str("hostname\n");
        script.push_str("date\n");
        script.push_str(&format!("{} make {}\n", opts.runner, request_path.display()));
        script.push_str("date\n");
        write_script(&submit_path, &script)?;
        entries.push(BatchEntry {
            index,
            outdir: request.paths.outdir.clone(),
            request: request_path,
            submit: submit_path,
        });
    }
    info!(points = entries.len(), dest = %opts.dest.display(), "wrote batch generator scripts");
    Ok(entries)
}
