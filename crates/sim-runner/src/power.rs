//! Linear power spectrum stage: the Boltzmann-solver input file, the solver
//! seam and the per-redshift tables the IC generator reads.

use crate::descriptor::{SimulationDescriptor, CLASS_PARAMS_FILE, LINEAR_DIR};
use crate::process::{git_revision, run_captured};
use anyhow::{Context, Result};
use sim_core::cosmology::{NEFF_PER_SPECIES, NU_DENSITY_EV};
use sim_core::fsutil::{atomic_write_bytes, ensure_dir};
use sim_core::{ParamFile, SimError};
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Tables the solver produced for one redshift.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSpectra {
    pub redshift: f64,
    /// Transfer-function column names; the first is `k`.
    pub columns: Vec<String>,
    pub transfer: Vec<Vec<f64>>,
    /// Linear matter power at each row's k.
    pub pk: Vec<f64>,
}

impl LinearSpectra {
    pub fn k(&self) -> impl Iterator<Item = f64> + '_ {
        self.transfer.iter().map(|row| row.first().copied().unwrap_or(0.0))
    }
}

/// External program turning a solver input file into linear tables.
pub trait BoltzmannSolver {
    fn version(&self) -> String;
    /// One entry per requested redshift, in the same order.
    fn solve(&self, params_file: &Path, redshifts: &[f64], workdir: &Path)
        -> Result<Vec<LinearSpectra>>;
}

/// The CLASS command-line binary.
pub struct ClassExecutable {
    pub binary: PathBuf,
}

impl ClassExecutable {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl BoltzmannSolver for ClassExecutable {
    fn version(&self) -> String {
        match git_revision(&self.binary) {
            Some(rev) => format!("class@{}", rev),
            None => "class".to_string(),
        }
    }

    fn solve(
        &self,
        params_file: &Path,
        redshifts: &[f64],
        workdir: &Path,
    ) -> Result<Vec<LinearSpectra>> {
        let scratch = workdir.join(LINEAR_DIR).join("class_run");
        ensure_dir(&scratch)?;
        let root = format!("{}/class_", scratch.display());
        let text = fs::read_to_string(params_file)
            .with_context(|| format!("read {}", params_file.display()))?;
        let mut run = ParamFile::parse(&text)?;
        run.set("root", root.as_str());
        run.set("overwrite_root", "yes");
        run.set("format", "class");
        run.set("headers", "yes");
        let run_ini = scratch.join("class_run.ini");
        run.write(&run_ini)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg(&run_ini).current_dir(workdir);
        run_captured(cmd)?;

        let mut out = Vec::with_capacity(redshifts.len());
        for (i, z) in redshifts.iter().enumerate() {
            let suffix = if redshifts.len() > 1 {
                format!("z{}_", i + 1)
            } else {
                String::new()
            };
            let tk_path = PathBuf::from(format!("{}{}tk.dat", root, suffix));
            let pk_path = PathBuf::from(format!("{}{}pk.dat", root, suffix));
            let (columns, mut transfer) = read_table(&tk_path)?;
            let (_, pk_rows) = read_table(&pk_path)?;
            // Keep the last k inside the tabulated power range.
            if let Some(last) = transfer.last_mut().and_then(|row| row.first_mut()) {
                *last *= 0.9999;
            }
            let pk_k: Vec<f64> = pk_rows.iter().map(|r| r[0]).collect();
            let pk_v: Vec<f64> = pk_rows.iter().map(|r| r.get(1).copied().unwrap_or(0.0)).collect();
            let pk = transfer
                .iter()
                .map(|row| loglog_interp(&pk_k, &pk_v, row[0]))
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| {
                    SimError::ConsistencyFailure(format!(
                        "cannot interpolate {} onto transfer k grid",
                        pk_path.display()
                    ))
                })?;
            out.push(LinearSpectra {
                redshift: *z,
                columns,
                transfer,
                pk,
            });
        }
        Ok(out)
    }
}

/// Reads a whitespace table written by CLASS. Column names come from the
/// last header line, which lists them as `1:k (h/Mpc)  2:d_g ...`.
fn read_table(path: &Path) -> Result<(Vec<String>, Vec<Vec<f64>>)> {
    if !path.exists() {
        return Err(SimError::MissingArtifact(path.to_path_buf()).into());
    }
    let text = fs::read_to_string(path)?;
    let mut names = Vec::new();
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(header) = trimmed.strip_prefix('#') {
            let found: Vec<String> = header
                .split_whitespace()
                .filter_map(|tok| {
                    let (num, name) = tok.split_once(':')?;
                    num.parse::<usize>().ok()?;
                    Some(name.to_string())
                })
                .collect();
            if !found.is_empty() {
                names = found;
            }
            continue;
        }
        let row = trimmed
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| {
                SimError::ConsistencyFailure(format!(
                    "{}:{}: {}",
                    path.display(),
                    idx + 1,
                    e
                ))
            })?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(SimError::ConsistencyFailure(format!("{} has no rows", path.display())).into());
    }
    Ok((names, rows))
}

/// Linear interpolation in log-log space, extrapolating from the end segments.
fn loglog_interp(xs: &[f64], ys: &[f64], x: f64) -> Option<f64> {
    if xs.len() < 2 || xs.len() != ys.len() || x <= 0.0 {
        return None;
    }
    let i = match xs.iter().position(|v| *v >= x) {
        Some(0) => 1,
        Some(i) => i,
        None => xs.len() - 1,
    };
    let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
    if x0 <= 0.0 || x1 <= 0.0 || y0 <= 0.0 || y1 <= 0.0 {
        return None;
    }
    let t = (x.ln() - x0.ln()) / (x1.ln() - x0.ln());
    Some((y0.ln() + t * (y1.ln() - y0.ln())).exp())
}

const TRANSFER_HEADER: &str = "Transfer functions T_i(k) for adiabatic (AD) mode (normalized to initial curvature=1)
d_i   stands for (delta rho_i/rho_i)(k,z) with above normalization
d_tot stands for (delta rho_tot/rho_tot)(k,z) with rho_Lambda NOT included in rho_tot
(note that this differs from the transfer function output from CAMB/CMBFAST, which gives the same
 quantities divided by -k^2 with k in Mpc^-1; use format=camb to match CAMB)
t_i   stands for theta_i(k,z) with above normalization
t_tot stands for (sum_i [rho_i+p_i] theta_i)/(sum_i [rho_i+p_i]))(k,z)";

/// `%.18e` with a signed two-digit exponent.
fn sci(x: f64) -> String {
    let s = format!("{:.18e}", x);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let e: i32 = exp.parse().unwrap_or(0);
            let sign = if e < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, e.abs())
        }
        None => s,
    }
}

fn render_rows<'a>(rows: impl Iterator<Item = Vec<f64>> + 'a) -> String {
    let mut out = String::new();
    for row in rows {
        let cells: Vec<String> = row.iter().map(|v| sci(*v)).collect();
        out.push_str(&cells.join(" "));
        out.push('\n');
    }
    out
}

pub fn render_transfer_table(spectra: &LinearSpectra) -> String {
    let mut out = String::new();
    for line in TRANSFER_HEADER.lines() {
        out.push_str("# ");
        out.push_str(line);
        out.push('\n');
    }
    let listing: Vec<String> = spectra
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{}. {} ", i + 1, name))
        .collect();
    out.push_str("# ");
    out.push_str(&listing.join(" "));
    out.push('\n');
    out.push_str(&render_rows(spectra.transfer.iter().cloned()));
    out
}

pub fn render_matterpow_table(spectra: &LinearSpectra) -> String {
    render_rows(spectra.k().zip(spectra.pk.iter()).map(|(k, p)| vec![k, *p]))
}

impl SimulationDescriptor {
    /// Boltzmann-solver input for this cosmology.
    pub fn class_params(&self) -> ParamFile {
        let p = &self.params;
        let mut c = ParamFile::new();
        c.set("tol_background_integration", 1e-9);
        c.set("tol_perturb_integration", 1e-7);
        c.set("tol_thermo_integration", 1e-5);
        c.set("k_per_decade_for_pk", 50i64);
        c.set("k_bao_width", 8i64);
        c.set("k_per_decade_for_bao", 200i64);
        c.set("neglect_CMB_sources_below_visibility", 1e-30);
        c.set("transfer_neglect_late_source", 3000.0);
        c.set("l_max_g", 50i64);
        c.set("l_max_ur", 150i64);
        c.set("extra metric transfer functions", "y");

        let omeganu = p.m_nu / NU_DENSITY_EV / (p.hubble * p.hubble);
        c.set("h", p.hubble);
        c.set("Omega_cdm", p.omega0 - p.omegab - omeganu);
        c.set("Omega_b", p.omegab);
        c.set("Omega_k", 0i64);
        c.set("n_s", p.ns);
        c.set("A_s", p.scalar_amp);
        c.set("alpha_s", p.alpha_s);

        let de = p.dark_energy();
        if de.is_dynamic() {
            c.set("Omega_Lambda", 0i64);
            c.set("w0_fld", de.w0);
            c.set("wa_fld", de.wa);
            if de.avoids_phantom_crossing() {
                c.set("use_ppf", "no");
            }
        } else {
            c.set("Omega_fld", 0i64);
        }

        if p.m_nu > 0.0 {
            let masses: Vec<String> = self
                .derived
                .neutrino_masses
                .iter()
                .filter(|m| **m != 0.0)
                .map(|m| format!("{:.8}", m))
                .collect();
            let n_ncdm = masses.len() as i64;
            c.set("m_ncdm", masses.join(","));
            c.set("N_ncdm", n_ncdm);
            c.set("N_ur", p.n_ur - n_ncdm as f64 * NEFF_PER_SPECIES);
            c.set("tol_ncdm_newtonian", p.nu_acc.min(1e-5));
            c.set("tol_ncdm_synchronous", p.nu_acc);
            c.set("tol_ncdm_bg", 1e-10);
            c.set("l_max_ncdm", 50i64);
            // Fluid approximation off: the neutrino solver needs accurate P_nu.
            c.set("ncdm_fluid_approximation", 3i64);
            c.set("ncdm_fluid_trigger_tau_over_tau_k", 30000.0 * (p.m_nu / 0.4));
        } else {
            c.set("N_ur", p.n_ur);
        }

        let maxk = 2.0 * PI / p.box_size as f64 * p.npart as f64 * 8.0;
        c.set("output", "dTk vTk mPk");
        c.set("P_k_max_h/Mpc", maxk);
        c.set("z_max_pk", p.redshift + 1.0);
        c.set("z_pk", self.derived.solver_redshifts.clone());
        c
    }

    /// Stage 1: writes the solver input, runs the solver and stores one
    /// transfer table and one power table per redshift. Returns the table
    /// directory.
    pub fn power_spectrum_config(&mut self, solver: &dyn BoltzmannSolver) -> Result<PathBuf> {
        self.prepare_outdir()?;
        let outdir = self.outdir().to_path_buf();
        let params_path = outdir.join(CLASS_PARAMS_FILE);
        self.class_params()
            .write(&params_path)
            .with_context(|| format!("write {}", params_path.display()))?;
        info!(path = %params_path.display(), "wrote solver input");

        let redshifts = self.derived.solver_redshifts.clone();
        let spectra = solver.solve(&params_path, &redshifts, &outdir)?;
        if spectra.len() != redshifts.len() {
            return Err(SimError::ConsistencyFailure(format!(
                "solver returned {} tables for {} redshifts",
                spectra.len(),
                redshifts.len()
            ))
            .into());
        }
        self.provenance.solver_version = Some(solver.version());

        let linear_dir = outdir.join(LINEAR_DIR);
        ensure_dir(&linear_dir)?;
        for table in &spectra {
            if table.pk.len() != table.transfer.len() {
                return Err(SimError::ConsistencyFailure(format!(
                    "z={}: {} power values for {} transfer rows",
                    table.redshift,
                    table.pk.len(),
                    table.transfer.len()
                ))
                .into());
            }
            atomic_write_bytes(
                &self.transfer_file(table.redshift),
                render_transfer_table(table).as_bytes(),
            )?;
            atomic_write_bytes(
                &self.matterpow_file(table.redshift),
                render_matterpow_table(table).as_bytes(),
            )?;
        }
        info!(
            tables = spectra.len(),
            dir = %linear_dir.display(),
            "stored linear transfer and power tables"
        );
        Ok(linear_dir)
    }
}
