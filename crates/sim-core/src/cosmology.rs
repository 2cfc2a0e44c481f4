//! Secondary quantities derived from the primary cosmological parameters.

use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Solar mass-squared splitting, eV^2.
pub const NU_M21: f64 = 7.53e-5;
/// Atmospheric mass-squared splitting for the normal ordering, eV^2.
pub const NU_M32_NORMAL: f64 = 2.44e-3;
/// Atmospheric mass-squared splitting for the inverted ordering, eV^2 (magnitude).
pub const NU_M32_INVERTED: f64 = 2.51e-3;

/// Below this summed mass the normal ordering is treated as one massive state.
pub const NORMAL_MIN_MASS: f64 = 0.06;

pub const T_CMB: f64 = 2.7255;

/// Effective number contributed by one massive neutrino species at early times.
pub const NEFF_PER_SPECIES: f64 = 1.013198221453432;

const OMEGA_GAMMA_COEFF: f64 = 4.480075654158969e-7;
const UR_PER_PHOTON: f64 = 0.22710731766023898;

/// Omega_nu h^2 = m_nu / 93.14 eV.
pub const NU_DENSITY_EV: f64 = 93.14;

/// Candidate snapshot scale factors.
pub const OUTPUT_TIMES: [f64; 8] = [0.02, 0.1, 0.2, 0.25, 0.3333, 0.5, 0.66667, 0.83333];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NuHierarchy {
    #[default]
    Normal,
    Inverted,
    Degenerate,
}

impl NuHierarchy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NuHierarchy::Normal => "normal",
            NuHierarchy::Inverted => "inverted",
            NuHierarchy::Degenerate => "degenerate",
        }
    }
}

impl fmt::Display for NuHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NuHierarchy {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(NuHierarchy::Normal),
            "inverted" => Ok(NuHierarchy::Inverted),
            "degenerate" => Ok(NuHierarchy::Degenerate),
            _ => Err(SimError::invalid(
                "nu_hierarchy",
                s,
                "one of normal, inverted, degenerate",
            )),
        }
    }
}

/// Smallest inverted-ordering sum for which the split keeps the lightest
/// state non-negative: the first estimate equals the total there.
pub fn inverted_min_mass() -> f64 {
    (4.0 / 3.0 * (3.0 * NU_M32_INVERTED - 1.5 * NU_M21)).sqrt()
}

/// Splits a summed neutrino mass (eV) into three eigenstate masses.
///
/// For `normal` and `inverted` above their thresholds, the summed mass of the
/// two closest states is estimated once, then corrected once with the
/// neglected term. The correction is not iterated to convergence; the
/// postcondition only requires the two estimates to agree to 2%.
pub fn neutrino_mass_splitting(total_mass: f64, hierarchy: NuHierarchy) -> Result<[f64; 3]> {
    if !(total_mass >= 0.0) || !total_mass.is_finite() {
        return Err(SimError::invalid("m_nu", total_mass, "finite and >= 0"));
    }
    let nu_m32 = match hierarchy {
        NuHierarchy::Normal => {
            if total_mass < NORMAL_MIN_MASS {
                return Ok([total_mass, 0.0, 0.0]);
            }
            NU_M32_NORMAL
        }
        NuHierarchy::Inverted => {
            if total_mass < inverted_min_mass() {
                return Ok([total_mass / 2.0, total_mass / 2.0, 0.0]);
            }
            -NU_M32_INVERTED
        }
        NuHierarchy::Degenerate => {
            let m = total_mass / 3.0;
            return Ok([m, m, m]);
        }
    };

    let base = total_mass * total_mass + 3.0 * nu_m32 + 1.5 * NU_M21;
    let dd1 = 4.0 * total_mass / 3.0 - 2.0 / 3.0 * base.sqrt();
    let dd = 4.0 * total_mass / 3.0
        - 2.0 / 3.0 * (base + 0.75 * NU_M21 * NU_M21 / (dd1 * dd1)).sqrt();
    if !dd.is_finite() {
        return Err(SimError::ConsistencyFailure(format!(
            "neutrino splitting diverged for m_nu = {} ({})",
            total_mass, hierarchy
        )));
    }
    if (dd1 / dd - 1.0).abs() >= 2e-2 {
        return Err(SimError::ConsistencyFailure(format!(
            "neutrino splitting estimates disagree: {} vs {}",
            dd1, dd
        )));
    }
    let masses = [
        total_mass - dd,
        0.5 * (dd + NU_M21 / dd),
        0.5 * (dd - NU_M21 / dd),
    ];
    if masses.iter().any(|m| *m < 0.0 || !m.is_finite()) {
        return Err(SimError::ConsistencyFailure(format!(
            "negative neutrino mass in {:?} for m_nu = {}",
            masses, total_mass
        )));
    }
    Ok(masses)
}

/// Photon and ultra-relativistic density fractions `(omega_g, omega_ur)`.
///
/// `omega_ur` only counts the `n_eff` in excess of three massive species, so
/// it can be negative when `n_eff < 3.0396`.
pub fn radiation_and_ur_density(hubble: f64, n_eff: f64, t_cmb: f64) -> (f64, f64) {
    let omegag = OMEGA_GAMMA_COEFF * t_cmb.powi(4) / (hubble * hubble);
    let omega_ur = omegag * UR_PER_PHOTON * (n_eff - 3.0 * NEFF_PER_SPECIES);
    (omegag, omega_ur)
}

pub fn scale_factor(redshift: f64) -> f64 {
    1.0 / (1.0 + redshift)
}

pub fn redshift_of(scale_factor: f64) -> f64 {
    1.0 / scale_factor - 1.0
}

/// Candidate output times strictly inside `(a(z_start), a(z_end))`.
pub fn output_time_schedule(z_start: f64, z_end: f64) -> Result<Vec<f64>> {
    let astart = scale_factor(z_start);
    let aend = scale_factor(z_end);
    let times: Vec<f64> = OUTPUT_TIMES
        .iter()
        .copied()
        .filter(|t| *t > astart && *t < aend)
        .collect();
    if times.is_empty() {
        return Err(SimError::invalid(
            "redshift window",
            format!("({}, {})", z_start, z_end),
            "at least one output time between start and end",
        ));
    }
    Ok(times)
}

/// Redshifts the Boltzmann solver must tabulate: start, each output time, end.
pub fn solver_redshifts(z_start: f64, z_end: f64, output_times: &[f64]) -> Vec<f64> {
    let mut zz = Vec::with_capacity(output_times.len() + 2);
    zz.push(z_start);
    zz.extend(output_times.iter().map(|a| redshift_of(*a)));
    zz.push(z_end);
    let mut out: Vec<f64> = Vec::with_capacity(zz.len());
    for z in zz {
        if !out.iter().any(|seen| *seen == z) {
            out.push(z);
        }
    }
    out
}

/// File-name label for a tabulated redshift: the integer part above z = 10,
/// otherwise one significant digit in `%g` style.
pub fn redshift_label(z: f64) -> String {
    if z > 10.0 {
        return format!("{}", z.trunc() as i64);
    }
    if z == 0.0 {
        return "0".to_string();
    }
    // `{:.0e}` rounds to one significant digit, e.g. "5e-1", "1e1".
    let sci = format!("{:.0e}", z);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => return sci,
    };
    if (-4..1).contains(&exp) {
        let decimals = (-exp) as usize;
        format!("{:.*}", decimals, z)
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DarkEnergy {
    pub w0: f64,
    pub wa: f64,
}

impl Default for DarkEnergy {
    fn default() -> Self {
        Self { w0: -1.0, wa: 0.0 }
    }
}

impl DarkEnergy {
    /// True when a fluid replaces the cosmological constant.
    pub fn is_dynamic(&self) -> bool {
        self.w0 != -1.0 || self.wa != 0.0
    }

    /// True when w(a) stays on one side of -1, so PPF is not needed.
    pub fn avoids_phantom_crossing(&self) -> bool {
        (self.w0 + self.wa + 1.0) * (1.0 + self.w0) > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sums(total: f64, h: NuHierarchy) {
        let m = neutrino_mass_splitting(total, h).expect("split");
        let sum: f64 = m.iter().sum();
        assert!((sum - total).abs() < 1e-12, "{:?} sums to {} not {}", m, sum, total);
        assert!(m.iter().all(|x| *x >= 0.0), "{:?}", m);
    }

    #[test]
    fn mass_splitting_conserves_total_for_all_hierarchies() {
        for h in [NuHierarchy::Normal, NuHierarchy::Inverted, NuHierarchy::Degenerate] {
            for total in [0.0, 0.02, 0.05, 0.06, 0.1, 0.15, 0.3, 0.6, 1.2] {
                assert_sums(total, h);
            }
        }
    }

    #[test]
    fn normal_below_threshold_is_one_massive_state() {
        let m = neutrino_mass_splitting(0.05, NuHierarchy::Normal).expect("split");
        assert_eq!(m, [0.05, 0.0, 0.0]);
    }

    #[test]
    fn normal_above_threshold_gives_three_positive_masses() {
        let m = neutrino_mass_splitting(0.3, NuHierarchy::Normal).expect("split");
        assert!(m.iter().all(|x| *x > 0.0), "{:?}", m);
        assert!(m[0] > m[1] && m[1] > m[2]);
    }

    #[test]
    fn inverted_below_threshold_splits_in_two() {
        let m = neutrino_mass_splitting(0.08, NuHierarchy::Inverted).expect("split");
        assert_eq!(m, [0.04, 0.04, 0.0]);
    }

    #[test]
    fn inverted_split_is_valid_across_its_threshold() {
        let cut = inverted_min_mass();
        assert!((cut - 0.0994454624).abs() < 1e-9, "{}", cut);
        for i in 0..=1000 {
            let total = 0.09 + i as f64 * 1e-5;
            assert_sums(total, NuHierarchy::Inverted);
        }
        let below = neutrino_mass_splitting(0.095, NuHierarchy::Inverted).expect("split");
        assert_eq!(below, [0.0475, 0.0475, 0.0]);
        let above = neutrino_mass_splitting(cut, NuHierarchy::Inverted).expect("split");
        assert!(above[0] > 0.0 && above[0] < 1e-4, "{:?}", above);
    }

    #[test]
    fn mass_splitting_sweep_never_fails() {
        for h in [NuHierarchy::Normal, NuHierarchy::Inverted, NuHierarchy::Degenerate] {
            for i in 0..=3000 {
                assert_sums(i as f64 * 5e-4, h);
            }
        }
    }

    #[test]
    fn degenerate_is_equal_thirds() {
        let m = neutrino_mass_splitting(0.3, NuHierarchy::Degenerate).expect("split");
        assert!((m[0] - 0.1).abs() < 1e-15 && m[0] == m[1] && m[1] == m[2]);
    }

    #[test]
    fn negative_mass_is_rejected() {
        let err = neutrino_mass_splitting(-0.1, NuHierarchy::Normal).expect_err("negative");
        assert!(matches!(err, SimError::InvalidParameter { .. }));
    }

    #[test]
    fn hierarchy_parses_case_insensitively() {
        assert_eq!("Inverted".parse::<NuHierarchy>().expect("parse"), NuHierarchy::Inverted);
        assert!("sideways".parse::<NuHierarchy>().is_err());
    }

    #[test]
    fn radiation_density_matches_reference_values() {
        let (og, our) = radiation_and_ur_density(0.7, 3.044, T_CMB);
        assert!((og - 5.045149e-5).abs() < 1e-10, "omega_g = {}", og);
        let expected_ur = og * 0.22710731766023898 * (3.044 - 3.0 * 1.013198221453432);
        assert_eq!(our, expected_ur);
        let (_, none) = radiation_and_ur_density(0.7, 3.0 * NEFF_PER_SPECIES, T_CMB);
        assert!(none.abs() < 1e-20);
    }

    #[test]
    fn full_window_keeps_every_candidate() {
        let times = output_time_schedule(99.0, 0.0).expect("schedule");
        assert_eq!(times, OUTPUT_TIMES.to_vec());
    }

    #[test]
    fn low_start_keeps_boundary_candidate() {
        // a_start = 0.6667 sits just below 0.66667.
        let times = output_time_schedule(0.5, 0.0).expect("schedule");
        assert_eq!(times, vec![0.66667, 0.83333]);
    }

    #[test]
    fn empty_window_is_rejected() {
        let err = output_time_schedule(0.1, 0.05).expect_err("empty");
        assert!(matches!(err, SimError::InvalidParameter { .. }));
    }

    #[test]
    fn solver_redshifts_cover_start_schedule_and_end() {
        let times = output_time_schedule(99.0, 0.0).expect("schedule");
        let zz = solver_redshifts(99.0, 0.0, &times);
        assert_eq!(zz.len(), 10);
        assert_eq!(zz[0], 99.0);
        assert_eq!(zz[9], 0.0);
        assert!(zz.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn redshift_labels_follow_percent_g() {
        assert_eq!(redshift_label(99.0), "99");
        assert_eq!(redshift_label(49.0), "49");
        assert_eq!(redshift_label(0.0), "0");
        assert_eq!(redshift_label(9.000000000000002), "9");
        assert_eq!(redshift_label(2.0003000300030003), "2");
        assert_eq!(redshift_label(0.49999250003749984), "0.5");
        assert_eq!(redshift_label(0.20000480001920007), "0.2");
        assert_eq!(redshift_label(10.0), "1e+01");
    }

    #[test]
    fn dark_energy_flags() {
        assert!(!DarkEnergy::default().is_dynamic());
        let de = DarkEnergy { w0: -1.1, wa: -0.1 };
        assert!(de.is_dynamic());
        assert!(de.avoids_phantom_crossing());
        // w(a=0) = w0 + wa = -1 touches the divide.
        assert!(!DarkEnergy { w0: -1.1, wa: 0.1 }.avoids_phantom_crossing());
        let crossing = DarkEnergy { w0: -0.9, wa: -0.3 };
        assert!(!crossing.avoids_phantom_crossing());
    }
}
