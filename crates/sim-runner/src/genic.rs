use crate::descriptor::{SimulationDescriptor, IC_DIR, LINEAR_DIR};
use anyhow::{Context, Result};
use sim_core::fsutil::ensure_dir;
use sim_core::{ClusterCapabilities, ConfigStage, ParamFile, SimError};
use std::path::PathBuf;
use tracing::info;

/// IC-generator defaults shipped with the binary.
pub const DEFAULT_GENIC_PARAMS: &str = include_str!("../defaults/mpgenic.ini");

/// Keys whose values the rest of the pipeline depends on.
const REQUIRED_LITERALS: [(&str, &str); 4] = [
    // tabulated input spectrum
    ("WhichSpectrum", "2"),
    ("RadiationOn", "1"),
    ("DifferentTransferFunctions", "1"),
    ("InputPowerRedshift", "-1"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct IcOutputs {
    pub param_file: PathBuf,
    /// IC location relative to the output directory.
    pub ic_path: String,
}

impl SimulationDescriptor {
    /// IC-generator parameters layered over the embedded defaults, with the
    /// cluster's overrides applied last.
    pub fn genic_params(&self) -> sim_core::Result<ParamFile> {
        let p = &self.params;
        let d = &self.derived;
        let mut c = ParamFile::parse(DEFAULT_GENIC_PARAMS)?;
        c.set("BoxSize", p.box_size as i64 * 1000);
        c.set("OutputDir", IC_DIR);
        c.set("FileBase", self.ic_file_base());
        c.set("Ngrid", p.npart);
        c.set("NgridNu", 0i64);
        c.set("ProduceGas", 0i64);
        c.set("UnitaryAmplitude", p.unitary);
        c.set("Omega0", p.omega0);
        c.set("OmegaBaryon", p.omegab);
        c.set("HubbleParam", p.hubble);
        c.set("Redshift", p.redshift);

        let dark = 1.0 - p.omega0 - d.omegag - d.omega_ur;
        let de = p.dark_energy();
        if de.is_dynamic() {
            c.set("OmegaLambda", 0i64);
            c.set("Omega_fld", dark);
            c.set("w0_fld", de.w0);
            c.set("wa_fld", de.wa);
        } else {
            c.set("OmegaLambda", dark);
            c.set("Omega_fld", 0i64);
        }
        // Omega_tot = Omega_m + Omega_g + Omega_Lambda + Omega_fld + Omega_ur
        c.set("CLASS_Radiation", 1i64);
        c.set("MWDM_therm", p.mwdm_therm);
        c.set("Omega_ur", d.omega_ur);

        let label = self.start_label();
        c.set(
            "FileWithInputSpectrum",
            format!("{}/ics_matterpow_{}.dat", LINEAR_DIR, label),
        );
        c.set(
            "FileWithTransferFunction",
            format!("{}/ics_transfer_{}.dat", LINEAR_DIR, label),
        );
        let [m1, m2, m3] = d.neutrino_masses;
        c.set("MNue", m3);
        c.set("MNum", m2);
        c.set("MNut", m1);
        for (key, literal) in REQUIRED_LITERALS {
            c.expect_literal(key, literal)?;
        }
        c.set("Seed", p.seed);
        c.merge(
            self.cluster()
                .extra_config_overrides(ConfigStage::InitialConditions),
        );
        Ok(c)
    }

    /// Stage 2: writes the IC-generator config. The start-redshift tables
    /// from stage 1 must exist.
    pub fn ic_generator_config(&mut self) -> Result<IcOutputs> {
        let z = self.params.redshift;
        for table in [self.matterpow_file(z), self.transfer_file(z)] {
            if !table.exists() {
                return Err(SimError::MissingArtifact(table).into());
            }
        }
        let config = self.genic_params()?;
        ensure_dir(&self.outdir().join(IC_DIR))?;
        let param_file = self.genic_param_path();
        config
            .write(&param_file)
            .with_context(|| format!("write {}", param_file.display()))?;
        info!(path = %param_file.display(), "wrote IC generator config");
        Ok(IcOutputs {
            param_file,
            ic_path: self.ic_path(),
        })
    }
}
