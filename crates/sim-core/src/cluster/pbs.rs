//! PBS/Torque directive blocks.

use super::{timestring, ClusterProfile};

fn line(out: &mut String, body: &str) {
    out.push_str("#PBS ");
    out.push_str(body);
    out.push('\n');
}

pub fn template_directives(p: &ClusterProfile, timelimit: f64) -> String {
    let mut out = String::new();
    line(&mut out, "-j eo");
    line(&mut out, "-m bae");
    if !p.email.is_empty() {
        line(&mut out, &format!("-M {}", p.email));
    }
    line(&mut out, &format!("-l walltime={}", timestring(timelimit)));
    out
}

pub fn hipatia_directives(p: &ClusterProfile, timelimit: f64, nproc: u32) -> String {
    let mut out = template_directives(p, timelimit);
    line(
        &mut out,
        &format!("-l nodes={}:ppn={}", p.node_count(nproc), p.cores),
    );
    line(
        &mut out,
        &format!("-l mem={}g", p.memory as u64 * nproc as u64 / 1000),
    );
    line(&mut out, "-V");
    out
}

/// Hypatia is a single shared-memory host without a wall-time cap.
pub fn hypatia_directives(p: &ClusterProfile, job_name: &str, nproc: u32) -> String {
    let mut out = String::new();
    line(&mut out, "-m bae");
    line(&mut out, "-r n");
    line(&mut out, "-q smp");
    line(&mut out, &format!("-N {}", job_name));
    if !p.email.is_empty() {
        line(&mut out, &format!("-M {}", p.email));
    }
    line(&mut out, &format!("-l nodes=1:ppn={}", nproc));
    line(&mut out, "-V");
    out
}

pub fn hipatia_preamble() -> String {
    "cd $PBS_O_WORKDIR\nunset PBS_JOBID\n".to_string()
}

pub fn hypatia_preamble() -> String {
    "cd $PBS_O_WORKDIR\n. /opt/torque/etc/openmpi-setup.sh\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::super::{ClusterCapabilities, ClusterKind, ClusterOptions};
    use super::*;

    fn profile(kind: ClusterKind, nproc: u32) -> ClusterProfile {
        ClusterProfile::new(
            kind,
            &ClusterOptions {
                nproc: Some(nproc),
                email: Some("ops@example.org".to_string()),
                ..ClusterOptions::default()
            },
        )
        .expect("profile")
    }

    #[test]
    fn template_block() {
        let p = profile(ClusterKind::Template, 256);
        assert_eq!(
            p.queue_directives("job", 24.0, 256),
            "#PBS -j eo\n#PBS -m bae\n#PBS -M ops@example.org\n#PBS -l walltime=24:0:00\n"
        );
    }

    #[test]
    fn hipatia_requests_nodes_and_memory() {
        let p = profile(ClusterKind::Hipatia, 64);
        let d = p.queue_directives("job", 1.5, 64);
        assert!(d.contains("#PBS -l walltime=1:30:00\n"));
        assert!(d.contains("#PBS -l nodes=4:ppn=16\n"));
        assert!(d.contains("#PBS -l mem=160g\n"));
        assert!(d.ends_with("#PBS -V\n"));
    }

    #[test]
    fn hypatia_names_job_and_pins_one_node() {
        let p = profile(ClusterKind::Hypatia, 32);
        let d = p.queue_directives("256-0000", 24.0, 32);
        assert!(d.contains("#PBS -N 256-0000\n"));
        assert!(d.contains("#PBS -l nodes=1:ppn=32\n"));
        assert!(!d.contains("walltime"));
    }

    #[test]
    fn missing_email_drops_notification_address() {
        let p = ClusterProfile::new(ClusterKind::Template, &ClusterOptions::default()).expect("p");
        assert!(!p.queue_directives("job", 1.0, 256).contains("-M"));
    }
}
