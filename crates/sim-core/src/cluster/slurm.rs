//! SLURM directive blocks.

use super::{timestring, ClusterProfile};

/// Ceiling on the per-job memory request on BIO, in GB.
pub const BIO_MEMORY_CAP_GB: u32 = 115;
/// BIO nodes expose a shared 256-core pool.
const BIO_POOL_CORES: u32 = 256;
/// Wall time of a generator job, in hours.
const GENERATOR_HOURS: f64 = 4.0;
/// Converts the BIO GB budget into the MB figure the N-body code reads.
pub const BIO_MB_PER_GB: f64 = 978.2608;

/// Splits the BIO node memory between the jobs that can share it.
pub fn bio_memory_budget(nproc: u32) -> u32 {
    let n_jobs = BIO_POOL_CORES.div_ceil(nproc.max(1));
    let per_job = (1024.0 * 0.95 / n_jobs as f64) as u32;
    per_job.min(BIO_MEMORY_CAP_GB)
}

fn line(out: &mut String, body: &str) {
    out.push_str("#SBATCH ");
    out.push_str(body);
    out.push('\n');
}

/// Mail directives left in the script but commented out.
fn commented_mail(out: &mut String, email: &str) {
    if email.is_empty() {
        return;
    }
    out.push_str("# SBATCH --mail-type=end\n");
    out.push_str(&format!("# SBATCH --mail-user={}\n", email));
}

fn header(out: &mut String, partition: &str, job_name: &str, time: &str) {
    line(out, &format!("--partition={}", partition));
    line(out, &format!("--job-name={}", job_name));
    line(out, &format!("--time={}", time));
}

pub fn marcc_directives(p: &ClusterProfile, job_name: &str, timelimit: f64, nproc: u32) -> String {
    let mut out = String::new();
    header(&mut out, "parallel", job_name, &timestring(timelimit));
    line(&mut out, &format!("--nodes={}", p.node_count(nproc)));
    line(&mut out, &format!("--ntasks-per-node={}", p.cores));
    line(&mut out, "--cpus-per-task=1");
    line(&mut out, &format!("--mem-per-cpu={}", p.memory));
    if !p.email.is_empty() {
        line(&mut out, "--mail-type=end");
        line(&mut out, &format!("--mail-user={}", p.email));
    }
    out
}

pub fn bio_directives(p: &ClusterProfile, job_name: &str, timelimit: f64, nproc: u32) -> String {
    let nodes = p.node_count(nproc);
    let mut out = String::new();
    header(&mut out, "short", job_name, &timestring(timelimit));
    line(&mut out, &format!("--nodes={}", nodes));
    line(&mut out, &format!("--ntasks-per-node={}", p.mpi_ranks / nodes.max(1)));
    line(&mut out, &format!("--cpus-per-task={}", nproc / p.mpi_ranks));
    line(&mut out, &format!("--mem={}G", p.memory));
    commented_mail(&mut out, &p.email);
    out.push('\n');
    out
}

/// Stampede is charged per node, so `nproc` counts nodes there.
pub fn stampede_directives(
    p: &ClusterProfile,
    job_name: &str,
    timelimit: f64,
    nproc: u32,
) -> String {
    let mut out = String::new();
    header(&mut out, "skx-normal", job_name, &timestring(timelimit));
    line(&mut out, &format!("--nodes={}", p.node_count(nproc)));
    line(&mut out, "--ntasks-per-node=4");
    if !p.email.is_empty() {
        line(&mut out, "--mail-type=end");
        line(&mut out, &format!("--mail-user={}", p.email));
    }
    if let Some(account) = &p.account {
        line(&mut out, &format!("-A {}", account));
    }
    out
}

pub fn frontera_directives(
    p: &ClusterProfile,
    job_name: &str,
    timelimit: f64,
    nproc: u32,
) -> String {
    let nodes = p.node_count(nproc);
    let mut out = String::new();
    header(&mut out, "normal", job_name, &timestring(timelimit));
    line(&mut out, &format!("--nodes={}", nodes));
    line(&mut out, &format!("--ntasks-per-node={}", p.mpi_ranks / nodes.max(1)));
    commented_mail(&mut out, &p.email);
    out
}

pub fn bio_generator_directives(p: &ClusterProfile, job_name: &str) -> String {
    let mut out = String::new();
    header(&mut out, "intel", job_name, &timestring(GENERATOR_HOURS));
    line(&mut out, "--nodes=1");
    line(&mut out, "--ntasks-per-node=1");
    line(&mut out, "--cpus-per-task=1");
    line(&mut out, "--mem=6G");
    commented_mail(&mut out, &p.email);
    out.push('\n');
    out
}

pub fn frontera_generator_directives(p: &ClusterProfile, job_name: &str) -> String {
    let mut out = String::new();
    header(&mut out, "small", job_name, &timestring(GENERATOR_HOURS));
    line(&mut out, "--nodes=1");
    line(&mut out, "--ntasks-per-node=1");
    commented_mail(&mut out, &p.email);
    out
}

pub fn marcc_preamble() -> String {
    "export OMP_NUM_THREADS=1\n".to_string()
}

pub fn bio_preamble(threads: u32) -> String {
    format!(
        "export OMP_NUM_THREADS={}\nmodule unload miniconda3/py39_4.12.0\n",
        threads
    )
}

pub fn stampede_preamble() -> String {
    "export OMP_NUM_THREADS=24\n".to_string()
}

pub fn frontera_preamble(threads: u32) -> String {
    format!("export OMP_NUM_THREADS={}\n", threads)
}

#[cfg(test)]
mod tests {
    use super::super::{ClusterCapabilities, ClusterKind, ClusterOptions};
    use super::*;

    fn profile(kind: ClusterKind, opts: ClusterOptions) -> ClusterProfile {
        ClusterProfile::new(
            kind,
            &ClusterOptions {
                email: Some("ops@example.org".to_string()),
                ..opts
            },
        )
        .expect("profile")
    }

    #[test]
    fn bio_memory_shares_the_pool() {
        assert_eq!(bio_memory_budget(8), 30);
        assert_eq!(bio_memory_budget(64), 115);
        assert_eq!(bio_memory_budget(256), 115);
        let p = profile(
            ClusterKind::Bio,
            ClusterOptions {
                nproc: Some(32),
                ..ClusterOptions::default()
            },
        );
        assert_eq!(p.memory, 115);
    }

    #[test]
    fn bio_block_splits_ranks_over_nodes() {
        let p = profile(
            ClusterKind::Bio,
            ClusterOptions {
                nproc: Some(256),
                ..ClusterOptions::default()
            },
        );
        let d = p.queue_directives("256-0000", 2.0, 256);
        assert_eq!(
            d,
            "#SBATCH --partition=short\n\
             #SBATCH --job-name=256-0000\n\
             #SBATCH --time=2:0:00\n\
             #SBATCH --nodes=8\n\
             #SBATCH --ntasks-per-node=1\n\
             #SBATCH --cpus-per-task=32\n\
             #SBATCH --mem=115G\n\
             # SBATCH --mail-type=end\n\
             # SBATCH --mail-user=ops@example.org\n\n"
        );
    }

    #[test]
    fn marcc_requests_whole_nodes() {
        let p = profile(
            ClusterKind::Marcc,
            ClusterOptions {
                nproc: Some(96),
                ..ClusterOptions::default()
            },
        );
        let d = p.queue_directives("job", 8.0, 96);
        assert!(d.contains("#SBATCH --nodes=4\n"));
        assert!(d.contains("#SBATCH --ntasks-per-node=24\n"));
        assert!(d.contains("#SBATCH --mem-per-cpu=5000\n"));
        assert!(d.contains("#SBATCH --mail-user=ops@example.org\n"));
    }

    #[test]
    fn stampede_account_is_optional() {
        let mut p = profile(ClusterKind::Stampede, ClusterOptions::default());
        assert!(!p.queue_directives("job", 3.0, 2).contains("-A "));
        p.account = Some("TG-AST000".to_string());
        let d = p.queue_directives("job", 3.0, 2);
        assert!(d.contains("#SBATCH --nodes=2\n"));
        assert!(d.contains("#SBATCH -A TG-AST000\n"));
    }

    #[test]
    fn frontera_rounds_nodes_up() {
        let p = profile(
            ClusterKind::Frontera,
            ClusterOptions {
                nproc: Some(112),
                mpi_ranks: Some(8),
                ..ClusterOptions::default()
            },
        );
        let d = p.queue_directives("job", 24.0, 112);
        assert!(d.contains("#SBATCH --partition=normal\n"));
        assert!(d.contains("#SBATCH --nodes=2\n"));
        assert!(d.contains("#SBATCH --ntasks-per-node=4\n"));
        assert!(d.contains("# SBATCH --mail-type=end\n"));
    }

    #[test]
    fn generator_blocks_are_single_core() {
        let b = profile(ClusterKind::Bio, ClusterOptions::default());
        let g = b.generator_directives("gen-job");
        assert!(g.starts_with("#SBATCH --partition=intel\n"));
        assert!(g.contains("#SBATCH --time=4:0:00\n"));
        assert!(g.contains("#SBATCH --mem=6G\n"));
        let f = profile(ClusterKind::Frontera, ClusterOptions::default());
        let g = f.generator_directives("gen-job");
        assert!(g.contains("#SBATCH --partition=small\n"));
        assert!(g.contains("#SBATCH --time=4:0:00\n"));
    }

    #[test]
    fn stampede_rounds_partial_nodes_up() {
        let p = profile(
            ClusterKind::Stampede,
            ClusterOptions {
                nproc: Some(50),
                cores: Some(48),
                account: Some("TG-AST000".to_string()),
                ..ClusterOptions::default()
            },
        );
        let d = p.queue_directives("job", 1.0, 50);
        assert!(d.contains("#SBATCH --nodes=2\n"), "{}", d);
        let small = profile(
            ClusterKind::Stampede,
            ClusterOptions {
                nproc: Some(8),
                cores: Some(48),
                ..ClusterOptions::default()
            },
        );
        assert!(small.queue_directives("job", 1.0, 8).contains("#SBATCH --nodes=1\n"));
    }

    #[test]
    fn rank_counts_outside_node_range_rejected() {
        let err = ClusterProfile::new(
            ClusterKind::Bio,
            &ClusterOptions {
                nproc: Some(256),
                mpi_ranks: Some(4),
                ..ClusterOptions::default()
            },
        )
        .expect_err("too few ranks");
        assert!(err.to_string().contains("mpi_ranks"), "{}", err);
    }
}
