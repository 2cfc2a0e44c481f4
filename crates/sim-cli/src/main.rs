use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sim_core::cluster::{ClusterKind, ClusterRegistry};
use sim_core::SimError;
use sim_runner::batch::{parse_points, DesignTable};
use sim_runner::{
    generate_batch, make_simulation, BatchOptions, ClassExecutable, MakeOptions,
    SimulationRequest, SimulationResult,
};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "simrunner",
    version,
    about = "Prepare cosmological N-body simulations for HPC clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate every artifact for one simulation request.
    Make {
        request: PathBuf,
        #[arg(long)]
        build: bool,
        #[arg(long, default_value_t = 0.05)]
        pk_accuracy: f64,
        #[arg(long)]
        json: bool,
    },
    /// Validate a request and show what would be generated.
    Describe {
        request: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List known clusters and their defaults.
    Clusters {
        #[arg(long)]
        json: bool,
    },
    /// Write request files and generator-job scripts for a design.
    GenSubmit {
        #[arg(long)]
        design: PathBuf,
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        points: Option<String>,
        #[arg(long, default_value = "data/cosmo")]
        outdir_base: String,
        #[arg(long, default_value = "gen")]
        submit_base: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
        #[arg(long, default_value = "simrunner")]
        runner: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("simrunner=info,sim_runner=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Make {
            request,
            build,
            pk_accuracy,
            json,
        } => {
            let req = SimulationRequest::load(&request)?;
            let mut descriptor = req.descriptor()?;
            let solver = ClassExecutable::new(&req.paths.class_binary);
            let opts = MakeOptions {
                do_build: build,
                pk_accuracy,
                checker: req.checker_path(),
            };
            let result = make_simulation(&mut descriptor, &solver, &opts)?;
            if json {
                let mut payload = result_to_json(&result);
                payload["ok"] = json!(true);
                payload["command"] = json!("make");
                return Ok(Some(payload));
            }
            print_result(&result);
        }
        Commands::Describe { request, json } => {
            let req = SimulationRequest::load(&request)?;
            let descriptor = req.descriptor()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "cluster": descriptor.cluster().kind.name(),
                    "outdir": descriptor.outdir().display().to_string(),
                    "params": descriptor.params,
                    "derived": descriptor.derived,
                    "description": descriptor.describe(),
                })));
            }
            print!("{}", descriptor);
        }
        Commands::Clusters { json } => {
            let registry = ClusterRegistry::builtin();
            let mut rows = Vec::new();
            for name in registry.names() {
                let kind = registry.lookup(name)?;
                rows.push(cluster_to_json(kind));
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "clusters",
                    "clusters": rows,
                })));
            }
            for name in registry.names() {
                let kind = registry.lookup(name)?;
                let d = kind.defaults();
                println!(
                    "{:<9} {:<5} nproc={} cores={} timelimit={}h memory={}",
                    name,
                    format!("{:?}", kind.dialect()).to_lowercase(),
                    d.nproc,
                    d.cores,
                    d.timelimit,
                    d.memory
                );
            }
        }
        Commands::GenSubmit {
            design,
            request,
            points,
            outdir_base,
            submit_base,
            out,
            runner,
            json,
        } => {
            let table = DesignTable::load(&design)?;
            let base = SimulationRequest::load(&request)?;
            let points = match points {
                Some(raw) => Some(parse_points(&raw)?),
                None => None,
            };
            let opts = BatchOptions {
                points,
                outdir_base,
                submit_base,
                dest: out,
                runner,
            };
            let entries = generate_batch(&table, &base, &opts)?;
            if json {
                let rows: Vec<Value> = entries
                    .iter()
                    .map(|e| {
                        json!({
                            "index": e.index,
                            "outdir": e.outdir,
                            "request": e.request.display().to_string(),
                            "submit": e.submit.display().to_string(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "gen-submit",
                    "entries": rows,
                })));
            }
            for e in &entries {
                println!("{:04} {}", e.index, e.submit.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<SimError>() {
        Some(SimError::InvalidParameter { .. }) => "invalid_parameter",
        Some(SimError::ExternalProcessFailure { .. }) => "external_process_failure",
        Some(SimError::ConsistencyFailure(_)) => "consistency_failure",
        Some(SimError::MissingArtifact(_)) => "missing_artifact",
        Some(SimError::UnknownCluster(_)) => "unknown_cluster",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Make { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Clusters { json }
        | Commands::GenSubmit { json, .. } => *json,
    }
}

fn cluster_to_json(kind: ClusterKind) -> Value {
    let d = kind.defaults();
    json!({
        "name": kind.name(),
        "display_name": kind.display_name(),
        "dialect": kind.dialect(),
        "nproc": d.nproc,
        "cores": d.cores,
        "mpi_ranks": d.mpi_ranks,
        "threads": d.threads,
        "timelimit_hours": d.timelimit,
        "memory": d.memory,
        "node_policy": d.policy,
    })
}

fn result_to_json(result: &SimulationResult) -> Value {
    json!({
        "outdir": result.outdir.display().to_string(),
        "linear_dir": result.linear_dir.display().to_string(),
        "genic_param": result.genic_param.display().to_string(),
        "ic_path": result.ic_path,
        "compiler_options": result.compiler_options.display().to_string(),
        "gadget_param": result.gadget_param.display().to_string(),
        "scripts": {
            "one": result.scripts.one.display().to_string(),
            "genic": result.scripts.genic.display().to_string(),
            "nbody": result.scripts.nbody.display().to_string(),
        },
        "rebuilt_binary": result.rebuilt_binary.as_ref().map(|p| p.display().to_string()),
        "snapshot": result.snapshot.display().to_string(),
    })
}

fn print_result(result: &SimulationResult) {
    println!("outdir: {}", result.outdir.display());
    println!("linear_tables: {}", result.linear_dir.display());
    println!("genic_param: {}", result.genic_param.display());
    println!("ic_path: {}", result.ic_path);
    println!("compiler_options: {}", result.compiler_options.display());
    println!("gadget_param: {}", result.gadget_param.display());
    println!("submit: {}", result.scripts.one.display());
    if let Some(binary) = &result.rebuilt_binary {
        println!("rebuilt_binary: {}", binary.display());
    }
    println!("snapshot: {}", result.snapshot.display());
}
