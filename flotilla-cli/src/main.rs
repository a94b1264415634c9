use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flotilla_core::{
    Capabilities, EnergyMode, ErrorKind, Job, JobPriority, Node, OrchestratorError, Requirements,
    SlaTier, Specialization, Tenant,
};

mod config;
mod state;

#[derive(Parser, Debug)]
#[command(name = "flotilla", version, about = "Multi-tenant fleet orchestrator CLI")]
struct Cli {
    /// Orchestrator config file (default: ~/.flotilla/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State directory (default: ~/.flotilla/state)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config.toml
    ConfigInit,

    /// Register a tenant with SLA shares
    AddTenant {
        id: String,

        #[arg(long)]
        name: String,

        /// premium | standard | basic
        #[arg(long, default_value = "standard")]
        tier: String,

        /// Guaranteed share of online capacity, percent
        #[arg(long, default_value_t = 0.0)]
        guaranteed: f64,

        /// Usage cap including borrowed capacity, percent
        #[arg(long, default_value_t = 100.0)]
        max: f64,
    },

    /// Register a worker node
    AddNode {
        id: String,

        #[arg(long)]
        name: String,

        #[arg(long, default_value_t = 16)]
        cpu_cores: u32,

        #[arg(long, default_value_t = 64)]
        memory_gb: u32,

        #[arg(long, default_value_t = 0)]
        gpu_count: u32,

        #[arg(long)]
        gpu_model: Option<String>,

        #[arg(long, default_value_t = 500)]
        storage_gb: u32,

        /// Comma-separated: render,sim,ml,batch,interactive
        #[arg(long)]
        specializations: Option<String>,

        /// Estimated full-load draw in watts
        #[arg(long, default_value_t = 400.0)]
        power_watts: f64,
    },

    /// Submit a job for a tenant
    SubmitJob {
        /// Job id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        name: String,

        /// Workload class, keys node performance history
        #[arg(long, default_value = "batch")]
        kind: String,

        /// critical | high | medium | low
        #[arg(long, default_value = "medium")]
        priority: String,

        /// RFC3339, or "YYYY-MM-DD HH:MM" in --tz
        #[arg(long)]
        deadline: String,

        /// Timezone for non-RFC3339 deadlines
        #[arg(long, default_value = "UTC")]
        tz: String,

        #[arg(long, default_value_t = 1.0)]
        duration_hours: f64,

        #[arg(long, default_value_t = 0)]
        cpu_cores: u32,

        #[arg(long, default_value_t = 0)]
        memory_gb: u32,

        #[arg(long, default_value_t = 0)]
        gpu_count: u32,

        #[arg(long, default_value_t = 0)]
        storage_gb: u32,

        /// Comma-separated specialization affinities
        #[arg(long)]
        specializations: Option<String>,

        /// Job ids that must complete first (comma-separated)
        #[arg(long)]
        depends_on: Option<String>,

        /// Job emits intermediate artifacts worth checkpointing eagerly
        #[arg(long)]
        progressive: bool,
    },

    /// Request cancellation of a job
    CancelJob { id: String },

    /// Change a job's priority (never preempts a running job)
    SetPriority {
        id: String,

        /// critical | high | medium | low
        priority: String,
    },

    /// Switch the fleet energy mode
    SetEnergyMode {
        /// performance | balanced | efficiency
        mode: String,
    },

    /// Run scheduling cycles
    RunCycle {
        /// Number of cycles to run back to back
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Keep cycling at the configured interval until interrupted
        #[arg(long)]
        follow: bool,
    },

    /// Feed a JSON-lines agent event stream (file, or - for stdin)
    Ingest { path: PathBuf },

    /// Show fleet status, or one job with --job
    Status {
        #[arg(long)]
        job: Option<String>,
    },

    /// Print audit events, newest last
    Audit {
        /// Only this event kind
        #[arg(long)]
        kind: Option<String>,

        /// Only events touching this subject (e.g. job:j1)
        #[arg(long)]
        subject: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

/// Exit codes: 0 ok, 2 invalid input, 3 not found, 4 invariant violation,
/// 5 backend failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(core_err) = err.downcast_ref::<OrchestratorError>() {
        return match core_err.kind() {
            ErrorKind::Validation | ErrorKind::Cancelled => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::Invariant => 4,
            ErrorKind::Transient | ErrorKind::Backend => 5,
        };
    }
    if err.downcast_ref::<flotilla_store::StoreError>().is_some() {
        return 5;
    }
    2
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    let data_dir = cli.data_dir.clone().unwrap_or_else(config::default_data_dir);

    if let Command::ConfigInit = cli.command {
        let path = cli.config.clone().unwrap_or_else(config::default_config_path);
        config::write_default_config(&path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let orchestrator_config = config::load_config(config_path)?;
    let cycle_interval = orchestrator_config.cycle_interval_seconds;
    let mut orc = state::load(&data_dir, orchestrator_config)?;
    let now = Utc::now();

    match cli.command {
        Command::ConfigInit => unreachable!("handled above"),

        Command::AddTenant { id, name, tier, guaranteed, max } => {
            let tenant = Tenant::new(&id, name)
                .with_tier(parse_tier(&tier)?)
                .with_shares(guaranteed, max);
            orc.add_tenant(tenant, now)?;
            println!("tenant {id} added ({guaranteed}% guaranteed, {max}% max)");
        }

        Command::AddNode {
            id,
            name,
            cpu_cores,
            memory_gb,
            gpu_count,
            gpu_model,
            storage_gb,
            specializations,
            power_watts,
        } => {
            let capabilities = Capabilities {
                cpu_cores,
                memory_gb,
                gpu_count,
                gpu_model,
                storage_gb,
                specializations: parse_specializations(specializations.as_deref())?,
            };
            let node = Node::new(&id, name)
                .with_capabilities(capabilities)
                .with_power_draw(power_watts);
            orc.add_node(node, now)?;
            println!("node {id} added");
        }

        Command::SubmitJob {
            id,
            tenant,
            name,
            kind,
            priority,
            deadline,
            tz,
            duration_hours,
            cpu_cores,
            memory_gb,
            gpu_count,
            storage_gb,
            specializations,
            depends_on,
            progressive,
        } => {
            let deadline = flotilla_core::parse_deadline(&deadline, &tz)
                .map_err(|e| OrchestratorError::Validation(format!("{e:#}")))?;
            let id = id.unwrap_or_else(|| format!("job-{}", now.timestamp_millis()));
            let requirements = Requirements {
                cpu_cores,
                memory_gb,
                gpu_count,
                storage_gb,
                specializations: parse_specializations(specializations.as_deref())?,
            };
            let mut job = Job::new(&id, tenant, name, deadline, now)
                .with_kind(kind)
                .with_priority(parse_priority(&priority)?)
                .with_duration_hours(duration_hours)
                .with_requirements(requirements)
                .with_dependencies(parse_list(depends_on.as_deref()));
            if progressive {
                job = job.with_progressive_output();
            }
            orc.submit_job(job, now)?;
            println!("job {id} submitted");
        }

        Command::CancelJob { id } => {
            orc.cancel_job(&id, now)?;
            println!("cancellation requested for {id}");
        }

        Command::SetPriority { id, priority } => {
            orc.set_job_priority(&id, parse_priority(&priority)?, now)?;
            println!("priority of {id} set to {priority}");
        }

        Command::SetEnergyMode { mode } => {
            orc.set_energy_mode(parse_energy_mode(&mode)?, now);
            println!("energy mode set to {mode}");
        }

        Command::RunCycle { count, follow } => {
            if follow {
                loop {
                    let report = orc.run_cycle(Utc::now())?;
                    print_report(&report);
                    state::save(&data_dir, &orc)?;
                    tokio::time::sleep(std::time::Duration::from_secs(cycle_interval)).await;
                }
            }
            for _ in 0..count {
                let report = orc.run_cycle(Utc::now())?;
                print_report(&report);
            }
        }

        Command::Ingest { path } => {
            let raw = if path.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("reading stdin")?
            } else {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?
            };
            let parsed = flotilla_telemetry::parse_stream(&raw);
            for (line, reason) in &parsed.skipped {
                eprintln!("line {line}: skipped: {reason}");
            }
            let mut accepted = 0usize;
            for event in parsed.events {
                match orc.ingest(event) {
                    Ok(()) => accepted += 1,
                    Err(err) => eprintln!("event rejected: {err}"),
                }
            }
            println!("ingested {accepted} events ({} skipped)", parsed.skipped.len());
        }

        Command::Status { job } => match job {
            Some(job_id) => {
                let view = orc.job_status(&job_id, now)?;
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
            None => {
                let view = orc.fleet_status();
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
        },

        Command::Audit { kind, subject, limit } => {
            let filter = flotilla_core::AuditFilter { kind, subject, since_seq: None };
            let events: Vec<_> = orc.audit().query(filter).collect();
            let start = events.len().saturating_sub(limit);
            for event in &events[start..] {
                println!(
                    "{} {:>5} {:<24} {} {}",
                    event.ts.format("%Y-%m-%d %H:%M:%S"),
                    event.seq,
                    event.kind,
                    event.subject_refs.join(","),
                    event.payload
                );
            }
        }
    }

    state::save(&data_dir, &orc)?;
    Ok(())
}

fn print_report(report: &flotilla_core::CycleReport) {
    println!(
        "cycle: {} scheduled, {} deferred, {} rerouted, utilization {:.1}%, est. savings {:.1}%{}",
        report.jobs_scheduled,
        report.jobs_deferred,
        report.jobs_rerouted,
        report.utilization_percentage,
        report.estimated_energy_savings_percentage,
        if report.under_capacity { " (under capacity)" } else { "" },
    );
    if !report.stragglers.is_empty() {
        println!("  stragglers: {}", report.stragglers.join(", "));
    }
}

fn parse_tier(s: &str) -> Result<SlaTier> {
    match s.to_lowercase().as_str() {
        "premium" => Ok(SlaTier::Premium),
        "standard" => Ok(SlaTier::Standard),
        "basic" => Ok(SlaTier::Basic),
        other => Err(OrchestratorError::Validation(format!("unknown tier: {other}")).into()),
    }
}

fn parse_priority(s: &str) -> Result<JobPriority> {
    match s.to_lowercase().as_str() {
        "critical" => Ok(JobPriority::Critical),
        "high" => Ok(JobPriority::High),
        "medium" => Ok(JobPriority::Medium),
        "low" => Ok(JobPriority::Low),
        other => Err(OrchestratorError::Validation(format!("unknown priority: {other}")).into()),
    }
}

fn parse_energy_mode(s: &str) -> Result<EnergyMode> {
    match s.to_lowercase().as_str() {
        "performance" => Ok(EnergyMode::Performance),
        "balanced" => Ok(EnergyMode::Balanced),
        "efficiency" => Ok(EnergyMode::Efficiency),
        other => Err(OrchestratorError::Validation(format!("unknown energy mode: {other}")).into()),
    }
}

fn parse_specialization(s: &str) -> Result<Specialization> {
    match s.to_lowercase().as_str() {
        "render" => Ok(Specialization::Render),
        "sim" => Ok(Specialization::Sim),
        "ml" => Ok(Specialization::Ml),
        "batch" => Ok(Specialization::Batch),
        "interactive" => Ok(Specialization::Interactive),
        other => {
            Err(OrchestratorError::Validation(format!("unknown specialization: {other}")).into())
        }
    }
}

fn parse_specializations(
    s: Option<&str>,
) -> Result<std::collections::BTreeSet<Specialization>> {
    let mut out = std::collections::BTreeSet::new();
    for token in parse_list(s) {
        out.insert(parse_specialization(&token)?);
    }
    Ok(out)
}

fn parse_list(s: Option<&str>) -> Vec<String> {
    s.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
