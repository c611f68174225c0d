use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::{parse_manifests, ManifestLimits, Reconciler, RetryPolicy};
use keel_core::{Deadline, DeploymentPlan};
use keel_deploy::{DeployOptions, DeployReport, Orchestrator, VerificationOutcome, VerificationSpec};
use keel_kubehub::{ControlPlane, KubeControlPlane};
use keel_probe::{Method, ProbePolicy, ProbeRequest, ResponseShape};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel: ordered, idempotent application deploys")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for manifests that do not set one
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Reject manifest files larger than this
    #[arg(long = "max-yaml-bytes", global = true, env = "KEEL_MAX_YAML_BYTES", default_value_t = 1_000_000)]
    max_yaml_bytes: usize,

    /// Reject manifest documents with more JSON nodes than this
    #[arg(long = "max-yaml-nodes", global = true, env = "KEEL_MAX_YAML_NODES", default_value_t = 100_000)]
    max_yaml_nodes: usize,

    /// Field manager recorded on writes
    #[arg(long = "field-manager", global = true, env = "KEEL_FIELD_MANAGER", default_value = "keel")]
    field_manager: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ProbeMethod { Get, Post }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the dependency-ordered plan for a manifest file
    Plan {
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Reconcile every object in order without readiness or verification
    Reconcile {
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Overall time budget
        #[arg(long = "deadline-secs", env = "KEEL_DEADLINE_SECS", default_value_t = 300)]
        deadline_secs: u64,
    },
    /// Reconcile, wait for readiness, then verify the application answers
    Deploy {
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Overall time budget shared by every step
        #[arg(long = "deadline-secs", env = "KEEL_DEADLINE_SECS", default_value_t = 600)]
        deadline_secs: u64,
        /// Readiness poll interval
        #[arg(long = "poll-ms", env = "KEEL_POLL_MS", default_value_t = 2000)]
        poll_ms: u64,
        /// Probe this base URL instead of the Ingress/Route host
        #[arg(long = "probe-url", env = "KEEL_PROBE_URL")]
        probe_url: Option<String>,
        /// Request path; verification is skipped when unset
        #[arg(long = "probe-path", env = "KEEL_PROBE_PATH")]
        probe_path: Option<String>,
        #[arg(long = "probe-method", value_enum, default_value_t = ProbeMethod::Get)]
        probe_method: ProbeMethod,
        /// JSON request body
        #[arg(long = "probe-body")]
        probe_body: Option<String>,
        /// JSON pointer that must be present in the response (repeatable)
        #[arg(long = "expect-field")]
        expect_field: Vec<String>,
        /// JSON pointer that must hold a non-empty array, e.g. /choices
        #[arg(long = "expect-array")]
        expect_array: Option<String>,
        /// Transport-level attempts for the probe
        #[arg(long = "probe-attempts", env = "KEEL_PROBE_ATTEMPTS", default_value_t = 3)]
        probe_attempts: u32,
        /// Skip TLS certificate validation for the probe (self-signed local clusters)
        #[arg(long = "insecure", action = ArgAction::SetTrue)]
        insecure: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_plan(cli: &Cli, file: &str) -> Result<DeploymentPlan> {
    let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let limits = ManifestLimits { max_bytes: cli.max_yaml_bytes, max_nodes: cli.max_yaml_nodes };
    let descriptors = parse_manifests(&yaml, cli.namespace.as_deref(), &limits)?;
    Ok(DeploymentPlan::new(descriptors)?)
}

/// Deadline that is also cancelled by Ctrl-C.
fn deadline_with_interrupt(secs: u64) -> Deadline {
    let deadline = Deadline::after(Duration::from_secs(secs));
    let handle = deadline.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling run");
            handle.cancel();
        }
    });
    deadline
}

async fn control_plane(cli: &Cli) -> Result<Arc<dyn ControlPlane>> {
    let cp = KubeControlPlane::try_default().await?.with_field_manager(&cli.field_manager);
    Ok(Arc::new(cp))
}

fn verification_from_flags(
    probe_url: Option<String>,
    probe_path: Option<String>,
    method: ProbeMethod,
    body: Option<String>,
    expect_field: Vec<String>,
    expect_array: Option<String>,
    insecure: bool,
) -> Result<Option<VerificationSpec>> {
    let Some(path) = probe_path.or_else(|| probe_url.as_ref().map(|_| "/".to_string())) else {
        return Ok(None);
    };
    let body: Option<serde_json::Value> = body.map(|b| serde_json::from_str(&b).context("parsing --probe-body as JSON")).transpose()?;
    let expect = match (expect_array, expect_field.is_empty()) {
        (Some(ptr), _) => ResponseShape::NonEmptyArray(ptr),
        (None, false) => ResponseShape::JsonFields(expect_field),
        (None, true) if body.is_some() => ResponseShape::Json,
        (None, true) => ResponseShape::Any,
    };
    let request = ProbeRequest {
        method: match method { ProbeMethod::Get => Method::Get, ProbeMethod::Post => Method::Post },
        path,
        body,
        headers: Vec::new(),
        expect,
    };
    let spec = match probe_url {
        Some(url) => VerificationSpec::url(&url, request),
        None => VerificationSpec::from_exposure(request),
    };
    Ok(Some(spec.insecure(insecure)))
}

fn print_report(output: Output, report: &DeployReport) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            println!("run {}", report.run_id);
            for s in &report.steps {
                println!("  {:<14} {:<40} {:<9} +{} ~{} -{}", s.stage.to_string(), s.reference.to_string(), s.action.as_str(), s.summary.adds, s.summary.updates, s.summary.removes);
            }
            for g in &report.gates {
                let mark = if g.passed { "ok" } else { "FAILED" };
                println!("  {:<14} {:<40} {:<9} {}", "Readiness", g.reference.to_string(), mark, g.observed.as_deref().unwrap_or("-"));
            }
            match &report.verification {
                VerificationOutcome::Ran(r) => {
                    let mark = if r.success { "ok" } else { "FAILED" };
                    println!("  {:<14} {:<40} {:<9} {}", "Verification", r.url, mark, r.status.map(|c| c.to_string()).unwrap_or_else(|| "-".into()));
                }
                VerificationOutcome::Skipped => println!("  {:<14} {:<40} skipped", "Verification", "-"),
                VerificationOutcome::NotRun => {}
            }
            println!("{}", report.summary());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Plan { file } => {
            let plan = load_plan(&cli, file)?;
            match cli.output {
                Output::Human => {
                    for (i, step) in plan.iter().enumerate() {
                        let deps = plan.dependencies_of(i);
                        println!("{:>3}  {:<14} {:<40} deps={:?}", i, step.kind().stage().to_string(), step.reference.to_string(), deps);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
        }
        Commands::Reconcile { file, deadline_secs } => {
            let plan = load_plan(&cli, file)?;
            let deadline = deadline_with_interrupt(*deadline_secs);
            let reconciler = Reconciler::new(control_plane(&cli).await?).with_policy(RetryPolicy::default());
            let mut done = Vec::new();
            for step in &plan {
                match reconciler.reconcile(step, &deadline).await {
                    Ok(r) => {
                        if cli.output == Output::Human {
                            println!("{:<40} {}", r.reference.to_string(), r.action.as_str());
                        }
                        done.push(r);
                    }
                    Err(e) => {
                        if cli.output == Output::Json {
                            println!("{}", serde_json::to_string_pretty(&done)?);
                        }
                        return Err(anyhow!("{}: {}", step.reference, e));
                    }
                }
            }
            if cli.output == Output::Json {
                println!("{}", serde_json::to_string_pretty(&done)?);
            }
            info!(resources = done.len(), "reconcile finished");
        }
        Commands::Deploy {
            file,
            deadline_secs,
            poll_ms,
            probe_url,
            probe_path,
            probe_method,
            probe_body,
            expect_field,
            expect_array,
            probe_attempts,
            insecure,
        } => {
            let plan = load_plan(&cli, file)?;
            let verification = verification_from_flags(
                probe_url.clone(),
                probe_path.clone(),
                *probe_method,
                probe_body.clone(),
                expect_field.clone(),
                expect_array.clone(),
                *insecure,
            )?;
            let opts = DeployOptions {
                retry: RetryPolicy::default(),
                poll_interval: Duration::from_millis(*poll_ms),
                probe: ProbePolicy { max_attempts: *probe_attempts, ..ProbePolicy::default() },
            };
            let deadline = deadline_with_interrupt(*deadline_secs);
            let orch = Orchestrator::new(control_plane(&cli).await?, opts);
            let report = orch.deploy(&plan, verification.as_ref(), &deadline).await;
            print_report(cli.output, &report)?;
            if !report.is_complete() {
                return Err(anyhow!("deploy {} did not complete", report.run_id));
            }
        }
    }
    Ok(())
}
