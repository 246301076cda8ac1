//! admission-sim: 通过模拟厂商驱动准入管线并输出信号快照
//!
//! Usage:
//!   admission-sim [--config <yaml>] [--requests N] [--tenants N] [--fail-rate F]
//!
//! Submits `N` requests spread over `--tenants` tenants against a simulated
//! provider that fails a `--fail-rate` fraction of calls, then prints the
//! outcome tally, gateway signals and provider health as JSON.

use ai_lib_admission::provider::{InvokeResult, ProviderInvoker, ProviderRequest, ProviderResponse, RawError};
use ai_lib_admission::telemetry::{CompositeMetricsSink, InMemoryMetricsSink, TracingMetricsSink};
use ai_lib_admission::{GatewayBuilder, GatewayConfig, SubmitRequest};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Args {
    config: Option<String>,
    requests: usize,
    tenants: usize,
    fail_rate: f64,
}

fn print_usage() {
    println!(
        r#"admission-sim: drive the admission pipeline with a simulated provider

USAGE:
    admission-sim [OPTIONS]

OPTIONS:
    --config <path>     Gateway config (YAML); AI_ADMISSION_* overrides still apply
    --requests <N>      Requests to submit (default 200)
    --tenants <N>       Distinct tenants (default 3)
    --fail-rate <F>     Fraction of provider calls that fail, 0.0..=1.0 (default 0.1)
    --help              Show this help message"#
    );
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config: None,
        requests: 200,
        tenants: 3,
        fail_rate: 0.1,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().with_context(|| format!("missing value for {}", arg));
        match arg.as_str() {
            "--config" => args.config = Some(value()?),
            "--requests" => args.requests = value()?.parse().context("--requests")?,
            "--tenants" => args.tenants = value()?.parse().context("--tenants")?,
            "--fail-rate" => args.fail_rate = value()?.parse().context("--fail-rate")?,
            "--help" | "-h" => return Ok(None),
            other => bail!("unknown argument: {}", other),
        }
    }
    if !(0.0..=1.0).contains(&args.fail_rate) {
        bail!("--fail-rate must be within 0.0..=1.0");
    }
    args.tenants = args.tenants.max(1);
    Ok(Some(args))
}

/// Answers after a short delay; failures are spread evenly at `fail_rate`.
struct SimulatedProvider {
    calls: AtomicU64,
    fail_rate: f64,
}

#[async_trait]
impl ProviderInvoker for SimulatedProvider {
    async fn invoke(&self, request: ProviderRequest) -> InvokeResult {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) as f64;
        tokio::time::sleep(Duration::from_millis(5)).await;
        if ((n + 1.0) * self.fail_rate).floor() > (n * self.fail_rate).floor() {
            return Err(RawError::http(503, "simulated outage"));
        }
        Ok(ProviderResponse::new(serde_json::json!({
            "model": request.model,
            "echo": request.payload,
        })))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args()? else {
        print_usage();
        return Ok(());
    };

    let config = match &args.config {
        Some(path) => GatewayConfig::from_yaml_file(path)?,
        None => GatewayConfig::default(),
    }
    .apply_env()?;

    let provider = Arc::new(SimulatedProvider {
        calls: AtomicU64::new(0),
        fail_rate: args.fail_rate,
    });
    let metrics = Arc::new(InMemoryMetricsSink::new(10_000));
    let sink = CompositeMetricsSink::new()
        .add_sink(metrics.clone())
        .add_sink(Arc::new(TracingMetricsSink));
    let gateway = GatewayBuilder::new(provider.clone())
        .config(config)
        .metrics_sink(Arc::new(sink))
        .build()?;

    let mut tasks = Vec::with_capacity(args.requests);
    for i in 0..args.requests {
        let gw = gateway.clone();
        let tenant = format!("tenant-{}", i % args.tenants);
        // a small payload space so cache hits and dedup show up
        let payload = serde_json::json!({"prompt": format!("question {}", i % 25)});
        tasks.push(tokio::spawn(async move {
            gw.submit(
                SubmitRequest::new(tenant, "sim/model-1", payload)
                    .with_param("temperature", 0)
                    .with_timeout(Duration::from_secs(5)),
            )
            .await
        }));
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for t in tasks {
        let code = match t.await? {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        *outcomes.entry(code).or_insert(0) += 1;
    }

    let report = serde_json::json!({
        "requests": args.requests,
        "provider_calls": provider.calls.load(Ordering::Relaxed),
        "outcomes": outcomes,
        "metrics": metrics
            .counts()
            .into_iter()
            .map(|(event, n)| (event.name(), n))
            .collect::<BTreeMap<_, _>>(),
        "signals": gateway.signals(),
        "health": gateway.provider_health(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
