use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use kiln_core::{config_schema_json, load_effective_config, write_schema_file, Config};
use kiln_supervisor::{
    BackendExit, BackendLauncher, BackendProcess, ConnectionSupervisor, ProcessLauncher,
    SupervisorError, SupervisorOptions,
};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Kiln image generation front-end")]
struct Cli {
    /// Seconds to wait for each backend reply
    #[arg(long, global = true, default_value_t = 120)]
    timeout_secs: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Invoke any backend method with optional JSON params
    Call {
        method: String,
        /// Params object, e.g. '{"id":"..."}'
        params: Option<String>,
    },
    /// Queue an image generation job
    Submit(SubmitArgs),
    /// Show one job
    Status { id: String },
    /// Cancel a queued or running job
    Cancel { id: String },
    /// List tracked jobs
    Jobs,
    /// List backend methods
    Tools,
    /// List scenes on the visual client
    Scenes,
    /// Generation service and bridge health
    Health,
    /// Ask the backend to exit
    Stop,
    /// Print the configuration JSON schema, or write it to `--out`
    ConfigSchema {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[arg(long)]
    prompt: String,
    /// small | medium | large
    #[arg(long, default_value = "medium")]
    size: String,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    negative_prompt: Option<String>,
}

impl SubmitArgs {
    fn params(&self) -> Value {
        let mut params = Map::new();
        params.insert("prompt".into(), json!(self.prompt));
        params.insert("size".into(), json!(self.size));
        if let Some(steps) = self.steps {
            params.insert("steps".into(), json!(steps));
        }
        if let Some(seed) = self.seed {
            params.insert("seed".into(), json!(seed));
        }
        if let Some(negative) = &self.negative_prompt {
            params.insert("negative_prompt".into(), json!(negative));
        }
        Value::Object(params)
    }
}

impl Commands {
    /// Backend method and params, `None` for commands handled locally.
    fn request(&self) -> Result<Option<(String, Option<Value>)>> {
        let req = match self {
            Commands::Call { method, params } => {
                let params = params
                    .as_deref()
                    .map(serde_json::from_str::<Value>)
                    .transpose()
                    .context("params must be valid JSON")?;
                (method.clone(), params)
            }
            Commands::Submit(args) => ("submit_job".into(), Some(args.params())),
            Commands::Status { id } => ("job_status".into(), Some(json!({ "id": id }))),
            Commands::Cancel { id } => ("cancel_job".into(), Some(json!({ "id": id }))),
            Commands::Jobs => ("list_jobs".into(), None),
            Commands::Tools => ("list_tools".into(), None),
            Commands::Scenes => ("list_scenes".into(), None),
            Commands::Health => ("service_status".into(), None),
            Commands::Stop | Commands::ConfigSchema { .. } => return Ok(None),
        };
        Ok(Some(req))
    }
}

/// Stands in when no backend executable can be found, so an already
/// running backend is still usable.
struct MissingBackend;

#[async_trait]
impl BackendLauncher for MissingBackend {
    async fn launch(&self) -> Result<BackendProcess, SupervisorError> {
        Err(SupervisorError::BackendNotFound)
    }
}

fn launcher_for(config: &Config) -> Arc<dyn BackendLauncher> {
    match ProcessLauncher::locate(config.backend.binary.as_deref()) {
        Ok(launcher) => {
            debug!(target: "kiln::cli", program = %launcher.program().display(), "backend executable");
            Arc::new(launcher.with_env("KILN_IPC_PORT", config.ipc.port.to_string()))
        }
        Err(err) => {
            debug!(target: "kiln::cli", error = %err, "no backend executable; connect only");
            Arc::new(MissingBackend)
        }
    }
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn is_fatal_startup(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SupervisorError>(),
        Some(SupervisorError::FatalStartup { .. })
    )
}

async fn execute(supervisor: &ConnectionSupervisor, cli: &Cli) -> Result<()> {
    let timeout = Duration::from_secs(cli.timeout_secs.max(1));
    if matches!(cli.command, Commands::Stop) {
        let acknowledged = supervisor.stop_backend(timeout).await?;
        print_json(&json!({ "stopped": acknowledged }));
        return Ok(());
    }
    let Some((method, params)) = cli.command.request()? else {
        return Ok(());
    };
    let result = supervisor.send_with_timeout(&method, params, timeout).await?;
    print_json(&result);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::ConfigSchema { out } = &cli.command {
        match out {
            Some(path) => write_schema_file(path)
                .with_context(|| format!("writing schema to {}", path.display()))?,
            None => print_json(&config_schema_json()?),
        }
        return Ok(());
    }
    let config = load_effective_config().context("loading configuration")?;
    let supervisor = ConnectionSupervisor::new(
        SupervisorOptions::from_config(&config),
        launcher_for(&config),
    );
    tokio::select! {
        exit = supervisor.fatal_exit() => fatal_startup(exit),
        res = execute(&supervisor, &cli) => match (res, supervisor.fatal()) {
            // the command failed because the spawned backend bowed out
            (Err(_), Some(exit)) => fatal_startup(exit),
            (res, _) => res,
        },
    }
}

fn fatal_startup(exit: BackendExit) -> Result<()> {
    warn!(target: "kiln::cli", ?exit, "backend refused to start; another instance owns its resources");
    Err(SupervisorError::FatalStartup { exit }.into())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    kiln_otel::init_with_default("warn");
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if is_fatal_startup(&err) => {
            eprintln!("{err}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kiln").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn submit_builds_job_params() {
        let cli = parse(&["submit", "--prompt", "harbor at dusk", "--steps", "12", "--seed", "7"]);
        let (method, params) = cli.command.request().unwrap().unwrap();
        assert_eq!(method, "submit_job");
        assert_eq!(
            params.unwrap(),
            json!({"prompt": "harbor at dusk", "size": "medium", "steps": 12, "seed": 7})
        );
    }

    #[test]
    fn submit_requires_a_prompt() {
        let err = Cli::try_parse_from(["kiln", "submit", "--size", "large"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn job_commands_map_to_methods() {
        let cases = [
            (vec!["status", "j-1"], "job_status"),
            (vec!["cancel", "j-1"], "cancel_job"),
            (vec!["jobs"], "list_jobs"),
            (vec!["tools"], "list_tools"),
            (vec!["scenes"], "list_scenes"),
            (vec!["health"], "service_status"),
        ];
        for (args, expected) in cases {
            let (method, params) = parse(&args).command.request().unwrap().unwrap();
            assert_eq!(method, expected);
            if args.len() == 2 {
                assert_eq!(params.unwrap()["id"], "j-1");
            }
        }
    }

    #[test]
    fn call_parses_json_params() {
        let cli = parse(&["call", "job_status", r#"{"id":"abc"}"#]);
        let (method, params) = cli.command.request().unwrap().unwrap();
        assert_eq!(method, "job_status");
        assert_eq!(params.unwrap()["id"], "abc");

        let bad = parse(&["call", "ping", "{not json"]);
        assert!(bad.command.request().is_err());

        let bare = parse(&["call", "ping"]);
        assert_eq!(bare.command.request().unwrap().unwrap().1, None);
    }

    #[test]
    fn local_commands_send_nothing() {
        assert!(parse(&["stop"]).command.request().unwrap().is_none());
        assert!(parse(&["config-schema"]).command.request().unwrap().is_none());
    }

    #[test]
    fn config_schema_accepts_an_output_path() {
        let cli = parse(&["config-schema", "--out", "/tmp/kiln.schema.json"]);
        assert!(matches!(
            cli.command,
            Commands::ConfigSchema { out: Some(ref p) } if p == std::path::Path::new("/tmp/kiln.schema.json")
        ));
        assert!(matches!(
            parse(&["config-schema"]).command,
            Commands::ConfigSchema { out: None }
        ));
    }

    #[tokio::test]
    async fn config_schema_is_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let cli = parse(&["config-schema", "--out", path.to_str().unwrap()]);
        run(cli).await.unwrap();
        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written["properties"]["bridge"].is_object());
    }

    #[test]
    fn global_timeout_flag_is_accepted_after_subcommand() {
        let cli = parse(&["jobs", "--timeout-secs", "5"]);
        assert_eq!(cli.timeout_secs, 5);
    }

    #[test]
    fn fatal_startup_is_recognised_through_anyhow() {
        let exit = BackendExit {
            code: Some(0),
            killed_by_us: false,
        };
        let err: anyhow::Error = SupervisorError::FatalStartup { exit }.into();
        assert!(is_fatal_startup(&err));
        let other: anyhow::Error = SupervisorError::ConnectionLost.into();
        assert!(!is_fatal_startup(&other));
    }

    /// Records the target of every event it sees.
    #[derive(Clone, Default)]
    struct Targets(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Targets {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0
                .lock()
                .unwrap()
                .push(event.metadata().target().to_string());
        }
    }

    #[test]
    fn log_events_use_the_cli_target() {
        use tracing_subscriber::layer::SubscriberExt;

        let targets = Targets::default();
        let subscriber = tracing_subscriber::registry().with(targets.clone());
        tracing::subscriber::with_default(subscriber, || {
            let _ = launcher_for(&Config::default());
        });
        let seen = targets.0.lock().unwrap();
        assert!(seen.iter().any(|t| t == "kiln::cli"), "targets: {seen:?}");
        assert!(!seen.iter().any(|t| t.starts_with("kiln_cli")), "targets: {seen:?}");
    }

    #[tokio::test]
    async fn missing_backend_reports_not_found() {
        let err = MissingBackend.launch().await.unwrap_err();
        assert!(matches!(err, SupervisorError::BackendNotFound));
    }
}
