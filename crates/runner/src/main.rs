mod cli;
mod constants;
mod server;
mod session;
mod shutdown;
mod ui;

use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tracing_subscriber::EnvFilter;

use ta_task_core::AnalysisRequest;
use ta_task_core::settings::{
    RunnerSettings, default_state_dir, load_settings, save_settings, settings_path,
};
use ta_task_engine::{
    HttpAnalysisEngine, Resolution, ResolutionSource, ServiceConfig, TaskService, TaskStatus,
    TaskView,
};

use crate::cli::{Cli, Command, ConfigArgs, HistoryArgs, RunArgs, StatusArgs};
use crate::constants::{DEFAULT_ENGINE_URL, POLL_INTERVAL};
use crate::session::{clear_pointer, load_pointer, save_pointer};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};
use crate::ui::{Ui, format_history_line, format_outcome, format_progress_line};

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TA_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn engine_url(cli: &Cli, settings: &RunnerSettings) -> anyhow::Result<Url> {
    if let Some(url) = &cli.engine_url {
        return Ok(url.clone());
    }
    let raw = settings.engine_url.as_deref().unwrap_or(DEFAULT_ENGINE_URL);
    Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid engine url {raw:?}: {e}"))
}

fn service_config(cli: &Cli, settings: &RunnerSettings, state_dir: &Path) -> ServiceConfig {
    let retention_hours = cli.retention_hours.or(settings.retention_hours);
    ServiceConfig {
        retention: retention_hours
            .filter(|h| *h > 0)
            .map(|h| Duration::from_secs(h.saturating_mul(3600))),
        max_running: cli.max_running.or(settings.max_running),
        ..ServiceConfig::persistent(state_dir)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = match load_settings() {
        Ok(Some(s)) => s,
        Ok(None) => RunnerSettings::default(),
        Err(err) => {
            tracing::warn!("failed to read runner settings: {err:#}");
            RunnerSettings::default()
        }
    };

    if let Command::Config(args) = &cli.command {
        config(&cli, settings, args)?;
        return Ok(ExitCode::SUCCESS);
    }

    let state_dir: PathBuf = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir()?,
    };

    let engine = HttpAnalysisEngine::new(engine_url(&cli, &settings)?)?;
    let service = TaskService::open(
        service_config(&cli, &settings, &state_dir),
        Arc::new(engine),
    )?;
    tracing::debug!(
        "task store at {} using tier {}",
        state_dir.display(),
        service.stats().active_tier
    );

    match &cli.command {
        Command::Run(args) => run(&service, &settings, &state_dir, args).await,
        Command::Status(args) => {
            status(&service, &state_dir, args)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::History(args) => {
            history(&service, args);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve(args) => {
            server::serve(service, args.bind).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config(_) => Ok(ExitCode::SUCCESS),
    }
}

/// Fold the given flags into `settings`. Returns whether anything changed.
fn apply_config(settings: &mut RunnerSettings, cli: &Cli, args: &ConfigArgs) -> bool {
    let before = settings.clone();
    if let Some(provider) = &args.provider {
        settings.model.llm_provider = provider.clone();
    }
    if let Some(model) = &args.deep_model {
        settings.model.deep_think_llm = model.clone();
    }
    if let Some(model) = &args.quick_model {
        settings.model.quick_think_llm = model.clone();
    }
    if let Some(url) = &cli.engine_url {
        settings.engine_url = Some(url.to_string());
    }
    if let Some(hours) = cli.retention_hours {
        settings.retention_hours = Some(hours);
    }
    if let Some(limit) = cli.max_running {
        settings.max_running = Some(limit);
    }
    *settings != before
}

fn config(cli: &Cli, mut settings: RunnerSettings, args: &ConfigArgs) -> anyhow::Result<()> {
    let path = settings_path()?;
    if apply_config(&mut settings, cli, args) {
        save_settings(&settings)?;
        println!("saved {}", path.display());
    } else {
        println!("{}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn build_request(settings: &RunnerSettings, args: &RunArgs) -> AnalysisRequest {
    let mut request = AnalysisRequest::new(
        args.symbol.clone(),
        args.date.clone(),
        args.analysts.clone(),
        args.depth,
    );
    request.model = settings.model.clone();
    if let Some(provider) = &args.provider {
        request.model.llm_provider = provider.clone();
    }
    if let Some(model) = &args.deep_model {
        request.model.deep_think_llm = model.clone();
    }
    if let Some(model) = &args.quick_model {
        request.model.quick_think_llm = model.clone();
    }
    request
}

async fn run(
    service: &TaskService,
    settings: &RunnerSettings,
    state_dir: &Path,
    args: &RunArgs,
) -> anyhow::Result<ExitCode> {
    let request = build_request(settings, args);
    let symbol = request.symbol.trim().to_ascii_uppercase();
    let task_id = service.start_task(request)?;
    if let Err(err) = save_pointer(state_dir, &task_id) {
        tracing::warn!("failed to save session pointer: {err:#}");
    }

    let tui_enabled = !args.no_tui && std::io::stdout().is_terminal();
    let mut ui = if tui_enabled {
        Some(Ui::new(&task_id, &symbol)?)
    } else {
        None
    };

    let startup = format!("ta-runner {} started {task_id}", env!("CARGO_PKG_VERSION"));
    match &ui {
        Some(ui) => ui.println(&startup),
        None => println!("{startup}"),
    }

    let view = watch(service, &task_id, &mut ui).await?;

    if let Some(ui) = &ui {
        ui.freeze();
    }
    let Some(view) = view else {
        // Dropping the runtime would block on the still-running worker.
        std::process::exit(130);
    };
    for line in format_outcome(&view) {
        println!("{line}");
    }
    Ok(exit_code(view.status))
}

fn exit_code(status: TaskStatus) -> ExitCode {
    match status {
        TaskStatus::Failed => ExitCode::FAILURE,
        TaskStatus::Running | TaskStatus::Completed => ExitCode::SUCCESS,
    }
}

/// Polls `task_id` until it reaches a terminal state. `None` means the user
/// asked to stop watching immediately.
async fn watch(
    service: &TaskService,
    task_id: &str,
    ui: &mut Option<Ui>,
) -> anyhow::Result<Option<TaskView>> {
    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_line = String::new();

    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        let msg = "Stop requested. The analysis keeps running until it finishes (press CTRL+C again to exit now).";
                        match ui {
                            Some(ui) => ui.set_stop_message(msg),
                            None => eprintln!("{msg}"),
                        }
                    }
                    Some(ShutdownEvent::Immediate) => {
                        match ui {
                            Some(ui) => ui.set_stop_message("Exiting. The analysis is abandoned."),
                            None => eprintln!("Exiting. The analysis is abandoned."),
                        }
                        return Ok(None);
                    }
                    None => {}
                }
            }
            _ = ticker.tick() => {
                let view = service.get_progress(task_id)?;
                match ui {
                    Some(ui) => ui.set_progress(&view),
                    None => {
                        let line = format_progress_line(&view);
                        if line != last_line {
                            println!("{line}");
                            last_line = line;
                        }
                    }
                }
                if view.status.is_terminal() {
                    return Ok(Some(view));
                }
            }
        }
    }
}

fn status(service: &TaskService, state_dir: &Path, args: &StatusArgs) -> anyhow::Result<()> {
    let pointer = args.task_id.clone().or_else(|| load_pointer(state_dir));
    let resolution = service.resolve_session(pointer.as_deref());

    let (view, source) = match &resolution {
        Resolution::Running { view, source } | Resolution::Finished { view, source } => {
            (view, *source)
        }
        Resolution::Cleared => {
            clear_pointer(state_dir)?;
            println!("no analysis to resume");
            return Ok(());
        }
    };

    if source == ResolutionSource::Latest {
        match &pointer {
            Some(stale) => println!("{stale} is no longer known; showing the latest analysis"),
            None => println!("no saved session; showing the latest analysis"),
        }
    }
    save_pointer(state_dir, &view.task_id)?;

    for line in format_outcome(view) {
        println!("{line}");
    }
    if args.raw {
        match service.raw_output(&view.task_id)? {
            Some(raw) => println!("{}", serde_json::to_string_pretty(&raw)?),
            None => println!("no raw output retained"),
        }
    }
    Ok(())
}

fn history(service: &TaskService, args: &HistoryArgs) {
    let recent = service.list_recent(args.limit);
    if recent.is_empty() {
        println!("no analyses yet");
        return;
    }
    for summary in &recent {
        println!("{}", format_history_line(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ta_task_core::Analyst;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn request_flags_override_settings_model() {
        let parsed = cli(&[
            "ta-runner",
            "run",
            "aapl",
            "--date",
            "2024-01-15",
            "--deep-model",
            "gpt-4o",
        ]);
        let Command::Run(args) = &parsed.command else {
            panic!("expected run");
        };
        let mut settings = RunnerSettings::default();
        settings.model.llm_provider = "openai".into();

        let request = build_request(&settings, args);
        assert_eq!(request.symbol, "aapl");
        assert_eq!(request.analysts, vec![Analyst::Market, Analyst::Fundamentals]);
        assert_eq!(request.model.llm_provider, "openai");
        assert_eq!(request.model.deep_think_llm, "gpt-4o");
        assert_eq!(
            request.model.quick_think_llm,
            settings.model.quick_think_llm
        );
    }

    #[test]
    fn cli_retention_wins_and_zero_disables() {
        let settings = RunnerSettings {
            retention_hours: Some(48),
            max_running: Some(2),
            ..RunnerSettings::default()
        };

        let config = service_config(&cli(&["ta-runner", "history"]), &settings, Path::new("/s"));
        assert_eq!(config.retention, Some(Duration::from_secs(48 * 3600)));
        assert_eq!(config.max_running, Some(2));
        assert_eq!(config.state_dir.as_deref(), Some(Path::new("/s")));

        let config = service_config(
            &cli(&["ta-runner", "--retention-hours", "0", "history"]),
            &settings,
            Path::new("/s"),
        );
        assert_eq!(config.retention, None);
    }

    #[test]
    fn engine_url_prefers_flag_then_settings() {
        let settings = RunnerSettings {
            engine_url: Some("http://engine.local:9000/".into()),
            ..RunnerSettings::default()
        };
        let from_settings = engine_url(&cli(&["ta-runner", "history"]), &settings).unwrap();
        assert_eq!(from_settings.as_str(), "http://engine.local:9000/");

        let from_flag = engine_url(
            &cli(&["ta-runner", "--engine-url", "http://10.0.0.2:8000/", "history"]),
            &settings,
        )
        .unwrap();
        assert_eq!(from_flag.as_str(), "http://10.0.0.2:8000/");

        let fallback = engine_url(&cli(&["ta-runner", "history"]), &RunnerSettings::default())
            .unwrap();
        assert_eq!(fallback.as_str(), DEFAULT_ENGINE_URL);
    }

    #[test]
    fn config_flags_update_settings() {
        let parsed = cli(&[
            "ta-runner",
            "--retention-hours",
            "72",
            "config",
            "--provider",
            "openai",
        ]);
        let Command::Config(args) = &parsed.command else {
            panic!("expected config");
        };
        let mut settings = RunnerSettings::default();
        assert!(apply_config(&mut settings, &parsed, args));
        assert_eq!(settings.model.llm_provider, "openai");
        assert_eq!(settings.retention_hours, Some(72));
        assert!(!apply_config(&mut settings, &parsed, args));
    }

    #[test]
    fn failed_task_exits_non_zero() {
        assert_eq!(exit_code(TaskStatus::Failed), ExitCode::FAILURE);
        assert_eq!(exit_code(TaskStatus::Completed), ExitCode::SUCCESS);
    }
}
