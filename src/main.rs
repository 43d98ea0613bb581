// ABOUTME: Command line entry point: session lifecycle commands, the in-process agent loop and ticket batches

use agents_runner::agent::{Agent, CliAgent};
use agents_runner::config::AppConfig;
use agents_runner::docker::{ContainerManager, ContainerRuntime};
use agents_runner::git::{Git2Client, GitClient};
use agents_runner::models::SessionState;
use agents_runner::runner::{AgentSession, SessionOutcome};
use agents_runner::scheduler::BatchRunner;
use agents_runner::session::manager::SESSION_ENV;
use agents_runner::session::{
    validate_session_name, OsProcessHost, SessionError, SessionManager, SessionStore, StartRequest,
};
use agents_runner::tickets::{FileTicketSource, Issue};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Workspace file read as the goal when none is given on the command line.
const GOAL_FILE: &str = "app_spec.txt";

const RECORD_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "agents-runner")]
#[command(author, version, about = "Supervise autonomous coding-agent sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.toml (default: ~/.agents-runner/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding session records and logs
    #[arg(long, global = true)]
    sessions_dir: Option<PathBuf>,
}

/// Per-run overrides of the loaded configuration.
#[derive(Args, Clone, Default)]
struct RunOverrides {
    /// Maximum agent iterations before the session fails
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Skip the QA pass before completing
    #[arg(long)]
    skip_qa: bool,

    /// Merge the session branch into the base branch on success
    #[arg(long)]
    auto_merge: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new agent session
    Start {
        name: String,

        /// Workspace directory mounted into the agent container
        #[arg(long)]
        workspace: PathBuf,

        /// Goal for the agent (default: the workspace's app_spec.txt)
        #[arg(long)]
        goal: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Branch to work on, created from the base branch if missing
        #[arg(long)]
        branch: Option<String>,

        /// Run in the background under supervision
        #[arg(long)]
        detached: bool,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Run the agent loop for an existing session record (used by detached sessions)
    #[command(hide = true)]
    Run {
        /// Session name (default: taken from the launching supervisor)
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        workspace: PathBuf,

        #[arg(long)]
        goal: String,

        #[arg(long)]
        branch: Option<String>,

        #[command(flatten)]
        overrides: RunOverrides,
    },

    /// Stop a running session
    Stop { name: String },

    /// Pause a running session
    Pause { name: String },

    /// Resume a paused session
    Resume { name: String },

    /// Relaunch a finished session from its last checkpoint
    Restart { name: String },

    /// Launch a finished session again from its starting commit
    Replay {
        name: String,

        /// Name of the new session (default: <name>-replay)
        #[arg(long = "as")]
        new_name: Option<String>,
    },

    /// Remove a session record and its log
    Rm {
        name: String,

        /// Kill the session first if it is still running
        #[arg(short, long)]
        force: bool,
    },

    /// Rename a session
    Rename { old: String, new: String },

    /// Move a finished session to the archive
    Archive { name: String },

    /// Restore an archived session
    Unarchive { name: String },

    /// List sessions
    Ls {
        /// List archived sessions instead
        #[arg(long)]
        archived: bool,
    },

    /// Show sessions with resource usage and cost
    Ps,

    /// Show a session's log
    Logs {
        name: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Show what a session changed in its workspace
    Diff { name: String },

    /// Run one agent session per selected ticket, respecting ticket blockers
    Batch {
        /// JSON file of tickets
        #[arg(long)]
        tickets: PathBuf,

        /// Ticket selector: label:<name> or free text
        #[arg(long)]
        select: String,

        /// Repository to clone for tickets without a Repo: line
        #[arg(long)]
        repo: Option<String>,

        /// Maximum sessions running at once
        #[arg(long)]
        parallel: Option<usize>,

        #[command(flatten)]
        overrides: RunOverrides,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging();
    setup_panic_handler();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(dir) = &cli.sessions_dir {
        config.sessions_dir = Some(dir.clone());
    }
    let ctx = CliContext {
        config_path: cli.config.clone(),
        sessions_dir: cli.sessions_dir.clone(),
    };

    match cli.command {
        Commands::Start {
            name,
            workspace,
            goal,
            tags,
            branch,
            detached,
            overrides,
        } => {
            apply_overrides(&mut config, &overrides);
            config.validate()?;
            let workspace = canonical_workspace(&workspace)?;
            let goal = resolve_goal(goal, &workspace)?;
            let command = ctx.run_command(&workspace, &goal, branch.as_deref(), &overrides)?;

            if detached {
                let manager = session_manager(&config)?;
                let mut request = StartRequest::new(name, command, workspace);
                request.goal = Some(goal);
                request.tags = tags;
                let state = manager.start_session(request)?;
                println!("Started session {} (pid {})", state.name, state.pid);
                println!("Log: {}", state.log_file.display());
                Ok(())
            } else {
                let store = open_store(&config)?;
                validate_session_name(&name)?;
                if store.exists(&name) {
                    return Err(SessionError::AlreadyExists(name).into());
                }
                let mut state = SessionState::new(name.clone(), command, workspace.clone(), store.log_path(&name));
                state.pid = std::process::id() as i32;
                state.goal = Some(goal.clone());
                state.tags = tags;
                store.save(&state)?;
                run_agent(&config, store, &name, &workspace, &goal, branch).await
            }
        }
        Commands::Run {
            name,
            workspace,
            goal,
            branch,
            overrides,
        } => {
            apply_overrides(&mut config, &overrides);
            config.validate()?;
            let name = match name {
                Some(name) => name,
                None => std::env::var(SESSION_ENV)
                    .map_err(|_| anyhow!("no session name given and {} is not set", SESSION_ENV))?,
            };
            let store = open_store(&config)?;
            wait_for_record(&store, &name).await;
            run_agent(&config, store, &name, &workspace, &goal, branch).await
        }
        Commands::Stop { name } => {
            let state = session_manager(&config)?.stop_session(&name).await?;
            println!("Stopped session {} ({})", state.name, state.status);
            Ok(())
        }
        Commands::Pause { name } => {
            let state = session_manager(&config)?.pause_session(&name)?;
            println!("Paused session {}", state.name);
            Ok(())
        }
        Commands::Resume { name } => {
            let state = session_manager(&config)?.resume_session(&name)?;
            println!("Resumed session {}", state.name);
            Ok(())
        }
        Commands::Restart { name } => {
            let state = session_manager(&config)?.restart_session(&name)?;
            println!("Restarted session {} (pid {})", state.name, state.pid);
            Ok(())
        }
        Commands::Replay { name, new_name } => {
            let state = session_manager(&config)?.replay_session(&name, new_name.as_deref())?;
            println!("Replaying {} as {} (pid {})", name, state.name, state.pid);
            Ok(())
        }
        Commands::Rm { name, force } => {
            session_manager(&config)?.remove_session(&name, force)?;
            println!("Removed session {}", name);
            Ok(())
        }
        Commands::Rename { old, new } => {
            session_manager(&config)?.rename_session(&old, &new)?;
            println!("Renamed session {} to {}", old, new);
            Ok(())
        }
        Commands::Archive { name } => {
            session_manager(&config)?.archive_session(&name)?;
            println!("Archived session {}", name);
            Ok(())
        }
        Commands::Unarchive { name } => {
            session_manager(&config)?.unarchive_session(&name)?;
            println!("Unarchived session {}", name);
            Ok(())
        }
        Commands::Ls { archived } => {
            let manager = session_manager(&config)?;
            let sessions = if archived {
                manager.list_archived_sessions()?
            } else {
                manager.list_sessions()?
            };
            print_sessions(&sessions);
            Ok(())
        }
        Commands::Ps => {
            print_processes(&session_manager(&config)?)?;
            Ok(())
        }
        Commands::Logs { name, lines } => {
            for line in session_manager(&config)?.session_logs(&name, lines)? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Diff { name } => {
            match session_manager(&config)?.session_diff_stat(&name)? {
                Some(stat) if !stat.trim().is_empty() => println!("{}", stat.trim_end()),
                Some(_) => println!("No changes"),
                None => println!("No starting commit recorded for {}", name),
            }
            Ok(())
        }
        Commands::Batch {
            tickets,
            select,
            repo,
            parallel,
            overrides,
        } => {
            apply_overrides(&mut config, &overrides);
            if let Some(parallel) = parallel {
                config.max_parallel_tickets = parallel;
            }
            config.validate()?;
            run_batch(config, &tickets, &select, repo).await
        }
    }
}

/// Global flags a detached child needs to see the same configuration.
struct CliContext {
    config_path: Option<PathBuf>,
    sessions_dir: Option<PathBuf>,
}

impl CliContext {
    /// Command line that reruns this session's agent loop in a child process.
    /// The child learns its session name from the supervisor's environment,
    /// so restart and replay can reuse it under any name.
    fn run_command(
        &self,
        workspace: &Path,
        goal: &str,
        branch: Option<&str>,
        overrides: &RunOverrides,
    ) -> Result<Vec<String>> {
        let exe = std::env::current_exe().context("Failed to locate the agents-runner executable")?;
        let mut command = vec![
            exe.to_string_lossy().into_owned(),
            "run".to_string(),
            "--workspace".to_string(),
            workspace.to_string_lossy().into_owned(),
            "--goal".to_string(),
            goal.to_string(),
        ];
        if let Some(branch) = branch {
            command.extend(["--branch".to_string(), branch.to_string()]);
        }
        if let Some(path) = &self.config_path {
            command.extend(["--config".to_string(), path.to_string_lossy().into_owned()]);
        }
        if let Some(dir) = &self.sessions_dir {
            command.extend(["--sessions-dir".to_string(), dir.to_string_lossy().into_owned()]);
        }
        if let Some(max) = overrides.max_iterations {
            command.extend(["--max-iterations".to_string(), max.to_string()]);
        }
        if overrides.skip_qa {
            command.push("--skip-qa".to_string());
        }
        if overrides.auto_merge {
            command.push("--auto-merge".to_string());
        }
        Ok(command)
    }
}

fn apply_overrides(config: &mut AppConfig, overrides: &RunOverrides) {
    if let Some(max) = overrides.max_iterations {
        config.max_iterations = max;
    }
    if overrides.skip_qa {
        config.skip_qa = true;
    }
    if overrides.auto_merge {
        config.auto_merge = true;
    }
}

fn open_store(config: &AppConfig) -> Result<SessionStore> {
    Ok(SessionStore::new(config.resolved_sessions_dir()?)?)
}

fn session_manager(config: &AppConfig) -> Result<SessionManager> {
    let manager = SessionManager::new(
        open_store(config)?,
        Arc::new(OsProcessHost::new()),
        config.manager_config(),
    )
    .with_git(Arc::new(Git2Client::new()));
    Ok(manager)
}

fn canonical_workspace(workspace: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(workspace)
        .with_context(|| format!("Workspace {} does not exist", workspace.display()))
}

fn resolve_goal(goal: Option<String>, workspace: &Path) -> Result<String> {
    if let Some(goal) = goal.filter(|g| !g.trim().is_empty()) {
        return Ok(goal);
    }
    match std::fs::read_to_string(workspace.join(GOAL_FILE)) {
        Ok(content) if !content.trim().is_empty() => Ok(content),
        _ => bail!("No goal given: pass --goal or add {} to the workspace", GOAL_FILE),
    }
}

fn is_git_repo(workspace: &Path) -> bool {
    workspace.join(".git").exists()
}

/// A detached child can start before its supervisor has persisted the record.
async fn wait_for_record(store: &SessionStore, name: &str) {
    let deadline = tokio::time::Instant::now() + RECORD_WAIT;
    while !store.exists(name) {
        if tokio::time::Instant::now() >= deadline {
            warn!("No session record for {} yet, running without one", name);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM. The loop stops at its next iteration boundary.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        token.cancel();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
        }
        warn!("Interrupted, finishing the current iteration");
        token.cancel();
    });
}

fn build_agent(config: &AppConfig, workspace: &Path) -> Arc<dyn Agent> {
    Arc::new(
        CliAgent::new(config.agent_command.clone())
            .with_cwd(workspace)
            .with_timeout(Duration::from_secs(config.command_timeout_secs)),
    )
}

/// Socket candidates for the Docker daemon. A configured socket wins; with
/// `DOCKER_HOST` set the list is empty so Bollard's defaults apply.
fn docker_socket_paths(config: &AppConfig) -> Vec<PathBuf> {
    if let Some(socket) = &config.docker_socket {
        return vec![socket.clone()];
    }
    if let Ok(docker_host) = std::env::var("DOCKER_HOST") {
        info!("Using DOCKER_HOST: {}", docker_host);
        return Vec::new();
    }

    let mut paths = Vec::new();
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".docker/run/docker.sock"));
            paths.push(home.join(".colima/default/docker.sock"));
        }
    }
    if cfg!(target_os = "linux") {
        paths.push(PathBuf::from("/var/run/docker.sock"));
        if let Ok(xdg_runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            paths.push(PathBuf::from(&xdg_runtime_dir).join("docker.sock"));
            paths.push(PathBuf::from(&xdg_runtime_dir).join("podman/podman.sock"));
        }
    }
    paths
}

async fn run_agent(
    config: &AppConfig,
    store: SessionStore,
    name: &str,
    workspace: &Path,
    goal: &str,
    branch: Option<String>,
) -> Result<()> {
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(ContainerManager::new(&docker_socket_paths(config)).await?);
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let mut session = AgentSession::new(
        name,
        goal,
        workspace,
        build_agent(config, workspace),
        runtime,
        config.session_config(),
    )
    .with_store(store)
    .with_cancellation(cancel);
    if is_git_repo(workspace) {
        session = session.with_git(Arc::new(Git2Client::new()));
        if let Some(branch) = branch {
            session = session.with_branch(branch);
        }
    }

    match session.run().await? {
        SessionOutcome::Completed { iterations } => {
            println!("Session {} completed after {} iterations", name, iterations);
        }
        SessionOutcome::Cancelled { iterations } => {
            println!("Session {} stopped after {} iterations", name, iterations);
        }
    }
    Ok(())
}

/// Shared state for the sessions of one batch.
struct BatchContext {
    config: AppConfig,
    store: SessionStore,
    runtime: Arc<dyn ContainerRuntime>,
    git: Arc<dyn GitClient>,
    workspaces_dir: PathBuf,
    default_repo: Option<String>,
    cancel: CancellationToken,
}

impl BatchContext {
    async fn run_ticket(&self, issue: Issue) -> Result<()> {
        let repo = issue
            .repo_url()
            .or_else(|| self.default_repo.clone())
            .ok_or_else(|| anyhow!("Ticket {} names no repository and no --repo was given", issue.key))?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let workspace = self.workspaces_dir.join(format!("{}-{}", issue.key, stamp));

        info!("Cloning {} for ticket {} into {}", repo, issue.key, workspace.display());
        let git = self.git.clone();
        let dest = workspace.clone();
        tokio::task::spawn_blocking(move || git.clone_repo(&repo, &dest))
            .await
            .map_err(|e| anyhow!("Clone task failed: {}", e))??;

        let goal = issue.goal();
        std::fs::write(workspace.join(GOAL_FILE), format!("# Ticket: {}\n\n{}\n", issue.key, goal))?;

        let name = if self.store.exists(&issue.key) {
            format!("{}-{}", issue.key, stamp)
        } else {
            issue.key.clone()
        };
        validate_session_name(&name)?;
        let mut state = SessionState::new(
            name.clone(),
            vec!["batch".to_string(), issue.key.clone()],
            workspace.clone(),
            self.store.log_path(&name),
        );
        state.pid = std::process::id() as i32;
        state.goal = Some(goal.clone());
        state.tags = issue.labels.clone();
        self.store.save(&state)?;

        let mut session = AgentSession::new(
            &name,
            goal,
            &workspace,
            build_agent(&self.config, &workspace),
            self.runtime.clone(),
            self.config.session_config(),
        )
        .with_git(self.git.clone())
        .with_branch(format!("agent/{}", issue.key))
        .with_store(self.store.clone())
        .with_cancellation(self.cancel.clone());

        match session.run().await? {
            SessionOutcome::Completed { .. } => Ok(()),
            SessionOutcome::Cancelled { iterations } => {
                bail!("Session {} cancelled after {} iterations", name, iterations)
            }
        }
    }
}

async fn run_batch(config: AppConfig, tickets: &Path, select: &str, repo: Option<String>) -> Result<()> {
    let source = Arc::new(FileTicketSource::open(tickets)?);
    let parallel = config.max_parallel_tickets;
    let workspaces_dir = AppConfig::home_dir()?.join("workspaces");
    std::fs::create_dir_all(&workspaces_dir)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let ctx = Arc::new(BatchContext {
        store: open_store(&config)?,
        runtime: Arc::new(ContainerManager::new(&docker_socket_paths(&config)).await?),
        git: Arc::new(Git2Client::new()),
        workspaces_dir,
        default_repo: repo,
        cancel,
        config,
    });

    let report = BatchRunner::new(source, parallel)
        .run(select, move |issue: Issue| {
            let ctx = ctx.clone();
            async move { ctx.run_ticket(issue).await }
        })
        .await?;

    println!(
        "Batch finished: {} completed, {} failed",
        report.completed.len(),
        report.failed.len()
    );
    for (key, message) in &report.failed {
        println!("  {} failed: {}", key, message);
    }
    Ok(())
}

fn print_sessions(sessions: &[SessionState]) {
    if sessions.is_empty() {
        println!("No sessions");
        return;
    }
    println!("{:<24} {:<12} {:<20} {:>10}  GOAL", "NAME", "STATUS", "STARTED", "DURATION");
    for session in sessions {
        let goal = session
            .goal
            .as_deref()
            .and_then(|g| g.lines().next())
            .unwrap_or("-");
        println!(
            "{:<24} {} {:<10} {:<20} {:>9}s  {}",
            session.name,
            session.status.indicator(),
            session.status,
            session.start_time.format("%Y-%m-%d %H:%M:%S"),
            session.duration().num_seconds(),
            truncate(goal, 60)
        );
    }
}

fn print_processes(manager: &SessionManager) -> Result<()> {
    let sessions = manager.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:>8} {:>10} {:>8} {:>12} {:>10}",
        "NAME", "STATUS", "PID", "RSS(KB)", "CPU(s)", "TOKENS", "COST($)"
    );
    let mut total_cost = 0.0;
    let mut total_tokens = 0;
    for session in &sessions {
        let usage = manager.resource_usage(&session.name).unwrap_or_else(|e| {
            warn!("No resource usage for {}: {}", session.name, e);
            None
        });
        let (tokens, cost) = match manager.cost_summary(&session.name) {
            Ok(summary) => (summary.usage.total_tokens, summary.cost_usd),
            Err(e) => {
                warn!("No cost summary for {}: {}", session.name, e);
                (0, 0.0)
            }
        };
        total_tokens += tokens;
        total_cost += cost;

        let (rss, cpu) = match usage {
            Some(usage) => (usage.rss_kb.to_string(), format!("{:.1}", usage.cpu_seconds)),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<24} {:<10} {:>8} {:>10} {:>8} {:>12} {:>10.4}",
            session.name, session.status, session.pid, rss, cpu, tokens, cost
        );
    }
    println!("{:<24} {:>52} {:>10.4}", "TOTAL", total_tokens, total_cost);
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn setup_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = AppConfig::home_dir()
        .map(|home| home.join("logs"))
        .unwrap_or_else(|_| PathBuf::from(".agents-runner/logs"));
    let _ = std::fs::create_dir_all(&log_dir);

    let log_file = log_dir.join(format!(
        "agents-runner-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "agents_runner=info".into());

    match OpenOptions::new().create(true).append(true).open(&log_file) {
        Ok(file) => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(file)
                    .with_ansi(false),
            )
            .with(filter)
            .init(),
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", log_file.display(), e);
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
