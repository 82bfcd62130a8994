//! Automode - feature orchestration engine for autonomous coding agents
//!
//! Composition root: builds the services for one project and exposes them as
//! a command line.

use anyhow::{bail, Context};
use automode::events::{AgentEvent, OutputStream, Topic};
use automode::feature::{Complexity, Feature, FeatureStatus};
use automode::operations::{CommandAgentRunner, GitCli, ScopedFileStore};
use automode::scheduler::{AutoModeDeps, AutoModeService};
use automode::shell::ShellResolver;
use automode::testing::SecureFileStore;
use automode::worktree::{
    DeleteWorktreeOptions, InitOutcome, MergeOptions, WorktreeDeps, WorktreeManager,
};
use automode::{AutoModeConfig, AutoModeError, EventBus, FeatureStore};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "automode")]
#[command(version = "0.1.0")]
#[command(about = "Run a feature backlog through a coding agent, one git worktree per feature", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Override maxConcurrency from .automaker/automode.json
    #[arg(long, global = true, value_name = "N")]
    max_concurrency: Option<usize>,

    /// Run features in the project root instead of worktrees
    #[arg(long, global = true)]
    no_worktrees: bool,

    /// Park passing features in waiting_approval
    #[arg(long, global = true)]
    require_approval: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control the auto-mode admission loop
    Auto {
        #[command(subcommand)]
        action: AutoAction,
    },

    /// Manage and run features
    Feature {
        #[command(subcommand)]
        action: FeatureAction,
    },

    /// Manage feature worktrees
    Worktree {
        #[command(subcommand)]
        action: WorktreeAction,
    },
}

#[derive(Subcommand)]
enum AutoAction {
    /// Admit backlog features until interrupted
    Start {
        /// Exit once nothing is running and nothing is admissible
        #[arg(long)]
        exit_when_idle: bool,
    },

    /// Return features left in progress by an interrupted session to the backlog
    Stop,
}

#[derive(Subcommand)]
enum FeatureAction {
    /// Add a feature to the backlog
    Add {
        /// Short title
        title: String,

        /// What to build
        #[arg(short, long, default_value = "")]
        description: String,

        /// Explicit id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(short, long, default_value = "")]
        category: String,

        /// Lower runs first
        #[arg(long, default_value = "0")]
        priority: i32,

        /// simple, moderate or complex
        #[arg(long, default_value = "moderate")]
        complexity: String,

        /// Ids that must be verified first
        #[arg(long = "depends-on", value_name = "ID")]
        depends_on: Vec<String>,

        /// Worktree branch (defaults to feature/<id>)
        #[arg(long)]
        branch: Option<String>,
    },

    /// List features
    List {
        /// Output JSON
        #[arg(long)]
        json: bool,

        /// Only show this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one feature as JSON
    Show { id: String },

    /// Plan, implement and verify a feature
    Run { id: String },

    /// Continue a feature from its saved agent output
    Resume { id: String },

    /// Run only the verification phase
    Verify { id: String },

    /// Send further instructions to a feature
    FollowUp {
        id: String,

        /// Instructions for the agent
        prompt: String,

        /// Image to attach (repeatable)
        #[arg(long = "image", value_name = "PATH")]
        images: Vec<PathBuf>,
    },

    /// Return an in-progress feature to the backlog
    Stop { id: String },

    /// Accept a feature waiting for approval
    Approve { id: String },

    /// Commit the feature's worktree
    Commit {
        id: String,

        #[arg(short, long)]
        message: Option<String>,
    },

    /// Delete a feature and its agent output
    Delete { id: String },

    /// Print the saved agent output
    Context { id: String },
}

#[derive(Subcommand)]
enum WorktreeAction {
    /// List worktrees with their features and init status
    List {
        #[arg(long)]
        json: bool,
    },

    /// Create (or reuse) the worktree for a branch
    Create {
        branch: String,

        /// Start point for a new branch
        #[arg(long)]
        base: Option<String>,
    },

    /// Merge a branch into the main branch
    Merge {
        branch: String,

        #[arg(long)]
        squash: bool,

        #[arg(short, long)]
        message: Option<String>,
    },

    /// Remove a worktree and its branch, returning its features to the backlog
    Revert { branch: String },

    /// Remove a worktree
    Delete {
        branch: String,

        /// Also delete the branch
        #[arg(long)]
        delete_branch: bool,

        /// Delete the branch's features instead of moving them to main
        #[arg(long)]
        delete_features: bool,
    },

    /// Manage the worktree init script
    InitScript {
        #[command(subcommand)]
        action: InitScriptAction,
    },
}

#[derive(Subcommand)]
enum InitScriptAction {
    /// Print the init script
    Get,

    /// Replace the init script
    Set {
        /// Script content
        #[arg(conflicts_with = "file")]
        content: Option<String>,

        /// Read the script from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Remove the init script
    Delete,

    /// Run the init script in a worktree again
    Run { branch: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "automode=debug,info"
    } else {
        "automode=info,warn"
    };

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = run(cli, &project_path).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        let code = e
            .downcast_ref::<AutoModeError>()
            .map_or(1, AutoModeError::exit_code);
        std::process::exit(code);
    }
    Ok(())
}

fn load_config(cli: &Cli, project: &Path) -> anyhow::Result<AutoModeConfig> {
    let mut config = AutoModeConfig::load(project)?;
    if let Some(max) = cli.max_concurrency {
        config = config.with_max_concurrency(max);
    }
    if cli.no_worktrees {
        config = config.with_use_worktrees(false);
    }
    if cli.require_approval {
        config = config.with_require_approval(true);
    }
    config.validate()?;
    Ok(config)
}

fn build_service(project: &Path, config: AutoModeConfig) -> AutoModeService {
    let files: Arc<dyn SecureFileStore> = Arc::new(ScopedFileStore::new([
        project.to_path_buf(),
        config.worktrees_root(project),
    ]));
    let bus = EventBus::new();
    let worktrees = Arc::new(WorktreeManager::new(
        WorktreeDeps {
            git: Arc::new(GitCli::new()),
            files: Arc::clone(&files),
            shell: Arc::new(ShellResolver::for_current_platform()),
            bus: bus.clone(),
        },
        config.clone(),
    ));
    let agent = Arc::new(CommandAgentRunner::new(config.agent_command.clone()));

    AutoModeService::new(AutoModeDeps {
        features: FeatureStore::new(files),
        worktrees,
        agent,
        bus,
        config,
    })
}

async fn run(cli: Cli, project: &Path) -> anyhow::Result<()> {
    let config = load_config(&cli, project)?;
    let verbose = cli.verbose;
    let service = build_service(project, config);

    match cli.command {
        Commands::Auto { action } => match action {
            AutoAction::Start { exit_when_idle } => {
                auto_start(&service, project, exit_when_idle, verbose).await
            }
            AutoAction::Stop => {
                let reset = reset_in_progress(&service, project, None)?;
                println!(
                    "{} Returned {} feature(s) to the backlog",
                    "OK".green().bold(),
                    reset
                );
                Ok(())
            }
        },
        Commands::Feature { action } => feature_command(&service, project, action, verbose).await,
        Commands::Worktree { action } => worktree_command(&service, project, action).await,
    }
}

// =============================================================================
// Auto mode
// =============================================================================

async fn auto_start(
    service: &AutoModeService,
    project: &Path,
    exit_when_idle: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let (_subscription, mut rx) = service.bus().subscribe_channel(Topic::All);
    let max = service.config().max_concurrency;
    service.start(project, max).await?;
    println!(
        "{} Auto mode running ({} at a time). Press Ctrl-C to stop.",
        "▶".cyan().bold(),
        max
    );

    let mut stopping = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal.context("failed to listen for Ctrl-C")?;
                println!("\n{} Stopping...", "■".yellow().bold());
                stopping = true;
                service.stop(project).await?;
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                print_event(&event, verbose);
                match event {
                    AgentEvent::AutoModeIdle { .. } if exit_when_idle && !stopping => {
                        stopping = true;
                        service.stop(project).await?;
                    }
                    AgentEvent::AutoModeStopped { .. } => break,
                    _ => {}
                }
            }
        }
    }
    service.worktrees().shutdown();
    Ok(())
}

/// Reset `in_progress` features to the backlog; all of them, or just `only`.
fn reset_in_progress(
    service: &AutoModeService,
    project: &Path,
    only: Option<&str>,
) -> anyhow::Result<usize> {
    let mut reset = 0;
    for feature in service.features().list(project)? {
        if feature.status != FeatureStatus::InProgress
            || only.is_some_and(|id| id != feature.id)
        {
            continue;
        }
        service.features().update_status(
            project,
            &feature.id,
            FeatureStatus::Backlog,
            Some("interrupted".to_string()),
        )?;
        reset += 1;
    }
    Ok(reset)
}

// =============================================================================
// Features
// =============================================================================

async fn feature_command(
    service: &AutoModeService,
    project: &Path,
    action: FeatureAction,
    verbose: bool,
) -> anyhow::Result<()> {
    let use_worktrees = service.config().use_worktrees;

    match action {
        FeatureAction::Add {
            title,
            description,
            id,
            category,
            priority,
            complexity,
            depends_on,
            branch,
        } => {
            let complexity: Complexity = complexity.parse().map_err(anyhow::Error::msg)?;
            let mut feature = Feature::new(title, description)
                .with_category(category)
                .with_priority(priority)
                .with_complexity(complexity)
                .with_dependencies(depends_on);
            if let Some(id) = id {
                feature = feature.with_id(id);
            }
            if let Some(branch) = branch {
                automode::worktree::validate_branch_name(&branch)?;
                feature = feature.with_branch(branch);
            }
            let created = service.features().create(project, feature)?;
            println!("{} Added {}", "OK".green().bold(), created.id.bold());
        }

        FeatureAction::List { json, status } => {
            let status: Option<FeatureStatus> = status
                .map(|s| s.parse().map_err(anyhow::Error::msg))
                .transpose()?;
            let features: Vec<Feature> = service
                .features()
                .list(project)?
                .into_iter()
                .filter(|f| status.is_none_or(|s| f.status == s))
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&features)?);
            } else if features.is_empty() {
                println!("No features.");
            } else {
                for feature in &features {
                    println!(
                        "{:<18} {:>4}  {}  {}",
                        colored_status(feature.status),
                        feature.priority,
                        feature.id.dimmed(),
                        feature.title
                    );
                }
            }
        }

        FeatureAction::Show { id } => {
            let feature = service.features().get(project, &id)?;
            println!("{}", serde_json::to_string_pretty(&feature)?);
        }

        FeatureAction::Run { id } => {
            let rx = subscribe(service);
            let ack = service.run_feature(project, &id, use_worktrees).await?;
            println!("{} Running in {}", "▶".cyan().bold(), ack.worktree_path.display());
            follow_run(service, rx, &id, verbose).await?;
        }

        FeatureAction::Resume { id } => {
            let rx = subscribe(service);
            service.resume_feature(project, &id, use_worktrees).await?;
            follow_run(service, rx, &id, verbose).await?;
        }

        FeatureAction::Verify { id } => {
            let rx = subscribe(service);
            service.verify_feature(project, &id).await?;
            follow_run(service, rx, &id, verbose).await?;
        }

        FeatureAction::FollowUp { id, prompt, images } => {
            let rx = subscribe(service);
            service
                .follow_up_feature(project, &id, &prompt, images)
                .await?;
            follow_run(service, rx, &id, verbose).await?;
        }

        FeatureAction::Stop { id } => {
            service.features().get(project, &id)?;
            if reset_in_progress(service, project, Some(&id))? == 0 {
                return Err(AutoModeError::not_running(id).into());
            }
            println!("{} {} returned to the backlog", "OK".green().bold(), id);
        }

        FeatureAction::Approve { id } => {
            service.approve_feature(project, &id).await?;
            println!("{} {} verified", "OK".green().bold(), id);
        }

        FeatureAction::Commit { id, message } => {
            if service
                .commit_feature(project, &id, message.as_deref())
                .await?
            {
                println!("{} Committed {}", "OK".green().bold(), id);
            } else {
                println!("Nothing to commit for {id}");
            }
        }

        FeatureAction::Delete { id } => {
            service.delete_feature(project, &id).await?;
            println!("{} Deleted {}", "OK".green().bold(), id);
        }

        FeatureAction::Context { id } => {
            service.features().get(project, &id)?;
            match service.features().read_context(project, &id)? {
                Some(context) => print!("{context}"),
                None => println!("No agent output for {id}"),
            }
        }
    }
    Ok(())
}

fn subscribe(service: &AutoModeService) -> (automode::Subscription, UnboundedReceiver<AgentEvent>) {
    service.bus().subscribe_channel(Topic::All)
}

/// Print events until the feature's terminal event. Ctrl-C stops the run.
async fn follow_run(
    service: &AutoModeService,
    (_subscription, mut rx): (automode::Subscription, UnboundedReceiver<AgentEvent>),
    feature_id: &str,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                service.stop_feature(feature_id).await?;
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    bail!("event stream closed before {feature_id} finished");
                };
                print_event(&event, verbose);
                if let AgentEvent::AutoModeFeatureComplete { feature_id: id, passes, .. } = &event {
                    if id == feature_id {
                        service.worktrees().shutdown();
                        if !passes {
                            std::process::exit(1);
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

// =============================================================================
// Worktrees
// =============================================================================

async fn worktree_command(
    service: &AutoModeService,
    project: &Path,
    action: WorktreeAction,
) -> anyhow::Result<()> {
    let worktrees = service.worktrees();

    match action {
        WorktreeAction::List { json } => {
            let list = worktrees.list_worktrees(project).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for info in &list {
                    let branch = info.branch.as_deref().unwrap_or("(detached)");
                    let init = info
                        .metadata
                        .as_ref()
                        .and_then(|m| m.init_script_status)
                        .map(|s| format!(" init:{s:?}").to_lowercase())
                        .unwrap_or_default();
                    println!(
                        "{:<30} {} feature(s){}  {}",
                        if info.is_main {
                            branch.bold().to_string()
                        } else {
                            branch.to_string()
                        },
                        info.feature_count,
                        init,
                        info.path.display().to_string().dimmed()
                    );
                }
            }
        }

        WorktreeAction::Create { branch, base } => {
            let (_subscription, mut rx) = service.bus().subscribe_channel(Topic::Worktree);
            let ensured = worktrees
                .ensure_worktree(project, &branch, base.as_deref())
                .await?;
            println!(
                "{} {} {}",
                "OK".green().bold(),
                if ensured.created { "Created" } else { "Reusing" },
                ensured.path.display()
            );
            if let Some(task) = ensured.init_task {
                let outcome = task.await.context("init script task panicked")??;
                while let Ok(event) = rx.try_recv() {
                    print_event(&event, true);
                }
                report_init(&outcome);
            }
        }

        WorktreeAction::Merge {
            branch,
            squash,
            message,
        } => {
            let summary = worktrees
                .merge_feature(
                    project,
                    &branch,
                    MergeOptions {
                        squash,
                        commit_message: message,
                    },
                )
                .await?;
            println!(
                "{} Merged {} into {}{}",
                "OK".green().bold(),
                summary.branch,
                summary.target,
                if summary.squashed { " (squashed)" } else { "" }
            );
        }

        WorktreeAction::Revert { branch } => {
            let outcome = service.revert_worktree(project, &branch).await?;
            println!(
                "{} Reverted {}; {} feature(s) back in the backlog",
                "OK".green().bold(),
                branch,
                outcome.reset_features.len()
            );
        }

        WorktreeAction::Delete {
            branch,
            delete_branch,
            delete_features,
        } => {
            let outcome = service
                .delete_worktree(
                    project,
                    &branch,
                    DeleteWorktreeOptions {
                        delete_branch,
                        delete_features,
                    },
                )
                .await?;
            println!(
                "{} Deleted worktree for {} (branch {}, {} moved to main, {} deleted)",
                "OK".green().bold(),
                branch,
                if outcome.branch_deleted { "deleted" } else { "kept" },
                outcome.reassigned.len(),
                outcome.deleted_features.len()
            );
        }

        WorktreeAction::InitScript { action } => {
            let init = worktrees.init_scripts();
            match action {
                InitScriptAction::Get => match init.get_script(project)? {
                    Some(script) => print!("{script}"),
                    None => println!("No init script."),
                },
                InitScriptAction::Set { content, file } => {
                    let script = match (content, file) {
                        (Some(content), _) => content,
                        (None, Some(file)) => std::fs::read_to_string(&file)
                            .with_context(|| format!("failed to read {}", file.display()))?,
                        (None, None) => bail!("pass the script content or --file"),
                    };
                    init.set_script(project, &script)?;
                    println!("{} Init script saved", "OK".green().bold());
                }
                InitScriptAction::Delete => {
                    if init.delete_script(project)? {
                        println!("{} Init script deleted", "OK".green().bold());
                    } else {
                        println!("No init script.");
                    }
                }
                InitScriptAction::Run { branch } => {
                    let (_subscription, mut rx) = service.bus().subscribe_channel(Topic::Worktree);
                    let outcome = worktrees.force_run_init(project, &branch).await?;
                    while let Ok(event) = rx.try_recv() {
                        print_event(&event, true);
                    }
                    report_init(&outcome);
                }
            }
        }
    }
    Ok(())
}

fn report_init(outcome: &InitOutcome) {
    match outcome {
        InitOutcome::NoScript => println!("No init script configured"),
        InitOutcome::AlreadyRan => println!("Init script already ran"),
        InitOutcome::InProgress => println!("Init script is already running"),
        InitOutcome::Succeeded => println!("{} Init script succeeded", "OK".green().bold()),
        InitOutcome::Failed { error } => {
            println!("{} Init script failed: {}", "FAILED".red().bold(), error);
        }
    }
}

// =============================================================================
// Output
// =============================================================================

fn colored_status(status: FeatureStatus) -> colored::ColoredString {
    let label = status.as_str();
    match status {
        FeatureStatus::Backlog => label.normal(),
        FeatureStatus::InProgress => label.cyan(),
        FeatureStatus::WaitingApproval => label.yellow(),
        FeatureStatus::Verified => label.green(),
        FeatureStatus::Archived => label.dimmed(),
    }
}

fn print_event(event: &AgentEvent, verbose: bool) {
    match event {
        AgentEvent::AutoModeStarted { max_concurrency, .. } => {
            println!("{} auto mode started (max {})", "●".green(), max_concurrency);
        }
        AgentEvent::AutoModeStopped {
            stopped_features, ..
        } => {
            println!(
                "{} auto mode stopped ({} feature(s) cancelled)",
                "■".yellow(),
                stopped_features
            );
        }
        AgentEvent::AutoModeIdle { .. } => println!("{} idle", "○".dimmed()),
        AgentEvent::AutoModeFeatureStart {
            feature_id,
            worktree_path,
            ..
        } => {
            println!(
                "{} {} started in {}",
                "▶".cyan().bold(),
                feature_id.bold(),
                worktree_path.display()
            );
        }
        AgentEvent::AutoModePhase {
            feature_id, phase, ..
        } => println!("  {} {}", format!("[{phase}]").blue(), feature_id),
        AgentEvent::AutoModeProgress { content, .. } => {
            if verbose {
                println!("    {}", content.trim_end());
            }
        }
        AgentEvent::AutoModeTool { tool, .. } => {
            if verbose {
                println!("    {} {}", "tool".dimmed(), tool);
            }
        }
        AgentEvent::AutoModeFeatureComplete {
            feature_id,
            passes,
            message,
        } => {
            let mark = if *passes {
                "PASS".green().bold()
            } else {
                "FAIL".red().bold()
            };
            println!("{} {} {}", mark, feature_id.bold(), message);
        }
        AgentEvent::AutoModeError { feature_id, error } => {
            eprintln!(
                "{} {}{}",
                "Error:".red().bold(),
                feature_id
                    .as_deref()
                    .map(|id| format!("{id}: "))
                    .unwrap_or_default(),
                error
            );
        }
        AgentEvent::WorktreeInitStarted { branch, .. } => {
            println!("  {} init script for {}", "⚙".blue(), branch);
        }
        AgentEvent::WorktreeInitOutput {
            stream, content, ..
        } => {
            if verbose {
                match stream {
                    OutputStream::Stdout => println!("    {}", content.trim_end()),
                    OutputStream::Stderr => eprintln!("    {}", content.trim_end().yellow()),
                }
            }
        }
        AgentEvent::WorktreeInitCompleted {
            branch,
            success,
            error,
            ..
        } => {
            if *success {
                println!("  {} init script for {}", "OK".green(), branch);
            } else {
                println!(
                    "  {} init script for {}: {}",
                    "FAILED".red(),
                    branch,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}
