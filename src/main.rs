//! Strata CLI - declarative workflow orchestration

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};

use strata::debug::{parse_command, DebugCommand, DebugSession, HELP_TEXT};
use strata::dispatch::create_dispatcher;
use strata::engine::WorkflowEngine;
use strata::error::{EngineError, FixSuggestion};
use strata::impact::ProposedChange;
use strata::repository::InMemoryRepository;
use strata::spec::{manifest_kind, TaskManifest, KIND_TASK, KIND_WORKFLOW};
use strata::EngineConfig;

#[derive(Parser)]
#[command(name = "workflow")]
#[command(about = "Strata - declarative workflow orchestration for HTTP-backed tasks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new workflow project
    Init {
        /// Target directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Validate a workflow file (exit 0 when valid)
    Validate {
        /// Path to the workflow manifest
        file: PathBuf,

        /// Directory of WorkflowTask manifests
        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },

    /// Print the execution plan: levels and edges
    Explain {
        file: PathBuf,

        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },

    /// Inspect registered tasks
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },

    /// Execute a workflow
    Run {
        file: PathBuf,

        /// Execute against live endpoints instead of the mock executor
        #[arg(long, conflicts_with = "local")]
        gateway: bool,

        /// Use the local mock executor (default)
        #[arg(long)]
        local: bool,

        /// Input parameters as key=value (values parsed as JSON when possible)
        #[arg(short, long, value_name = "KEY=VALUE")]
        input: Vec<String>,

        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },

    /// Dry-run: resolve templates and build the plan, no HTTP
    Test {
        file: PathBuf,

        #[arg(short, long, value_name = "KEY=VALUE")]
        input: Vec<String>,

        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },

    /// Interactive stepper: breakpoints, context inspection, mock outputs
    Debug {
        file: PathBuf,

        #[arg(short, long, value_name = "KEY=VALUE")]
        input: Vec<String>,

        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },

    /// Assess the impact of a task change (exit 1 breaking, 2 blocked)
    Impact {
        /// Task name
        task: String,

        /// Field to remove
        #[arg(long, value_name = "FIELD")]
        remove_field: Option<String>,

        /// Field whose type changes
        #[arg(long, value_name = "FIELD")]
        change_type: Option<String>,

        /// Required input field to add (no default)
        #[arg(long, value_name = "FIELD")]
        add_required: Option<String>,

        /// Directory of workflow manifests to index
        #[arg(short, long, default_value = ".")]
        workflows: PathBuf,

        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List registered task names
    List {
        #[arg(short, long, default_value = "tasks")]
        dir: PathBuf,
    },
    /// Show one task definition
    Show {
        name: String,

        #[arg(short, long, default_value = "tasks")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match run_command(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            1
        }
    };
    std::process::exit(code);
}

async fn run_command(command: Commands) -> Result<i32, EngineError> {
    match command {
        Commands::Init { dir } => {
            let result = strata::init::init_project(&dir)?;
            for path in result.created {
                println!("{} {}", "created".green(), path.display());
            }
            Ok(0)
        }

        Commands::Validate { file, tasks } => {
            let engine = engine_for(&file, tasks.as_deref(), "mock")?;
            let yaml = std::fs::read_to_string(&file)?;
            let result = engine.validate_yaml(&yaml)?;

            for warning in &result.warnings {
                println!("{} {}", "warning:".yellow(), warning);
            }
            if result.is_valid() {
                println!(
                    "{} {} is valid ({} step(s))",
                    "✓".green(),
                    file.display(),
                    result.step_count
                );
                Ok(0)
            } else {
                for error in &result.errors {
                    println!("{} {}", "error:".red(), error);
                }
                Ok(1)
            }
        }

        Commands::Explain { file, tasks: _ } => {
            let yaml = std::fs::read_to_string(&file)?;
            let manifest = strata::spec::WorkflowManifest::from_yaml(&yaml)?;
            let plan = strata::dag::build_plan(&manifest.spec)?;

            println!("{} {}", "workflow:".cyan().bold(), manifest.metadata.name);
            for (i, level) in plan.levels.iter().enumerate() {
                println!("  level {i}: {}", level.join(", "));
            }
            if !plan.edges.is_empty() {
                println!("{}", "edges:".cyan().bold());
                for (from, to) in &plan.edges {
                    println!("  {from} -> {to}");
                }
            }
            println!("estimated parallelism: {}", plan.estimated_parallelism);
            Ok(0)
        }

        Commands::Tasks { command } => match command {
            TasksCommand::List { dir } => {
                let engine = WorkflowEngine::local();
                register_directory(&engine, &dir, Some(KIND_TASK))?;
                for name in engine.registry().names() {
                    println!("{name}");
                }
                Ok(0)
            }
            TasksCommand::Show { name, dir } => {
                let engine = WorkflowEngine::local();
                register_directory(&engine, &dir, Some(KIND_TASK))?;
                let Some(task) = engine.registry().get(&name) else {
                    return Err(EngineError::UnknownTask(name));
                };
                println!("{} {}", "task:".cyan().bold(), task.name);
                println!("  state: {}", task.state);
                println!(
                    "  http: {} {}",
                    task.definition.http.method, task.definition.http.url
                );
                if let Some(fields) = task.input_fields() {
                    println!("  input fields: {}", join(&fields));
                }
                if let Some(fields) = task.output_fields() {
                    println!("  output fields: {}", join(fields));
                }
                Ok(0)
            }
        },

        Commands::Run {
            file,
            gateway,
            local: _,
            input,
            tasks,
        } => {
            let dispatcher = if gateway { "http" } else { "mock" };
            let engine = engine_for(&file, tasks.as_deref(), dispatcher)?;
            let yaml = std::fs::read_to_string(&file)?;
            let result = engine.register_workflow_yaml(&yaml)?;
            if !result.is_valid() {
                for error in &result.errors {
                    println!("{} {}", "error:".red(), error);
                }
                return Ok(1);
            }
            let name = result.workflow.clone();

            println!(
                "{} Running '{}' with {} executor",
                "→".cyan(),
                name.bold(),
                if gateway { "live" } else { "mock" }
            );

            let report = engine.execute(&name, parse_inputs(&input)?).await?;

            for detail in &report.task_details {
                let mark = match detail.status {
                    strata::context::TaskStatus::Succeeded => "✓".green(),
                    strata::context::TaskStatus::Skipped => "-".yellow(),
                    _ => "✗".red(),
                };
                println!(
                    "  {mark} {} [{}] {}ms",
                    detail.step_id, detail.status, detail.duration_ms
                );
                if let Some(error) = &detail.error {
                    println!("      {error}");
                }
            }

            if report.success {
                if let Some(output) = &report.output {
                    println!("{}", "output:".cyan().bold());
                    println!(
                        "{}",
                        serde_json::to_string_pretty(output).unwrap_or_default()
                    );
                }
                println!(
                    "{} completed in {}ms",
                    "✓".green().bold(),
                    report.execution_time_ms
                );
                Ok(0)
            } else {
                println!(
                    "{} {}",
                    "✗".red().bold(),
                    report.error.as_deref().unwrap_or("execution failed")
                );
                Ok(1)
            }
        }

        Commands::Test { file, input, tasks } => {
            let engine = engine_for(&file, tasks.as_deref(), "mock")?;
            let yaml = std::fs::read_to_string(&file)?;
            let report = engine.dry_run_yaml(&yaml, parse_inputs(&input)?)?;

            if !report.valid {
                for error in &report.errors {
                    println!("{} {}", "error:".red(), error);
                }
                return Ok(1);
            }

            let plan = report.execution_plan.expect("valid dry run carries a plan");
            println!("{}", "execution plan:".cyan().bold());
            for task in &plan.tasks {
                println!(
                    "  {} -> {} (deps: {})",
                    task.id.bold(),
                    task.task_ref,
                    if task.dependencies.is_empty() {
                        "none".to_string()
                    } else {
                        task.dependencies.join(", ")
                    }
                );
                println!(
                    "      input: {}",
                    serde_json::to_string(&task.resolved_input).unwrap_or_default()
                );
            }
            println!("{}", "parallel groups:".cyan().bold());
            for (i, group) in plan.parallel_groups.iter().enumerate() {
                println!("  {i}: [{}]", group.join(", "));
            }
            Ok(0)
        }

        Commands::Debug { file, input, tasks } => debug_loop(&file, &input, tasks.as_deref()).await,

        Commands::Impact {
            task,
            remove_field,
            change_type,
            add_required,
            workflows,
            tasks,
        } => {
            let engine = WorkflowEngine::local();
            if let Some(dir) = tasks.as_deref().or(Some(Path::new("tasks"))) {
                if dir.is_dir() {
                    register_directory(&engine, dir, Some(KIND_TASK))?;
                }
            }
            register_directory(&engine, &workflows, Some(KIND_WORKFLOW))?;

            let change = match (remove_field, change_type, add_required) {
                (Some(field), None, None) => ProposedChange::RemoveField(field),
                (None, Some(field), None) => ProposedChange::ChangeFieldType(field),
                (None, None, Some(field)) => ProposedChange::AddRequiredInput {
                    field,
                    has_default: false,
                },
                _ => {
                    return Err(EngineError::other(
                        "exactly one of --remove-field, --change-type, --add-required is required",
                    ))
                }
            };

            let report = engine.impact(&task, &change);
            println!("{} {}", "impact:".cyan().bold(), report.level);
            println!("blocked: {}", report.blocked);
            if !report.affected_workflows.is_empty() {
                println!("affected workflows: {}", report.affected_workflows.join(", "));
            }
            for action in &report.suggested_actions {
                println!("  {} {}", "→".cyan(), action);
            }

            // CI contract: 0 clean, 1 breaking, 2 blocked by consumers.
            if report.blocked {
                Ok(2)
            } else if report.level >= strata::impact::ImpactLevel::Medium {
                Ok(1)
            } else {
                Ok(0)
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Build an engine and register the task manifests next to the workflow
/// file (an explicit --tasks directory wins).
fn engine_for(
    workflow_file: &Path,
    tasks_dir: Option<&Path>,
    dispatcher: &str,
) -> Result<WorkflowEngine, EngineError> {
    let engine = WorkflowEngine::new(
        create_dispatcher(dispatcher)?,
        std::sync::Arc::new(InMemoryRepository::new()),
        EngineConfig::default(),
    );

    let dir = match tasks_dir {
        Some(dir) => dir.to_path_buf(),
        None => workflow_file
            .parent()
            .unwrap_or(Path::new("."))
            .join("tasks"),
    };
    if dir.is_dir() {
        register_directory(&engine, &dir, Some(KIND_TASK))?;
    }
    Ok(engine)
}

/// Register every manifest of the wanted kind under a directory.
fn register_directory(
    engine: &WorkflowEngine,
    dir: &Path,
    kind: Option<&str>,
) -> Result<usize, EngineError> {
    let mut registered = 0;
    for entry in walkdir::WalkDir::new(dir)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }

        let yaml = std::fs::read_to_string(path)?;
        match manifest_kind(&yaml).as_deref() {
            Some(KIND_TASK) if kind.is_none() || kind == Some(KIND_TASK) => {
                let manifest = TaskManifest::from_yaml(&yaml)?;
                engine.registry().register_manifest(manifest)?;
                registered += 1;
            }
            Some(KIND_WORKFLOW) if kind.is_none() || kind == Some(KIND_WORKFLOW) => {
                // Invalid workflows are skipped here; `validate` is the
                // command that reports their issues.
                if engine
                    .register_workflow_yaml(&yaml)
                    .map(|r| r.is_valid())
                    .unwrap_or(false)
                {
                    registered += 1;
                }
            }
            _ => {}
        }
    }
    Ok(registered)
}

/// Parse `key=value` pairs; values that parse as JSON keep their type.
fn parse_inputs(pairs: &[String]) -> Result<Value, EngineError> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(EngineError::other(format!(
                "bad --input '{pair}' (expected key=value)"
            )));
        };
        let value = serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}

fn join(fields: &std::collections::BTreeSet<String>) -> String {
    fields
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// DEBUG LOOP
// ============================================================================

async fn debug_loop(
    file: &Path,
    inputs: &[String],
    tasks_dir: Option<&Path>,
) -> Result<i32, EngineError> {
    let engine = engine_for(file, tasks_dir, "mock")?;
    let yaml = std::fs::read_to_string(file)?;
    let result = engine.register_workflow_yaml(&yaml)?;
    if !result.is_valid() {
        for error in &result.errors {
            println!("{} {}", "error:".red(), error);
        }
        return Ok(1);
    }
    let registered = engine
        .workflow(&result.workflow)
        .expect("just registered");

    let input = match parse_inputs(inputs)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let config = std::sync::Arc::new(EngineConfig::default());
    let executor = strata::executor::TaskExecutor::new(create_dispatcher("mock")?, config.clone());
    let registry = std::sync::Arc::new(strata::registry::TaskRegistry::new());
    for name in engine.registry().names() {
        if let Some(task) = engine.registry().get(&name) {
            registry.register(&name, task.definition.clone())?;
        }
    }

    let mut session = DebugSession::new(
        registered.spec.clone(),
        input,
        registry,
        executor,
        config.scratch_dir.join("debug"),
    )?;

    println!(
        "{} debugging '{}' ({} level(s)); type 'help' for commands",
        "→".cyan(),
        result.workflow.bold(),
        session.plan().levels.len()
    );

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{} ", "(workflow)".cyan());
        std::io::stdout().flush().ok();
        let Some(Ok(line)) = lines.next() else {
            break;
        };

        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{} {}", "?".yellow(), message);
                continue;
            }
        };

        match command {
            DebugCommand::Quit => break,
            DebugCommand::Help => println!("{HELP_TEXT}"),
            DebugCommand::Plan => {
                for (i, level) in session.plan().levels.iter().enumerate() {
                    let marker = if i == session.next_level_index() {
                        "→"
                    } else {
                        " "
                    };
                    println!("{marker} level {i}: {}", level.join(", "));
                }
            }
            DebugCommand::Break(step) => {
                let set = session.toggle_breakpoint(&step);
                println!(
                    "breakpoint {} on '{}'",
                    if set { "set" } else { "cleared" },
                    step
                );
            }
            DebugCommand::Inject(step, value) => {
                session.inject(&step, value);
                println!("output injected for '{step}'");
            }
            DebugCommand::Step => {
                if session.done() {
                    println!("workflow complete");
                    continue;
                }
                for (step, status) in session.step_level().await? {
                    println!("  {step}: {status}");
                }
            }
            DebugCommand::Run => {
                for (step, status) in session.run_to_breakpoint().await? {
                    println!("  {step}: {status}");
                }
                if session.done() {
                    println!("workflow complete");
                } else {
                    println!("halted before level {}", session.next_level_index());
                }
            }
            DebugCommand::Context(Some(step)) => match session.context().task(&step) {
                None => println!("'{step}' has not settled yet"),
                Some(state) => {
                    println!("status: {}", state.status);
                    if let Some(output) = &state.output {
                        println!(
                            "output: {}",
                            serde_json::to_string_pretty(output).unwrap_or_default()
                        );
                    }
                    if let Some(error) = &state.error {
                        println!("error: {error}");
                    }
                }
            },
            DebugCommand::Context(None) => {
                let mut settled: BTreeMap<&str, String> = BTreeMap::new();
                for (id, state) in session.context().task_states() {
                    settled.insert(id, state.status.to_string());
                }
                if settled.is_empty() {
                    println!("no steps settled yet");
                }
                for (id, status) in settled {
                    println!("  {id}: {status}");
                }
            }
        }
    }

    Ok(0)
}
