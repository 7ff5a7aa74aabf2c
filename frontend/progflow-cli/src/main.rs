mod cli;
mod renderer;

use std::path::Path;

use progflow_core::error::HandlerKind;
use progflow_core::programs::{Program, ProgramLoader, RunRequest};
use progflow_core::{EngineConfig, Error, ProgramEngine, Result};
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::renderer::Renderer;

fn main() {
    if let Err(error) = run() {
        eprintln!("progflow failed: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = cli::Cli::parse_args();
    let mut config = progflow_core::config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    progflow_core::logging::init_tracing(&config.logging);

    match args.command {
        cli::Command::Validate { path, output } => validate_programs(config, &path, output),
        cli::Command::Run {
            path,
            program,
            version,
            context,
            tenant,
            user,
            vars,
            events,
            debug,
            follow,
            output,
        } => {
            let program = select_program(&path, program.as_deref(), version)?;
            let mut request = match context {
                Some(context) => read_request(&context)?,
                None => RunRequest::for_tenant(tenant),
            };
            if user.is_some() {
                request.user_id = user;
            }
            for assignment in &vars {
                let (name, value) = parse_variable(assignment)?;
                request.variables.insert(name, value);
            }
            request.events.extend(events);
            request.debug_mode |= debug;

            let engine = ProgramEngine::from_config(config)?;
            let runtime = tokio::runtime::Runtime::new().map_err(|err| {
                Error::Config(format!("failed to create tokio runtime: {err}"))
            })?;
            runtime.block_on(run_program(
                &engine,
                &program,
                request,
                follow,
                Renderer::new(output),
            ))
        }
        cli::Command::Handlers => {
            let engine = ProgramEngine::from_config(config)?;
            for kind in [HandlerKind::Step, HandlerKind::Trigger, HandlerKind::Action] {
                println!("{kind} handlers:");
                for type_id in engine.registry().list(kind) {
                    println!("- {type_id}");
                }
            }
            Ok(())
        }
    }
}

fn validate_programs(config: EngineConfig, path: &Path, output: OutputFormat) -> Result<()> {
    let engine = ProgramEngine::from_config(config)?;
    let renderer = Renderer::new(output);
    let programs = ProgramLoader::load_path(path)?;
    let mut invalid = 0usize;
    for program in &programs {
        if renderer.render_issues(program, &engine.validate(program)) {
            invalid += 1;
        }
    }
    if invalid > 0 {
        return Err(Error::Validation(format!(
            "{invalid} of {} program(s) have blocking issues",
            programs.len()
        )));
    }
    Ok(())
}

fn select_program(path: &Path, program_id: Option<&str>, version: Option<u32>) -> Result<Program> {
    let candidates: Vec<Program> = ProgramLoader::load_path(path)?
        .into_iter()
        .filter(|program| program_id.map_or(true, |id| program.id == id))
        .filter(|program| version.map_or(true, |version| program.version == version))
        .collect();

    let ids: Vec<String> = candidates
        .iter()
        .map(|program| format!("{} v{}", program.id, program.version))
        .collect();
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (Some(program), None) => Ok(program),
        (None, _) => Err(Error::NotFound(format!(
            "no matching program under '{}'",
            path.display()
        ))),
        (Some(_), Some(_)) => Err(Error::Validation(format!(
            "several programs match ({}); pass --program and --version",
            ids.join(", ")
        ))),
    }
}

fn read_request(path: &Path) -> Result<RunRequest> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!("failed to read run context '{}': {err}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        Error::Serialization(format!("invalid run context '{}': {err}", path.display()))
    })
}

fn parse_variable(assignment: &str) -> Result<(String, Value)> {
    let (name, raw) = assignment.split_once('=').ok_or_else(|| {
        Error::Validation(format!("variable '{assignment}' must look like name=value"))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation(format!(
            "variable '{assignment}' has an empty name"
        )));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
    Ok((name.to_owned(), value))
}

async fn run_program(
    engine: &ProgramEngine,
    program: &Program,
    request: RunRequest,
    follow: bool,
    renderer: Renderer,
) -> Result<()> {
    let debug = request.debug_mode;
    let (handle, mut events) = engine.start_following(program, request)?;
    let run_id = handle.run_id().to_owned();
    let cancel = handle.cancellation_token();
    let mut join = std::pin::pin!(handle.join());
    let mut interrupted = false;
    let mut following = follow;

    let result = loop {
        tokio::select! {
            outcome = &mut join => break outcome?,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(err) = signal {
                    tracing::warn!("failed to listen for ctrl-c: {err}");
                }
                eprintln!("Cancelling run {run_id}...");
                interrupted = true;
                cancel.cancel();
            }
            event = events.recv(), if following => match event {
                Some(event) => renderer.render_event(&event),
                None => following = false,
            },
        }
    };

    if follow {
        while let Some(event) = events.try_recv() {
            renderer.render_event(&event);
        }
    } else if debug {
        for event in engine.get_trace(&run_id).unwrap_or_default() {
            renderer.render_event(&event);
        }
    }
    renderer.render_result(&result);

    if result.is_completed() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "run {run_id} did not complete: {}",
            result
                .failure_reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown".to_owned())
        )))
    }
}
