mod config;
mod error;
mod events;
mod pool;
mod request;
mod resolver;
mod sandbox;
mod skills;
mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::BaseConfig;
use crate::events::AgentEvent;
use crate::pool::ExecutionPool;
use crate::request::ExecutionRequest;
use crate::sandbox::provider::HttpProvider;
use crate::sandbox::run::{AgentRunner, OutputStream};
use crate::store::{RunStore, DEFAULT_STORE_PATH};

fn print_help() {
    println!(
        "\
sandrunner v{}

Runs AI agents in ephemeral remote sandboxes and streams their output.

USAGE:
    sandrunner [OPTIONS] PROMPT
    sandrunner --session KEY

OPTIONS:
    -m, --model MODEL        Model to use
        --max-turns N        Maximum agent turns
    -t, --timeout SECS       Sandbox timeout in seconds [default: 300]
    -f, --file PATH          File to upload to the sandbox (repeatable)
        --json               Print raw JSON event lines
        --session KEY        Interactive mode: consecutive prompts reuse one
                             sandbox, keyed by KEY
    -h, --help               Print this help message and exit
    -V, --version            Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG              Log level filter (e.g. debug, sandrunner=debug)
    ANTHROPIC_API_KEY     Anthropic API key
    SANDBOX_API_KEY       Sandbox provider API key
    OPENROUTER_API_KEY    OpenRouter key (used as ANTHROPIC_AUTH_TOKEN)
    SANDRUNNER_TEMPLATE   Sandbox template override
    SANDBOX_API_URL       Sandbox provider API base URL

CONFIGURATION:
    sandrunner.json in the working directory supplies the base config
    (system_prompt, model, max_turns, agents, mcp_servers, skills_dir,
    allowed_tools, output_format, template_skills).

EXAMPLES:
    sandrunner \"summarize data.csv\" -f data.csv
    sandrunner --session demo             # interactive, sandbox reused
    RUST_LOG=debug sandrunner \"hello\"     # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

struct CliArgs {
    prompt: Option<String>,
    model: Option<String>,
    max_turns: Option<u64>,
    timeout_secs: Option<u64>,
    files: Vec<PathBuf>,
    json: bool,
    session: Option<String>,
}

fn parse_args() -> Result<CliArgs> {
    let mut args = CliArgs {
        prompt: None,
        model: None,
        max_turns: None,
        timeout_secs: None,
        files: Vec::new(),
        json: false,
        session: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .ok_or_else(|| anyhow!("{flag} requires a value"))
        };
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("sandrunner v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--model" | "-m" => args.model = Some(value("--model")?),
            "--max-turns" => args.max_turns = Some(value("--max-turns")?.parse()?),
            "--timeout" | "-t" => args.timeout_secs = Some(value("--timeout")?.parse()?),
            "--file" | "-f" => args.files.push(PathBuf::from(value("--file")?)),
            "--json" => args.json = true,
            "--session" => args.session = Some(value("--session")?),
            other if other.starts_with('-') => bail!("unknown option: {other}"),
            other => {
                if args.prompt.is_some() {
                    bail!("unexpected extra argument: {other}");
                }
                args.prompt = Some(other.to_string());
            }
        }
    }
    Ok(args)
}

/// Reads the files passed on the command line, keyed by their path relative
/// to the working directory (basename for files outside it).
fn read_upload_files(paths: &[PathBuf]) -> Result<Option<BTreeMap<String, String>>> {
    if paths.is_empty() {
        return Ok(None);
    }
    let cwd = std::env::current_dir()?;
    let mut files = BTreeMap::new();
    for path in paths {
        let key = path
            .strip_prefix(&cwd)
            .ok()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(path.file_name().unwrap_or(path.as_os_str())));
        let key = key.to_string_lossy().replace('\\', "/");
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("cannot read {}: {e}", path.display()))?;
        files.insert(key, content);
    }
    Ok(Some(files))
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Renders one event line the way a terminal user wants to see it:
/// assistant text on stdout, markers and the result footer on stderr.
fn print_event(line: &str) {
    let Some(event) = AgentEvent::parse(line) else {
        println!("{line}");
        return;
    };

    match event {
        AgentEvent::Assistant { message } => {
            let blocks = message
                .get("content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            print!("{text}");
                        }
                    }
                    Some("tool_use") => {
                        let name = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown");
                        eprint!("[tool: {name}]");
                    }
                    _ => {}
                }
            }
        }
        AgentEvent::Result {
            subtype,
            num_turns,
            cost_usd,
            structured_output,
            ..
        } => {
            let turns = num_turns.map_or("?".to_string(), |t| t.to_string());
            let cost = cost_usd.map_or("n/a".to_string(), |c| format!("${c:.4}"));
            eprintln!(
                "\n--- Result: {} | turns: {turns} | cost: {cost} ---",
                subtype.as_deref().unwrap_or("unknown")
            );
            if let Some(output) = structured_output {
                if let Ok(pretty) = serde_json::to_string_pretty(&output) {
                    println!("{pretty}");
                }
            }
        }
        AgentEvent::Error { error } => eprintln!("Error: {error}"),
        // user/stderr/warning/system: server-side only
        _ => {}
    }
}

/// Drains one execution's output: prints every line and records the terminal
/// result or error in the run store.
async fn consume_output(
    mut output: OutputStream,
    run_id: &str,
    json: bool,
    store: &RunStore,
) -> bool {
    let start = Instant::now();
    let mut completed = false;
    let mut model: Option<String> = None;

    while let Some(line) = output.next().await {
        if json {
            println!("{line}");
        } else {
            print_event(&line);
        }

        match AgentEvent::parse(&line) {
            Some(AgentEvent::System {
                subtype,
                model: init_model,
            }) if subtype.as_deref() == Some("init") => {
                model = init_model.or(model);
            }
            Some(AgentEvent::Result {
                num_turns,
                cost_usd,
                model: result_model,
                ..
            }) => {
                let duration = start.elapsed().as_secs_f64();
                store.complete(
                    run_id,
                    cost_usd,
                    num_turns,
                    Some((duration * 10.0).round() / 10.0),
                    result_model.or(model.clone()).as_deref(),
                );
                completed = true;
            }
            Some(AgentEvent::Error { error }) => {
                store.fail(run_id, &error, Some(start.elapsed().as_secs_f64()));
                completed = false;
            }
            _ => {}
        }
    }
    completed
}

/// Interactive mode: consecutive prompts on one key, executed through the
/// pool so the sandbox is reused between them.
async fn run_session(
    runner: Arc<AgentRunner>,
    store: &RunStore,
    args: &CliArgs,
    key: &str,
) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    eprintln!("Session {key:?} — consecutive prompts reuse one sandbox. Ctrl-D to exit.");
    let pool = ExecutionPool::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "exit" || prompt == "quit" {
            break;
        }

        let mut request = ExecutionRequest::new(prompt);
        request.model = args.model.clone();
        request.max_turns = args.max_turns;
        request.timeout_secs = args.timeout_secs;
        if let Err(e) = request.validate() {
            eprintln!("Error: {e}");
            continue;
        }

        let run_id = new_run_id();
        store.create(&run_id, prompt, request.model.as_deref(), 0);
        let output = pool
            .execute(runner.clone(), key, request, &run_id)
            .await;
        consume_output(output, &run_id, args.json, store).await;
        println!();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first, so the log filter and API keys can live there
    dotenvy::dotenv().ok();

    let args = parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandrunner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir()?;
    let base = BaseConfig::load(&cwd);
    let store = RunStore::open(DEFAULT_STORE_PATH);
    let runner = Arc::new(AgentRunner::new(Arc::new(HttpProvider::new()), base));

    if let Some(key) = &args.session {
        return run_session(runner, &store, &args, key).await;
    }

    let Some(prompt) = args.prompt.clone() else {
        print_help();
        std::process::exit(2);
    };

    let mut request = ExecutionRequest::new(&prompt);
    request.model = args.model.clone();
    request.max_turns = args.max_turns;
    request.timeout_secs = args.timeout_secs;
    request.files = read_upload_files(&args.files)?;
    request.validate()?;

    let run_id = new_run_id();
    let files_count = request.files.as_ref().map_or(0, |f| f.len());
    store.create(&run_id, &prompt, request.model.as_deref(), files_count);
    info!("[{run_id}] Running one-shot query");

    match runner.launch(&request, &run_id, false).await {
        Ok(run) => {
            consume_output(run.output, &run_id, args.json, &store).await;
            Ok(())
        }
        Err(e) => {
            store.fail(&run_id, &e.to_string(), None);
            Err(e.into())
        }
    }
}
