//! `patchgate` command-line entry point.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use signal_hook::consts::{SIGINT, SIGTERM};

use patchgate::core::branch::normalize;
use patchgate::core::types::{ChangeRequest, RunMode};
use patchgate::exit_codes;
use patchgate::io::config::{PatchgateConfig, config_path, load_with_env};
use patchgate::io::proposer::{ALLOWED_PREFIXES_ENV, CommandProposer};
use patchgate::io::publish::GhCli;
use patchgate::io::tools::{self, DEFAULT_SEARCH_MAX};
use patchgate::io::workspace::KeepPolicy;
use patchgate::logging;
use patchgate::pipeline::{CancelToken, Pipeline, PipelineOptions, repository_root};

#[derive(Parser)]
#[command(
    name = "patchgate",
    version,
    about = "Apply agent-proposed changes in an isolated worktree, gated by tests"
)]
struct Cli {
    /// Source repository (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,
    /// Config file (defaults to `<repo>/.patchgate/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline for a change request.
    Solve {
        /// Free-form description of the change.
        #[arg(required = true, num_args = 1..)]
        issue: Vec<String>,
        /// Branch name override (normalized).
        #[arg(short = 'b', long)]
        branch: Option<String>,
        /// Stop after verification (default).
        #[arg(long, conflicts_with = "apply")]
        dry_run: bool,
        /// Commit, push and open a pull request.
        #[arg(long)]
        apply: bool,
        /// Run the test command (default).
        #[arg(long, conflicts_with = "no_tests")]
        tests: bool,
        #[arg(long)]
        no_tests: bool,
        /// Open a pull request after pushing (default).
        #[arg(long, conflicts_with = "no_pr")]
        pr: bool,
        #[arg(long)]
        no_pr: bool,
        /// Base branch for the pull request.
        #[arg(long)]
        base: Option<String>,
        /// When to keep the worktree after the run.
        #[arg(long, value_enum)]
        keep_workspace: Option<KeepArg>,
    },
    /// File tools for the proposer. Each prints one JSON object.
    Tool {
        #[command(subcommand)]
        tool: ToolCommand,
    },
    /// Print the branch name derived from the given text.
    BranchName {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ToolCommand {
    Read {
        #[arg(long)]
        root: PathBuf,
        path: String,
    },
    /// Write a file under the allow-list. Content from `--content` or stdin.
    Write {
        #[arg(long)]
        root: PathBuf,
        path: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        no_backup: bool,
    },
    Diff {
        name: String,
        old_file: PathBuf,
        new_file: PathBuf,
    },
    List {
        #[arg(long)]
        root: PathBuf,
        subdir: Option<String>,
    },
    Search {
        #[arg(long)]
        root: PathBuf,
        pattern: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_MAX)]
        max: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KeepArg {
    Never,
    #[value(name = "on_failure")]
    OnFailure,
    Always,
}

impl From<KeepArg> for KeepPolicy {
    fn from(arg: KeepArg) -> Self {
        match arg {
            KeepArg::Never => KeepPolicy::Never,
            KeepArg::OnFailure => KeepPolicy::OnFailure,
            KeepArg::Always => KeepPolicy::Always,
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Solve {
            issue,
            branch,
            dry_run: _,
            apply,
            tests: _,
            no_tests,
            pr: _,
            no_pr,
            base,
            keep_workspace,
        } => {
            let repo = resolve_repo(cli.repo.as_deref())?;
            let mut config = load_config(cli.config.as_deref(), &repo)?;
            if let Some(base) = base {
                config.base_branch = base;
            }
            if let Some(keep) = keep_workspace {
                config.workspace.keep = keep.into();
            }
            config.validate()?;

            let instruction = issue.join(" ");
            if instruction.trim().is_empty() {
                bail!("issue text must not be empty");
            }
            let mut request = ChangeRequest::new(instruction);
            if let Some(branch) = branch {
                request = request.with_branch(branch);
            }
            let options = PipelineOptions {
                mode: if apply { RunMode::Apply } else { RunMode::DryRun },
                run_tests: !no_tests,
                open_pr: !no_pr,
            };
            cmd_solve(&config, &repo, &request, &options)
        }
        Command::Tool { tool } => cmd_tool(tool, cli.config.as_deref(), cli.repo.as_deref()),
        Command::BranchName { text } => {
            println!("{}", normalize(&text.join(" ")));
            Ok(exit_codes::OK)
        }
    }
}

fn resolve_repo(repo: Option<&Path>) -> Result<PathBuf> {
    let start = match repo {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    Ok(repository_root(&start)?)
}

fn load_config(explicit: Option<&Path>, repo: &Path) -> Result<PatchgateConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_path(repo));
    load_with_env(&path).with_context(|| format!("load config {}", path.display()))
}

fn cmd_solve(
    config: &PatchgateConfig,
    repo: &Path,
    request: &ChangeRequest,
    options: &PipelineOptions,
) -> Result<i32> {
    let cancel = CancelToken::new();
    for signal in [SIGINT, SIGTERM] {
        // A second signal while the first is pending exits immediately.
        signal_hook::flag::register_conditional_shutdown(signal, exit_codes::FAILED, cancel.flag())
            .context("install signal handler")?;
        signal_hook::flag::register(signal, cancel.flag()).context("install signal handler")?;
    }

    let proposer = CommandProposer::new(config.proposer.command.clone(), config.proposer_timeout())
        .output_limit(config.output_limit_bytes);
    let host = GhCli::new(config.hosting.command.clone(), config.hosting_timeout());
    let report = Pipeline::new(config, repo, &proposer, &host)
        .with_cancel(cancel)
        .run(request, options);

    print!("{}", report.render());
    Ok(if report.is_success() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

fn cmd_tool(tool: ToolCommand, config: Option<&Path>, repo: Option<&Path>) -> Result<i32> {
    match tool {
        ToolCommand::Read { root, path } => print_json(&tools::read(&root, &path)?)?,
        ToolCommand::Write {
            root,
            path,
            content,
            no_backup,
        } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("read content from stdin")?;
                    buf
                }
            };
            let allowed = tool_allow_list(config, repo, &root)?;
            print_json(&tools::write(&root, &path, &content, &allowed, !no_backup)?)?;
        }
        ToolCommand::Diff {
            name,
            old_file,
            new_file,
        } => {
            let old = read_optional(&old_file)?;
            let new = read_optional(&new_file)?;
            print_json(&serde_json::json!({ "diff": tools::diff(&name, &old, &new) }))?;
        }
        ToolCommand::List { root, subdir } => {
            print_json(&serde_json::json!({ "files": tools::list(&root, subdir.as_deref())? }))?
        }
        ToolCommand::Search { root, pattern, max } => print_json(
            &serde_json::json!({ "matches": tools::search(&root, &pattern, max)? }),
        )?,
    }
    Ok(exit_codes::OK)
}

/// Allow-list for `tool write`: the proposer's environment first, then config.
fn tool_allow_list(config: Option<&Path>, repo: Option<&Path>, root: &Path) -> Result<Vec<String>> {
    if let Ok(raw) = std::env::var(ALLOWED_PREFIXES_ENV) {
        let prefixes: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if !prefixes.is_empty() {
            return Ok(prefixes);
        }
    }
    let base = repo.unwrap_or(root);
    Ok(load_config(config, base)?.allowed_prefixes)
}

/// Missing files read as empty, so creations and deletions can be diffed.
fn read_optional(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}
