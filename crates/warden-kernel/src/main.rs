use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;
use warden_exec::{check_binaries, classify, required_binaries, ErrorExtractor, PathResolver, StackProfileRegistry};
use warden_kernel::{
    verify_chain, GitVcs, MergeGuard, MergeGuardContext, TransitionRecord, Vcs, WardenConfig, VERSION,
};
use warden_plan::{check_clean_tree, CommandText, InputSnapshot, PlanEnvelope};

fn file_arg() -> Arg {
    Arg::new("file")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("JSON file to read")
}

fn repo_arg() -> Arg {
    Arg::new("repo")
        .long("repo")
        .default_value(".")
        .value_parser(value_parser!(PathBuf))
        .help("Repository root")
}

fn cli() -> Command {
    Command::new("warden")
        .version(VERSION)
        .about("Governance kernel for autonomous code modification")
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("classify")
                .about("Show the timeout bucket, background flag and port for a command")
                .arg(Arg::new("command").required(true).help("Command literal")),
        )
        .subcommand(
            Command::new("extract")
                .about("Extract error locations from tool output")
                .arg(Arg::new("stack").long("stack").help("Stack tag to prefer"))
                .arg(
                    Arg::new("file")
                        .value_parser(value_parser!(PathBuf))
                        .help("Output file; stdin when omitted"),
                ),
        )
        .subcommand(
            Command::new("snapshot-hash")
                .about("Hash an input snapshot")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("verify-envelope")
                .about("Recompute a frozen plan's hash")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("precheck")
                .about("List binaries a plan needs that are not on PATH")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("check-merge")
                .about("Evaluate the merge guard for a recorded context")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("verify-log")
                .about("Verify the hash chain of an exported audit log")
                .arg(file_arg()),
        )
        .subcommand(
            Command::new("status")
                .about("Show working-tree changes and whether planning could start")
                .arg(repo_arg()),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(repo_arg()),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn path_of(args: &ArgMatches, name: &str) -> anyhow::Result<PathBuf> {
    args.get_one::<PathBuf>(name)
        .cloned()
        .with_context(|| format!("missing <{name}>"))
}

/// Exit code for the subcommand
fn dispatch(matches: &ArgMatches) -> anyhow::Result<i32> {
    match matches.subcommand() {
        Some(("classify", args)) => {
            let literal = args.get_one::<String>("command").context("missing <command>")?;
            let text = CommandText::parse(literal.as_str())?;
            let class = classify(&text);
            println!("bucket:     {:?}", class.bucket);
            println!("background: {}", class.background);
            match class.port {
                Some(port) => println!("port:       {port}"),
                None => println!("port:       -"),
            }
            Ok(0)
        }
        Some(("extract", args)) => {
            let output = match args.get_one::<PathBuf>("file") {
                Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let stack = args.get_one::<String>("stack").map(String::as_str);
            let locations = ErrorExtractor::new().extract(&output, stack);
            println!("{}", serde_json::to_string_pretty(&locations)?);
            Ok(i32::from(locations.is_empty()))
        }
        Some(("snapshot-hash", args)) => {
            let snapshot: InputSnapshot = read_json(&path_of(args, "file")?)?;
            println!("{}", snapshot.hash());
            Ok(0)
        }
        Some(("verify-envelope", args)) => {
            let envelope: PlanEnvelope = read_json(&path_of(args, "file")?)?;
            match envelope.verify_integrity() {
                Ok(()) => {
                    println!("ok {}", envelope.plan_envelope_hash());
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("envelope rejected: {e}");
                    Ok(1)
                }
            }
        }
        Some(("precheck", args)) => {
            let envelope: PlanEnvelope = read_json(&path_of(args, "file")?)?;
            let profile = StackProfileRegistry::new().lookup(&envelope.content().stack);
            let required = required_binaries(profile, envelope.content().commands());
            match check_binaries(&PathResolver::from_env(), &required) {
                Ok(()) => {
                    println!("{} binaries available", required.len());
                    Ok(0)
                }
                Err(missing) => {
                    for m in &missing {
                        eprintln!("missing {m}");
                    }
                    Ok(1)
                }
            }
        }
        Some(("check-merge", args)) => {
            let ctx: MergeGuardContext = read_json(&path_of(args, "file")?)?;
            let check = MergeGuard::check(&ctx);
            println!("{}", serde_json::to_string_pretty(&check)?);
            Ok(i32::from(!check.passed()))
        }
        Some(("verify-log", args)) => {
            let records: Vec<TransitionRecord> = read_json(&path_of(args, "file")?)?;
            match verify_chain(&records) {
                Ok(()) => {
                    println!("chain intact: {} records", records.len());
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("{e}");
                    Ok(1)
                }
            }
        }
        Some(("status", args)) => {
            let repo = path_of(args, "repo")?;
            let config = WardenConfig::discover(&repo)?;
            let vcs = GitVcs::new(&repo)
                .with_remote(config.tracked_remote())
                .with_main_branch(config.main_branch.clone());
            let changes = vcs.status()?;
            for change in &changes {
                println!("{change}");
            }
            match check_clean_tree(&changes, &config.ignore_file) {
                Ok(()) => Ok(0),
                Err(dirty) => {
                    eprintln!("{dirty}");
                    Ok(1)
                }
            }
        }
        Some(("config", args)) => {
            let config = WardenConfig::discover(path_of(args, "repo")?)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(0)
        }
        Some((other, _)) => bail!("unknown subcommand {other}"),
        None => Ok(2),
    }
}

fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let code = match dispatch(&matches) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            2
        }
    };
    std::process::exit(code);
}
