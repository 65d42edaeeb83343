use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};

use modlink::config::AppConfig;
use modlink::logging::init_tracing;
use modlink::manager::ProcessLauncher;
use modlink::module::ModuleRegistry;

const USAGE: &str = "\
Usage: modlink manager [--config <file>]
       modlink module --name <module> [--factory tcp] [--config <file>]

Options:
  --config <file>    JSON configuration file [default: built-in defaults]
  --name <module>    Module to host (module role only)
  --factory <name>   Transport of the module host [default: tcp]";

#[derive(Debug, PartialEq)]
enum Role {
    Manager,
    Module { name: String, factory: String },
}

#[derive(Debug, PartialEq)]
struct Args {
    role: Role,
    config: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let role = args.get(1).ok_or("missing role: manager or module")?;
    let mut name: Option<String> = None;
    let mut factory = "tcp".to_string();
    let mut config: Option<PathBuf> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(args.get(i).ok_or("--config requires a value")?));
            }
            "--name" => {
                i += 1;
                name = Some(args.get(i).ok_or("--name requires a value")?.clone());
            }
            "--factory" => {
                i += 1;
                factory = args.get(i).ok_or("--factory requires a value")?.clone();
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    let role = match role.as_str() {
        "manager" => Role::Manager,
        "module" => Role::Module {
            name: name.ok_or("module role requires --name")?,
            factory,
        },
        "--help" | "-h" => return Err(String::new()),
        other => return Err(format!("unknown role '{other}', expected 'manager' or 'module'")),
    };
    Ok(Args { role, config })
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = ?e, "modlink failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let app = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let registry = ModuleRegistry::builtin();

    match args.role {
        Role::Manager => {
            let mut launcher = ProcessLauncher::current_exe().context("locating own executable")?;
            if let Some(path) = &args.config {
                launcher = launcher.with_config_path(path);
            }
            modlink::run_manager(app, registry, Arc::new(launcher)).await?;
        }
        Role::Module { name, factory } => {
            if factory != "tcp" {
                bail!("unsupported module factory '{factory}'");
            }
            modlink::run_module(&app, &registry, &name).await?;
        }
    }
    Ok(())
}
