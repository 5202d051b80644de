use crate::config::Config;
use crate::driver::{Driver, Request, TargetKind, TargetRef};
use crate::error::Error;
use crate::run::{self, Run};
use anyhow::{anyhow, Context};
use argh::FromArgs;
use camino::Utf8PathBuf;
use std::fmt::Display;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// What to do with a plan instead of running it.
enum Show {
    Plan,
    Commands,
    Dot,
}

impl FromStr for Show {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Show::Plan),
            "commands" => Ok(Show::Commands),
            "dot" => Ok(Show::Dot),
            _ => Err("unknown view (expected plan, commands, or dot)".to_string()),
        }
    }
}

impl Display for Show {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Show::Plan => write!(f, "plan"),
            Show::Commands => write!(f, "commands"),
            Show::Dot => write!(f, "dot"),
        }
    }
}

#[derive(FromArgs)]
/// Build an FPGA design, rerunning only the stages whose inputs changed.
struct MakeArgs {
    /// targets to build, and NAME=value configuration overrides (like MODE=debug)
    #[argh(positional)]
    args: Vec<String>,

    /// show the plan (plan, commands, or dot) instead of running it
    #[argh(option)]
    show: Option<Show>,

    /// rerun every stage, fresh or not
    #[argh(switch, short = 'B')]
    force: bool,

    /// project directory to build in
    #[argh(option, short = 'C')]
    dir: Option<Utf8PathBuf>,

    /// log every decision and command line
    #[argh(switch, short = 'v')]
    verbose: bool,
}

/// Split the positional arguments into targets and `NAME=value` assignments.
fn split_args(args: &[String]) -> (Vec<&str>, Vec<(String, String)>) {
    let mut targets = vec![];
    let mut overrides = vec![];
    for arg in args {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                overrides.push((name.to_string(), value.to_string()))
            }
            _ => targets.push(arg.as_str()),
        }
    }
    (targets, overrides)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second initialization (as in tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

/// Print the targets a driver offers.
pub fn show_help(driver: &Driver) {
    println!("targets:");
    let width = driver
        .targets
        .values()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(0);
    for target in driver.targets.values() {
        println!(
            "  {:width$}  {}",
            target.name,
            target.description,
            width = width
        );
    }
    println!();
    println!("variables (environment or NAME=value arguments):");
    println!("  PROJ_NAME  design to build (default led_blink)");
    println!("  MODE       release or debug (default release)");
}

/// Print the resolved configuration.
pub fn show_info(config: &Config) {
    let build = &config.build;
    println!("project:    {}", build.project);
    println!("mode:       {}", build.mode);
    println!("device:     {} ({})", build.board.device, build.board.package);
    println!("pins:       {}", build.board.pcf);
    println!("root:       {}", build.root);
    println!("sources:    {}", build.rtl_dir.join(&build.project));
    println!("build dir:  {}", build.build_dir);
    println!("sim dir:    {}", build.sim_dir);
    if let Ok(tools) = config
        .data
        .extract_inner::<std::collections::BTreeMap<String, String>>("tools")
    {
        for (tool, path) in tools {
            println!("tool:       {} = {}", tool, path);
        }
    }
}

/// Carry out one target.
fn make(
    driver: &Driver,
    target: TargetRef,
    config: &Config,
    args: &MakeArgs,
) -> anyhow::Result<()> {
    match &driver.targets[target].kind {
        TargetKind::Help => show_help(driver),
        TargetKind::Info => show_info(config),
        TargetKind::Clean(_) => {
            if args.show.is_none() {
                run::clean_target(driver, target, config)?;
            }
        }
        TargetKind::Stages(_) => {
            let req = Request {
                target,
                force: args.force,
            };
            let plan = driver.resolve(&req, config)?;
            let mut run = Run::new(driver, plan, config);
            match args.show {
                Some(Show::Plan) => run.show(),
                Some(Show::Commands) => run.show_commands()?,
                Some(Show::Dot) => run.show_dot()?,
                None => {
                    if let Err(err) = run.execute() {
                        let skipped = run.not_attempted();
                        if !skipped.is_empty() {
                            warn!("not attempted: {}", skipped.join(", "));
                        }
                        return Err(err.into());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Parse the command line and build the requested targets. `app` names the configuration files
/// (`<app>.toml`).
pub fn cli(app: &str, driver: &Driver) -> anyhow::Result<()> {
    let args: MakeArgs = argh::from_env();
    init_logging(args.verbose);

    let (names, overrides) = split_args(&args.args);
    let config = Config::load(app, args.dir.as_deref(), &overrides)
        .context("invalid configuration")?;

    // Look up every target before doing anything.
    let targets = if names.is_empty() {
        vec![driver
            .default_target
            .ok_or(anyhow!("no target given and no default target"))?]
    } else {
        names
            .iter()
            .map(|name| {
                driver
                    .get_target(name)
                    .ok_or_else(|| Error::UnknownTarget(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    for target in targets {
        make(driver, target, &config, &args)
            .with_context(|| format!("target `{}` failed", driver.targets[target].name))?;
    }
    Ok(())
}

/// The exit status for an error from `cli`: a failing tool's own status if there was one.
pub fn exit_status(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map_or(1, Error::exit_status)
}

/// Run the command line for `driver` and report any failure.
pub fn main(app: &str, driver: &Driver) -> ExitCode {
    match cli(app, driver) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(exit_status(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_and_assignments() {
        let args: Vec<String> = ["clean", "MODE=debug", "build", "board.device=up5k", "=x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (targets, overrides) = split_args(&args);
        assert_eq!(targets, vec!["clean", "build", "=x"]);
        assert_eq!(
            overrides,
            vec![
                ("MODE".to_string(), "debug".to_string()),
                ("board.device".to_string(), "up5k".to_string())
            ]
        );
    }

    #[test]
    fn exit_code_comes_from_the_failing_tool() {
        let err = anyhow::Error::from(Error::StageFailed {
            stage: "pnr".into(),
            code: Some(4),
        })
        .context("target `build` failed");
        assert_eq!(exit_status(&err), 4);
        assert_eq!(exit_status(&anyhow!("bad config")), 1);
    }
}
