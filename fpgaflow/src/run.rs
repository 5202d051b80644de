use crate::config::{BuildConfig, Config};
use crate::driver::{
    Decision, Driver, Plan, SetupRef, StageFiles, StageRef, Step, TargetKind, TargetRef,
};
use crate::error::{Error, Result};
use crate::report;
use camino::{Utf8Path, Utf8PathBuf};
use cranelift_entity::SecondaryMap;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::process::Command;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Where a stage is in its lifecycle. `Skipped`, `Succeeded`, and `Failed` are final; a stage
/// still `Pending` when a run ends was never attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageStatus {
    #[default]
    Pending,
    Skipped,
    Running,
    Succeeded,
    Failed,
}

impl Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Skipped => write!(f, "skipped"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

pub struct Run<'a> {
    pub driver: &'a Driver,
    pub plan: Plan,
    pub config: &'a Config,
    status: SecondaryMap<StageRef, StageStatus>,
}

impl<'a> Run<'a> {
    pub fn new(driver: &'a Driver, plan: Plan, config: &'a Config) -> Self {
        Self {
            driver,
            plan,
            config,
            status: SecondaryMap::new(),
        }
    }

    /// Just print the plan.
    pub fn show(&self) {
        println!("{}:", self.plan.target);
        for step in &self.plan.steps {
            let stage = &self.driver.stages[step.stage];
            match &step.decision {
                Decision::Fresh => println!("  {}: up to date", stage.name),
                Decision::Run(reason) => println!("  {}: run ({})", stage.name, reason),
            }
        }
    }

    /// Print a GraphViz representation of the whole graph, with the plan highlighted.
    pub fn show_dot(&self) -> Result<()> {
        let env = Env::new(self.config);
        println!("digraph plan {{");
        println!("  node[shape=box];");

        // Show all artifacts.
        for (artifact_ref, artifact) in self.driver.artifacts.iter() {
            let path = self.driver.artifact_path(&env, artifact_ref)?;
            println!(
                "  {} [label=\"{}\\n{}\"];",
                artifact_ref, artifact.name, path
            );
        }

        // Show all stages, with edges from their inputs and to their outputs.
        for (stage_ref, stage) in self.driver.stages.iter() {
            print!("  {} [label=\"{}\" shape=ellipse", stage_ref, stage.name);
            if let Some(step) = self.plan.steps.iter().find(|s| s.stage == stage_ref) {
                print!(" penwidth=3");
                if step.decision != Decision::Fresh {
                    print!(" fillcolor=gray style=filled");
                }
            }
            println!("];");
            for input in &stage.inputs {
                println!("  {} -> {};", input, stage_ref);
            }
            for output in &stage.outputs {
                println!("  {} -> {};", stage_ref, output);
            }
        }

        println!("}}");
        Ok(())
    }

    /// Work out the command line for every stale stage without running anything.
    pub fn commands(&self) -> Result<Vec<(StageRef, Invocation)>> {
        let mut env = Env::new(self.config);
        let mut done_setups = HashSet::<SetupRef>::new();
        let mut commands = vec![];
        for step in self.plan.stale() {
            let stage = &self.driver.stages[step.stage];
            self.setup(&mut env, &mut done_setups, &stage.setups)?;
            if let Some(invocation) = stage.emit.command(&env, &step.files)? {
                commands.push((step.stage, invocation));
            }
        }
        Ok(commands)
    }

    /// Print the commands the run would execute.
    pub fn show_commands(&self) -> Result<()> {
        for (stage, invocation) in self.commands()? {
            println!("# {}", self.driver.stages[stage].name);
            println!("{}", invocation);
        }
        Ok(())
    }

    /// Run every stale stage in order, stopping at the first failure.
    pub fn execute(&mut self) -> Result<()> {
        let mut env = Env::new(self.config);
        let mut done_setups = HashSet::<SetupRef>::new();

        for step in &self.plan.steps {
            if step.decision == Decision::Fresh {
                debug!("{}: up to date", self.driver.stages[step.stage].name);
                self.status[step.stage] = StageStatus::Skipped;
                self.summarize(step);
                continue;
            }

            self.status[step.stage] = StageStatus::Running;
            if let Err(err) = self.run_step(&mut env, &mut done_setups, step) {
                self.status[step.stage] = StageStatus::Failed;
                self.discard_outputs(step);
                return Err(err);
            }
            self.status[step.stage] = StageStatus::Succeeded;
            self.summarize(step);
        }

        Ok(())
    }

    fn setup(
        &self,
        env: &mut Env,
        done_setups: &mut HashSet<SetupRef>,
        setups: &[SetupRef],
    ) -> Result<()> {
        for setup in setups {
            if done_setups.insert(*setup) {
                let setup = &self.driver.setups[*setup];
                debug!("setting up {}", setup.name);
                setup.emit.setup(env)?;
            }
        }
        Ok(())
    }

    fn run_step(
        &self,
        env: &mut Env,
        done_setups: &mut HashSet<SetupRef>,
        step: &Step,
    ) -> Result<()> {
        let stage = &self.driver.stages[step.stage];
        let build = &self.config.build;

        self.setup(env, done_setups, &stage.setups)?;
        env.write_files()?;
        for output in &step.files.outputs {
            if let Some(parent) = build.path(output).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("{}", stage.label);
        match stage.emit.command(env, &step.files)? {
            Some(invocation) => {
                debug!("{}", invocation);
                let status = invocation
                    .command(&build.root)?
                    .status()
                    .map_err(|err| launch_error(&invocation.program, err))?;
                if !status.success() {
                    return Err(Error::StageFailed {
                        stage: stage.name.clone(),
                        code: status.code(),
                    });
                }
            }
            None => debug!("{}: nothing to run", stage.name),
        }

        for output in &step.files.outputs {
            if !build.path(output).exists() {
                return Err(Error::MissingExpectedOutput {
                    stage: stage.name.clone(),
                    path: output.clone(),
                });
            }
        }
        Ok(())
    }

    /// Remove whatever a failed step left behind, so the next run cannot take it for fresh.
    fn discard_outputs(&self, step: &Step) {
        for output in &step.files.outputs {
            let path = self.config.build.path(output);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed partial output {}", path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("could not remove partial output {}: {}", path, err),
            }
        }
    }

    /// Print summaries of any reports this step produced.
    fn summarize(&self, step: &Step) {
        let stage = &self.driver.stages[step.stage];
        for (artifact, path) in stage.outputs.iter().zip(&step.files.outputs) {
            if let Some(summary) = &self.driver.artifacts[*artifact].summary {
                report::print_summary(summary.as_ref(), &self.config.build.path(path));
            }
        }
    }

    pub fn status(&self, stage: StageRef) -> StageStatus {
        self.status[stage]
    }

    /// The stages in the plan that were left untouched by a failure.
    pub fn not_attempted(&self) -> Vec<&str> {
        self.plan
            .steps
            .iter()
            .filter(|step| self.status[step.stage] == StageStatus::Pending)
            .map(|step| self.driver.stages[step.stage].name.as_str())
            .collect()
    }
}

fn launch_error(program: &str, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::ToolNotFound {
            tool: program.to_string(),
        }
    } else {
        Error::Launch {
            program: program.to_string(),
            source: err,
        }
    }
}

/// Remove a directory tree. A directory that is already gone is fine.
pub fn clean(dir: &Utf8Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            info!("removed {}", dir);
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist", dir);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Remove the directories named by a clean target.
pub fn clean_target(driver: &Driver, target: TargetRef, config: &Config) -> Result<()> {
    if let TargetKind::Clean(dirs) = &driver.targets[target].kind {
        let env = Env::new(config);
        for dir in dirs {
            let dir = env.expand(dir)?;
            clean(&config.build.path(Utf8Path::new(&dir)))?;
        }
    }
    Ok(())
}

/// A fully expanded command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the process to run in `root`. Output is inherited, so tool diagnostics reach the
    /// user unchanged.
    pub fn command(&self, root: &Utf8Path) -> std::io::Result<Command> {
        // A relative program path with a directory in it means a file in the project. It is
        // made absolute, since the child resolves relative paths after changing directory.
        let program = Utf8Path::new(&self.program);
        let mut cmd = if program.is_relative() && program.components().count() > 1 {
            Command::new(std::path::absolute(root)?.join(program))
        } else {
            Command::new(program)
        };
        cmd.args(&self.args).current_dir(root);
        Ok(cmd)
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

/// Quote an argument for display in a POSIX shell.
fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:,@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// The pattern for variable references: `$$`, `${name}`, or `$name`.
fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{(\w+)\}|(\w+))").expect("variable pattern is valid")
    })
}

/// The variables, rules, and helper files available to stages while a plan runs.
pub struct Env<'a> {
    pub config: &'a Config,
    vars: HashMap<String, String>,
    rules: HashMap<String, Vec<String>>,

    /// Files declared by setups that have not been written yet.
    files: Vec<(Utf8PathBuf, Vec<u8>)>,
}

impl<'a> Env<'a> {
    /// An environment with the variables every configuration defines.
    pub fn new(config: &'a Config) -> Self {
        let build = &config.build;
        let vars = [
            ("project", build.project.clone()),
            ("mode", build.mode.to_string()),
            ("root", build.root.to_string()),
            ("rtl_dir", build.rtl_dir.to_string()),
            ("build_dir", build.build_dir.to_string()),
            ("sim_dir", build.sim_dir.to_string()),
            ("device", build.board.device.clone()),
            ("package", build.board.package.clone()),
            ("pcf", build.board.pcf.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            config,
            vars,
            rules: HashMap::new(),
            files: vec![],
        }
    }

    pub fn build(&self) -> &BuildConfig {
        &self.config.build
    }

    /// Fetch a configuration value, using a default if it's missing.
    pub fn config_or(&self, key: &str, default: &str) -> String {
        self.config.get(key).unwrap_or_else(|| default.into())
    }

    /// Declare a variable `name` from the configured value for `key`, or a default value if it's
    /// missing.
    pub fn config_var_or(&mut self, name: &str, key: &str, default: &str) -> Result<()> {
        let value = self.config_or(key, default);
        self.var(name, &value)
    }

    /// Declare a variable. References to other variables in `value` are expanded now.
    pub fn var(&mut self, name: &str, value: &str) -> Result<()> {
        let value = self.expand(value)?;
        self.vars.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get_var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Declare a rule: a program and argument templates, expanded when a stage uses it.
    ///
    /// An argument that is exactly `$in` or `$out` becomes one argument per input or output file;
    /// `$in0`, `$out1`, and so on name single files.
    pub fn rule(&mut self, name: &str, program: &str, args: &[&str]) {
        let mut template = vec![program.to_string()];
        template.extend(args.iter().map(|a| a.to_string()));
        self.rules.insert(name.to_string(), template);
    }

    /// Ask for a file with fixed contents to exist before the stage runs. The file is only
    /// rewritten when its contents differ, so its timestamp stays put otherwise.
    pub fn add_file(&mut self, path: &str, contents: &[u8]) -> Result<Utf8PathBuf> {
        let path = Utf8PathBuf::from(self.expand(path)?);
        self.files.push((path.clone(), contents.to_vec()));
        Ok(path)
    }

    fn write_files(&mut self) -> Result<()> {
        for (path, contents) in self.files.drain(..) {
            let full = self.config.build.path(&path);
            if std::fs::read(&full).ok().as_deref() == Some(contents.as_slice()) {
                continue;
            }
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            debug!("writing {}", path);
            std::fs::write(&full, contents)?;
        }
        Ok(())
    }

    /// Look for an optional tool on the `PATH`.
    pub fn probe(&self, tool: &str) -> Option<Utf8PathBuf> {
        which::which(tool)
            .ok()
            .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
    }

    /// A path usable from inside `base` that refers to the same file as `path`. Both are
    /// project-relative.
    pub fn relative_path(&self, path: &Utf8Path, base: &Utf8Path) -> Utf8PathBuf {
        let build = &self.config.build;
        pathdiff::diff_utf8_paths(build.path(path), build.path(base))
            .unwrap_or_else(|| build.path(path))
    }

    /// Expand variable references in `template`.
    pub fn expand(&self, template: &str) -> Result<String> {
        self.expand_with(template, &[])
    }

    fn expand_with(&self, template: &str, locals: &[(String, String)]) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in var_pattern().captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&template[last..whole.start()]);
            if caps.get(1).is_some() {
                out.push('$');
            } else {
                let name = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map_or("", |m| m.as_str());
                let value = locals
                    .iter()
                    .find(|(local, _)| local == name)
                    .map(|(_, value)| value.as_str())
                    .or_else(|| self.get_var(name))
                    .ok_or_else(|| Error::UndefinedVariable(name.to_string()))?;
                out.push_str(value);
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Expand a rule for a stage's files.
    pub fn expand_rule(&self, name: &str, files: &StageFiles) -> Result<Invocation> {
        let template = self
            .rules
            .get(name)
            .ok_or_else(|| Error::UndefinedRule(name.to_string()))?;

        let strings = |paths: &[Utf8PathBuf]| -> Vec<String> {
            paths.iter().map(|p| p.to_string()).collect()
        };
        let inputs = strings(&files.inputs);
        let outputs = strings(&files.outputs);
        let mut locals = vec![
            ("in".to_string(), inputs.join(" ")),
            ("out".to_string(), outputs.join(" ")),
        ];
        for (i, input) in inputs.iter().enumerate() {
            locals.push((format!("in{}", i), input.clone()));
        }
        for (i, output) in outputs.iter().enumerate() {
            locals.push((format!("out{}", i), output.clone()));
        }

        let mut argv: Vec<String> = vec![];
        for arg in template {
            match arg.as_str() {
                "$in" => argv.extend(inputs.iter().cloned()),
                "$out" => argv.extend(outputs.iter().cloned()),
                _ => argv.push(self.expand_with(arg, &locals)?),
            }
        }
        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_default();
        Ok(Invocation::new(program).args(argv))
    }
}
