use crate::config::Config;
use crate::error::{Error, Result};
use crate::report::Summarize;
use crate::run::{Env, Invocation};
use camino::{Utf8Path, Utf8PathBuf};
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use std::fmt::Display;
use std::time::SystemTime;
use tracing::debug;

/// An Artifact is a file that Stages produce or consume.
pub struct Artifact {
    pub name: String,

    /// Where the file lives, as a template over the configuration variables (like
    /// `$build_dir/$project.json`).
    pub path: String,

    /// An extractor to run over the file after it is produced, if it is a report.
    pub summary: Option<Box<dyn Summarize>>,
}

/// A reference to an Artifact.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef(u32);
entity_impl!(ArtifactRef, "artifact");

/// A Stage runs one tool to turn its input Artifacts into its output Artifacts.
pub struct Stage {
    pub name: String,

    /// A progress message, shown when the stage starts.
    pub label: String,
    pub inputs: Vec<ArtifactRef>,

    /// A stage with no outputs is phony: it runs every time it is requested.
    pub outputs: Vec<ArtifactRef>,
    pub setups: Vec<SetupRef>,
    pub emit: Box<dyn EmitCommand>,
}

/// A reference to a Stage.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct StageRef(u32);
entity_impl!(StageRef, "stage");

/// A Setup prepares the variables, rules, and helper files that one tool's Stages share. It runs
/// at most once per run, just before the first Stage that needs it.
pub struct Setup {
    pub name: String,
    pub emit: Box<dyn EmitSetup>,
}

/// A reference to a Setup.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SetupRef(u32);
entity_impl!(SetupRef, "setup");

/// What a Target asks for.
pub enum TargetKind {
    /// Bring these stages (and everything they depend on) up to date.
    Stages(Vec<StageRef>),

    /// Remove these directories (path templates).
    Clean(Vec<String>),

    /// List the targets.
    Help,

    /// Describe the configuration.
    Info,
}

/// A Target is a named goal on the command line.
pub struct Target {
    pub name: String,
    pub description: String,
    pub kind: TargetKind,
}

/// A reference to a Target.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef(u32);
entity_impl!(TargetRef, "target");

/// The files a stage reads and writes, with their templates expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFiles {
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
}

/// Code to produce the command line for a stage. `None` means there is nothing to run this time.
pub trait EmitCommand {
    fn command(&self, env: &Env, files: &StageFiles) -> Result<Option<Invocation>>;
}

type EmitCommandFn = fn(&Env, &StageFiles) -> Result<Option<Invocation>>;

impl EmitCommand for EmitCommandFn {
    fn command(&self, env: &Env, files: &StageFiles) -> Result<Option<Invocation>> {
        self(env, files)
    }
}

/// A simple command emitter that just expands a rule.
pub struct EmitRuleCommand {
    pub rule_name: String,
}

impl EmitCommand for EmitRuleCommand {
    fn command(&self, env: &Env, files: &StageFiles) -> Result<Option<Invocation>> {
        env.expand_rule(&self.rule_name, files).map(Some)
    }
}

/// Code to declare variables, rules, and files for a group of stages.
pub trait EmitSetup {
    fn setup(&self, env: &mut Env) -> Result<()>;
}

type EmitSetupFn = fn(&mut Env) -> Result<()>;

impl EmitSetup for EmitSetupFn {
    fn setup(&self, env: &mut Env) -> Result<()> {
        self(env)
    }
}

/// Why a stage has to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    /// The user asked for everything to be rebuilt.
    Forced,

    /// The stage has no outputs to check.
    Phony,
    MissingOutput(Utf8PathBuf),
    NewerInput(Utf8PathBuf),

    /// A stage producing one of the inputs runs first.
    UpstreamRebuilt(String),
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Forced => write!(f, "forced"),
            Reason::Phony => write!(f, "always runs"),
            Reason::MissingOutput(path) => write!(f, "{} is missing", path),
            Reason::NewerInput(path) => write!(f, "{} changed", path),
            Reason::UpstreamRebuilt(stage) => write!(f, "{} runs first", stage),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Fresh,
    Run(Reason),
}

/// One stage in a plan, with its files resolved.
#[derive(Debug)]
pub struct Step {
    pub stage: StageRef,
    pub files: StageFiles,
    pub decision: Decision,
}

/// The stages a target needs, in the order they must run.
#[derive(Debug)]
pub struct Plan {
    pub target: String,
    pub steps: Vec<Step>,
}

impl Plan {
    /// The steps that actually have work to do.
    pub fn stale(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|step| matches!(step.decision, Decision::Run(_)))
    }
}

/// A request to the Driver directing it what to build.
#[derive(Debug)]
pub struct Request {
    pub target: TargetRef,

    /// Treat every stage as stale.
    pub force: bool,
}

#[derive(Clone, Copy, PartialEq, Default)]
enum Mark {
    #[default]
    Unvisited,
    Visiting,
    Done,
}

/// A Driver encapsulates a set of Artifacts and the Stages that produce them, plus the Targets
/// users can ask for. It contains all the machinery to perform builds with a given toolchain.
pub struct Driver {
    pub setups: PrimaryMap<SetupRef, Setup>,
    pub artifacts: PrimaryMap<ArtifactRef, Artifact>,
    pub stages: PrimaryMap<StageRef, Stage>,
    pub targets: PrimaryMap<TargetRef, Target>,

    /// The stage that writes each artifact, or `None` for source files.
    pub producers: SecondaryMap<ArtifactRef, Option<StageRef>>,
    pub default_target: Option<TargetRef>,
}

impl Driver {
    pub fn get_target(&self, name: &str) -> Option<TargetRef> {
        self.targets
            .iter()
            .find(|(_, target)| target.name == name)
            .map(|(target_ref, _)| target_ref)
    }

    pub fn get_stage(&self, name: &str) -> Option<StageRef> {
        self.stages
            .iter()
            .find(|(_, stage)| stage.name == name)
            .map(|(stage_ref, _)| stage_ref)
    }

    /// Expand an artifact's path template for this configuration.
    pub fn artifact_path(&self, env: &Env, artifact: ArtifactRef) -> Result<Utf8PathBuf> {
        env.expand(&self.artifacts[artifact].path).map(Utf8PathBuf::from)
    }

    fn stage_files(&self, env: &Env, stage: StageRef) -> Result<StageFiles> {
        let stage = &self.stages[stage];
        let paths = |list: &[ArtifactRef]| -> Result<Vec<Utf8PathBuf>> {
            list.iter().map(|a| self.artifact_path(env, *a)).collect()
        };
        Ok(StageFiles {
            inputs: paths(&stage.inputs)?,
            outputs: paths(&stage.outputs)?,
        })
    }

    /// Work out which stages `req` needs and whether each one is stale.
    ///
    /// Stages come out in dependency order: every stage appears after the stages that produce its
    /// inputs.
    pub fn resolve(&self, req: &Request, config: &Config) -> Result<Plan> {
        let target = &self.targets[req.target];
        let roots = match &target.kind {
            TargetKind::Stages(stages) => stages.clone(),
            _ => vec![],
        };

        let env = Env::new(config);
        let mut resolver = Resolver {
            driver: self,
            env: &env,
            root: &config.build.root,
            force: req.force,
            marks: SecondaryMap::new(),
            stale: SecondaryMap::new(),
            path: vec![],
            steps: vec![],
        };
        for stage in roots {
            resolver.visit(stage)?;
        }

        Ok(Plan {
            target: target.name.clone(),
            steps: resolver.steps,
        })
    }
}

/// The state of one depth-first walk over the stage graph.
struct Resolver<'a> {
    driver: &'a Driver,
    env: &'a Env<'a>,
    root: &'a Utf8Path,
    force: bool,
    marks: SecondaryMap<StageRef, Mark>,
    stale: SecondaryMap<StageRef, bool>,

    /// The stages currently being visited, for reporting cycles.
    path: Vec<StageRef>,
    steps: Vec<Step>,
}

impl Resolver<'_> {
    fn visit(&mut self, stage: StageRef) -> Result<()> {
        match self.marks[stage] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = self.path.iter().position(|s| *s == stage).unwrap_or(0);
                let mut cycle: Vec<String> = self.path[start..]
                    .iter()
                    .map(|s| self.driver.stages[*s].name.clone())
                    .collect();
                cycle.push(self.driver.stages[stage].name.clone());
                return Err(Error::Cycle { path: cycle });
            }
            Mark::Unvisited => {}
        }
        self.marks[stage] = Mark::Visiting;
        self.path.push(stage);

        // Everything upstream is decided first.
        for input in &self.driver.stages[stage].inputs {
            if let Some(producer) = self.driver.producers[*input] {
                self.visit(producer)?;
            }
        }

        let files = self.driver.stage_files(self.env, stage)?;
        let decision = self.decide(stage, &files)?;
        let name = &self.driver.stages[stage].name;
        match &decision {
            Decision::Fresh => debug!("{}: up to date", name),
            Decision::Run(reason) => debug!("{}: stale ({})", name, reason),
        }
        self.stale[stage] = matches!(decision, Decision::Run(_));
        self.steps.push(Step {
            stage,
            files,
            decision,
        });

        self.path.pop();
        self.marks[stage] = Mark::Done;
        Ok(())
    }

    fn decide(&self, stage: StageRef, files: &StageFiles) -> Result<Decision> {
        let stage_data = &self.driver.stages[stage];

        // Source inputs must exist regardless of whether anything runs.
        let mut newest_input: Option<(SystemTime, &Utf8PathBuf)> = None;
        for (artifact, path) in stage_data.inputs.iter().zip(&files.inputs) {
            let producer = self.driver.producers[*artifact];
            match (mtime(&self.root.join(path))?, producer) {
                (None, None) => {
                    return Err(Error::MissingSourceFile {
                        stage: stage_data.name.clone(),
                        path: path.clone(),
                    })
                }
                (Some(time), _) => {
                    if newest_input.map_or(true, |(newest, _)| time > newest) {
                        newest_input = Some((time, path));
                    }
                }
                // A producer that is fresh has its outputs on disk, so the producer must be
                // stale and will be caught below.
                (None, Some(_)) => {}
            }
        }

        if self.force {
            return Ok(Decision::Run(Reason::Forced));
        }
        if files.outputs.is_empty() {
            return Ok(Decision::Run(Reason::Phony));
        }
        for artifact in &stage_data.inputs {
            if let Some(producer) = self.driver.producers[*artifact] {
                if self.stale[producer] {
                    let name = self.driver.stages[producer].name.clone();
                    return Ok(Decision::Run(Reason::UpstreamRebuilt(name)));
                }
            }
        }

        // Compare against the oldest output; equal times count as fresh.
        let mut oldest_output: Option<SystemTime> = None;
        for path in &files.outputs {
            match mtime(&self.root.join(path))? {
                None => return Ok(Decision::Run(Reason::MissingOutput(path.clone()))),
                Some(time) => {
                    if oldest_output.map_or(true, |oldest| time < oldest) {
                        oldest_output = Some(time);
                    }
                }
            }
        }
        match (newest_input, oldest_output) {
            (Some((input_time, input)), Some(output_time)) if input_time > output_time => {
                Ok(Decision::Run(Reason::NewerInput(input.clone())))
            }
            _ => Ok(Decision::Fresh),
        }
    }
}

/// The modification time of a file, or `None` if it does not exist.
pub fn mtime(path: &Utf8Path) -> Result<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[derive(Default)]
pub struct DriverBuilder {
    setups: PrimaryMap<SetupRef, Setup>,
    artifacts: PrimaryMap<ArtifactRef, Artifact>,
    stages: PrimaryMap<StageRef, Stage>,
    targets: PrimaryMap<TargetRef, Target>,
    default_target: Option<TargetRef>,
}

impl DriverBuilder {
    /// Declare a file, with a path template like `$build_dir/$project.bin`.
    pub fn artifact(&mut self, name: &str, path: &str) -> ArtifactRef {
        self.artifacts.push(Artifact {
            name: name.to_string(),
            path: path.to_string(),
            summary: None,
        })
    }

    /// Declare a report file and how to summarize it.
    pub fn report<T: Summarize + 'static>(
        &mut self,
        name: &str,
        path: &str,
        summary: T,
    ) -> ArtifactRef {
        self.artifacts.push(Artifact {
            name: name.to_string(),
            path: path.to_string(),
            summary: Some(Box::new(summary)),
        })
    }

    pub fn add_setup<T: EmitSetup + 'static>(&mut self, name: &str, emit: T) -> SetupRef {
        self.setups.push(Setup {
            name: name.into(),
            emit: Box::new(emit),
        })
    }

    pub fn setup(&mut self, name: &str, func: EmitSetupFn) -> SetupRef {
        self.add_setup(name, func)
    }

    fn add_stage<T: EmitCommand + 'static>(
        &mut self,
        name: &str,
        label: &str,
        setups: &[SetupRef],
        inputs: &[ArtifactRef],
        outputs: &[ArtifactRef],
        emit: T,
    ) -> StageRef {
        self.stages.push(Stage {
            name: name.to_string(),
            label: label.to_string(),
            inputs: inputs.into(),
            outputs: outputs.into(),
            setups: setups.into(),
            emit: Box::new(emit),
        })
    }

    /// Add a stage whose command line is computed by a function.
    pub fn op(
        &mut self,
        name: &str,
        label: &str,
        setups: &[SetupRef],
        inputs: &[ArtifactRef],
        outputs: &[ArtifactRef],
        build: EmitCommandFn,
    ) -> StageRef {
        self.add_stage(name, label, setups, inputs, outputs, build)
    }

    /// Add a stage that runs a rule declared by one of its setups. The stage takes the rule's name.
    pub fn rule(
        &mut self,
        label: &str,
        setups: &[SetupRef],
        inputs: &[ArtifactRef],
        outputs: &[ArtifactRef],
        rule_name: &str,
    ) -> StageRef {
        self.add_stage(
            rule_name,
            label,
            setups,
            inputs,
            outputs,
            EmitRuleCommand {
                rule_name: rule_name.to_string(),
            },
        )
    }

    pub fn target(&mut self, name: &str, description: &str, kind: TargetKind) -> TargetRef {
        self.targets.push(Target {
            name: name.to_string(),
            description: description.to_string(),
            kind,
        })
    }

    /// The target to use when none is given on the command line.
    pub fn default_target(&mut self, target: TargetRef) {
        self.default_target = Some(target);
    }

    pub fn build(self) -> Driver {
        let mut producers = SecondaryMap::<ArtifactRef, Option<StageRef>>::new();
        for (stage_ref, stage) in self.stages.iter() {
            for output in &stage.outputs {
                assert!(
                    producers[*output].is_none(),
                    "artifact `{}` has more than one producer",
                    self.artifacts[*output].name
                );
                producers[*output] = Some(stage_ref);
            }
        }

        Driver {
            setups: self.setups,
            artifacts: self.artifacts,
            stages: self.stages,
            targets: self.targets,
            producers,
            default_target: self.default_target,
        }
    }
}
