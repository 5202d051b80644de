//! Whole-flow tests against a throwaway project, with shell scripts standing in for the tools.
//! Every fake tool appends its command line to `calls.log` in the project root.
#![cfg(unix)]

use camino::{Utf8Path, Utf8PathBuf};
use figment::{providers::Serialized, Figment};
use fpgaflow::driver::Request;
use fpgaflow::run::clean_target;
use fpgaflow::{BuildConfig, Config, Driver, Error, Run, StageStatus};
use icemake::build_driver;
use pretty_assertions::assert_eq;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, SystemTime};

const YOSYS: &str = r#"#!/bin/sh
echo "yosys $*" >> calls.log
json=$(echo "$3" | sed -n 's/.*-json \([^ ;]*\).*/\1/p')
rpt=$(echo "$3" | sed -n 's/.*tee -q -o \([^ ]*\) stat.*/\1/p')
cat "$4" > "$json"
printf '=== top ===\n\n   Number of cells: 38\n     SB_CARRY 23\n     SB_LUT4 15\n' > "$rpt"
"#;

const NEXTPNR: &str = r#"#!/bin/sh
echo "nextpnr $*" >> calls.log
while [ $# -gt 0 ]; do
  case "$1" in
    --json) shift; json="$1" ;;
    --asc) shift; asc="$1" ;;
  esac
  shift
done
if [ -f fail-pnr ]; then
  echo partial > "$asc"
  exit 3
fi
cat "$json" > "$asc"
"#;

const ICETIME: &str = r#"#!/bin/sh
echo "icetime $*" >> calls.log
{ echo "timing for $9"; echo "Total path delay: 9.17 ns (109.05 MHz)"; } > "$8"
"#;

const ICEPACK: &str = r#"#!/bin/sh
echo "icepack $*" >> calls.log
[ -f lazy-pack ] && exit 0
cat "$1" > "$2"
"#;

const ICEPROG: &str = r#"#!/bin/sh
echo "iceprog $*" >> calls.log
"#;

const VERILATOR: &str = r#"#!/bin/sh
echo "verilator $*" >> calls.log
while [ $# -gt 0 ]; do
  case "$1" in
    --Mdir) shift; mdir="$1" ;;
    -o) shift; exe="$1" ;;
  esac
  shift
done
mkdir -p "$mdir"
printf '#!/bin/sh\necho "sim $*" >> calls.log\nfor a in "$@"; do case "$a" in +trace=*) echo vcd > "${a#+trace=}" ;; esac; done\n' > "$mdir/$exe"
chmod +x "$mdir/$exe"
"#;

struct Project {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    driver: Driver,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        std::fs::create_dir_all(root.join("rtl/led_blink")).unwrap();
        std::fs::create_dir_all(root.join("boards")).unwrap();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("rtl/led_blink/led_blink.v"), "module led_blink;\n").unwrap();
        std::fs::write(root.join("rtl/led_blink/led_blink_tb.v"), "module led_blink_tb;\n").unwrap();
        std::fs::write(root.join("boards/icestick.pcf"), "set_io clk 21\n").unwrap();
        for source in [
            "rtl/led_blink/led_blink.v",
            "rtl/led_blink/led_blink_tb.v",
            "boards/icestick.pcf",
        ] {
            set_age(&root.join(source), 100);
        }

        for (tool, script) in [
            ("yosys", YOSYS),
            ("nextpnr", NEXTPNR),
            ("icetime", ICETIME),
            ("icepack", ICEPACK),
            ("iceprog", ICEPROG),
            ("verilator", VERILATOR),
        ] {
            let path = root.join("bin").join(tool);
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        Self {
            _dir: dir,
            root,
            driver: build_driver(),
        }
    }

    fn config(&self, extra: &[(&str, &str)]) -> Config {
        self.config_at(&self.root, extra)
    }

    /// A configuration rooted at `root`, which may be relative to the current directory.
    fn config_at(&self, root: &Utf8Path, extra: &[(&str, &str)]) -> Config {
        let mut fig = Figment::from(Serialized::defaults(BuildConfig::default()))
            .merge(("root", root.as_str()));
        for tool in ["yosys", "nextpnr", "icetime", "icepack", "iceprog", "verilator"] {
            let key = format!("tools.{}", tool);
            fig = fig.merge((key, self.root.join("bin").join(tool).as_str()));
        }
        for (key, value) in extra {
            fig = fig.merge((*key, *value));
        }
        Config::from_figment(fig).unwrap()
    }

    fn run<'a>(&'a self, target: &str, config: &'a Config) -> Run<'a> {
        let req = Request {
            target: self.driver.get_target(target).unwrap(),
            force: false,
        };
        let plan = self.driver.resolve(&req, config).unwrap();
        Run::new(&self.driver, plan, config)
    }

    fn make(&self, target: &str, config: &Config) -> fpgaflow::Result<()> {
        self.run(target, config).execute()
    }

    fn clean(&self, target: &str, config: &Config) {
        let target = self.driver.get_target(target).unwrap();
        clean_target(&self.driver, target, config).unwrap();
    }

    /// The tools called since the last check, by name.
    fn calls(&self) -> Vec<String> {
        let log = self.root.join("calls.log");
        let text = std::fs::read_to_string(&log).unwrap_or_default();
        let _ = std::fs::remove_file(&log);
        text.lines()
            .map(|line| line.split(' ').next().unwrap_or("").to_string())
            .collect()
    }

    fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }
}

fn set_age(path: &Utf8Path, secs: u64) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}

const BUILD_CALLS: [&str; 4] = ["yosys", "nextpnr", "icepack", "icetime"];

#[test]
fn second_build_runs_nothing() {
    let project = Project::new();
    let config = project.config(&[]);

    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), BUILD_CALLS);

    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), Vec::<String>::new());
}

#[test]
fn newer_source_rebuilds_downstream() {
    let project = Project::new();
    let config = project.config(&[]);
    project.make("build", &config).unwrap();
    project.calls();

    for output in [
        "led_blink.json",
        "led_blink_util.rpt",
        "led_blink.asc",
        "led_blink_timing.rpt",
        "led_blink.bin",
    ] {
        set_age(&project.root.join("build").join(output), 50);
    }
    set_age(&project.root.join("rtl/led_blink/led_blink.v"), 10);

    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), BUILD_CALLS);
    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), Vec::<String>::new());
}

#[test]
fn newer_constraints_skip_synthesis() {
    let project = Project::new();
    let config = project.config(&[]);
    project.make("build", &config).unwrap();
    project.calls();

    for output in ["led_blink.asc", "led_blink_timing.rpt", "led_blink.bin"] {
        set_age(&project.root.join("build").join(output), 50);
    }
    set_age(&project.root.join("build/led_blink.json"), 60);
    set_age(&project.root.join("build/led_blink_util.rpt"), 60);
    set_age(&project.root.join("boards/icestick.pcf"), 10);

    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), ["nextpnr", "icepack", "icetime"]);
}

#[test]
fn clean_then_build_recreates_everything() {
    let project = Project::new();
    let config = project.config(&[]);
    project.make("build", &config).unwrap();
    project.calls();

    project.clean("clean", &config);
    assert!(!project.exists("build"));
    project.clean("clean", &config);

    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), BUILD_CALLS);
    for output in [
        "build/led_blink.json",
        "build/led_blink_util.rpt",
        "build/led_blink.asc",
        "build/led_blink_timing.rpt",
        "build/led_blink.bin",
    ] {
        assert!(project.exists(output), "{} is missing", output);
    }
}

#[test]
fn failing_pnr_stops_before_packing() {
    let project = Project::new();
    std::fs::write(project.root.join("fail-pnr"), "").unwrap();
    let config = project.config(&[]);

    let mut run = project.run("build", &config);
    match run.execute() {
        Err(Error::StageFailed { stage, code }) => {
            assert_eq!(stage, "pnr");
            assert_eq!(code, Some(3));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(project.calls(), ["yosys", "nextpnr"]);
    assert!(!project.exists("build/led_blink.bin"));
    // The routed file nextpnr started writing is gone.
    assert!(!project.exists("build/led_blink.asc"));
    assert!(project.exists("build/led_blink.json"));

    let stage = |name: &str| project.driver.get_stage(name).unwrap();
    assert_eq!(run.status(stage("synth")), StageStatus::Succeeded);
    assert_eq!(run.status(stage("pnr")), StageStatus::Failed);
    assert_eq!(run.status(stage("pack")), StageStatus::Pending);
    assert_eq!(run.not_attempted(), vec!["pack", "timing"]);

    // The synthesis results survive and are reused.
    std::fs::remove_file(project.root.join("fail-pnr")).unwrap();
    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), ["nextpnr", "icepack", "icetime"]);
}

#[test]
fn debug_mode_changes_arguments_not_paths() {
    let project = Project::new();
    let release = project.config(&[]);
    let debug = project.config(&[("mode", "debug")]);

    let release_run = project.run("build", &release);
    let debug_run = project.run("build", &debug);
    let files = |run: &Run| -> Vec<_> {
        run.plan.steps.iter().map(|step| step.files.clone()).collect()
    };
    assert_eq!(files(&release_run), files(&debug_run));

    let synth = project.driver.get_stage("synth").unwrap();
    let synth_args = |run: &Run| {
        run.commands()
            .unwrap()
            .into_iter()
            .find(|(stage, _)| *stage == synth)
            .map(|(_, invocation)| invocation.args)
            .unwrap()
    };
    let release_args = synth_args(&release_run);
    let debug_args = synth_args(&debug_run);
    assert_ne!(release_args, debug_args);
    assert!(debug_args[2].contains("-noflatten -noabc"));
    assert!(!release_args[2].contains("-noabc"));
    assert!(release_args[2].contains("-json build/led_blink.json"));
    assert!(release_args[2].contains("tee -q -o build/led_blink_util.rpt stat"));

    // Nothing was run or written.
    assert_eq!(project.calls(), Vec::<String>::new());
    assert!(!project.exists("build"));
}

#[test]
fn standalone_timing_report_matches_build() {
    let project = Project::new();
    let config = project.config(&[]);

    project.make("timing_report", &config).unwrap();
    assert_eq!(project.calls(), ["yosys", "nextpnr", "icetime"]);
    let report = std::fs::read(project.root.join("build/led_blink_timing.rpt")).unwrap();

    project.clean("clean", &config);
    project.make("build", &config).unwrap();
    project.calls();
    assert_eq!(
        std::fs::read(project.root.join("build/led_blink_timing.rpt")).unwrap(),
        report
    );
}

#[test]
fn simulation_is_independent_of_hardware() {
    let project = Project::new();
    let config = project.config(&[]);

    project.make("sim", &config).unwrap();
    assert_eq!(project.calls(), ["verilator", "sim"]);
    assert!(project.exists("sim/led_blink.vcd"));
    assert!(project.exists("sim/sim_main.cpp"));
    assert!(!project.exists("build"));

    project.make("build", &config).unwrap();
    assert_eq!(project.calls(), BUILD_CALLS);

    project.clean("sim_clean", &config);
    assert!(!project.exists("sim"));
    assert!(project.exists("build/led_blink.bin"));

    project.make("sim", &config).unwrap();
    project.calls();
    project.clean("clean", &config);
    assert!(!project.exists("build"));
    assert!(project.exists("sim/led_blink.vcd"));
}

#[test]
fn missing_viewer_is_not_an_error() {
    let project = Project::new();
    let config = project.config(&[("sim.viewer", "no-such-waveform-viewer")]);

    let mut run = project.run("sim_wave", &config);
    run.execute().unwrap();
    assert_eq!(project.calls(), ["verilator", "sim"]);
    let wave = project.driver.get_stage("sim-wave").unwrap();
    assert_eq!(run.status(wave), StageStatus::Succeeded);
}

#[test]
fn programming_always_runs() {
    let project = Project::new();
    let config = project.config(&[]);
    project.make("build", &config).unwrap();
    project.calls();

    project.make("prog", &config).unwrap();
    project.make("prog_flash", &config).unwrap();
    let log = std::fs::read_to_string(project.root.join("calls.log")).unwrap();
    assert_eq!(
        log.lines().collect::<Vec<_>>(),
        vec!["iceprog -S build/led_blink.bin", "iceprog build/led_blink.bin"]
    );
}

#[test]
fn missing_test_bench_is_reported() {
    let project = Project::new();
    std::fs::remove_file(project.root.join("rtl/led_blink/led_blink_tb.v")).unwrap();
    let config = project.config(&[]);
    let req = Request {
        target: project.driver.get_target("sim").unwrap(),
        force: false,
    };
    match project.driver.resolve(&req, &config) {
        Err(Error::MissingSourceFile { stage, path }) => {
            assert_eq!(stage, "sim-compile");
            assert_eq!(path, "rtl/led_blink/led_blink_tb.v");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn tool_that_writes_nothing_fails_the_stage() {
    let project = Project::new();
    std::fs::write(project.root.join("lazy-pack"), "").unwrap();
    let config = project.config(&[]);

    let mut run = project.run("build", &config);
    match run.execute() {
        Err(Error::MissingExpectedOutput { stage, path }) => {
            assert_eq!(stage, "pack");
            assert_eq!(path, "build/led_blink.bin");
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(project.calls(), ["yosys", "nextpnr", "icepack"]);

    let timing = project.driver.get_stage("timing").unwrap();
    assert_eq!(run.status(timing), StageStatus::Pending);
    assert_eq!(run.not_attempted(), vec!["timing"]);
}

#[test]
fn relative_root_runs_project_programs() {
    let project = Project::new();
    let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();
    let root = pathdiff::diff_utf8_paths(&project.root, &cwd).unwrap();
    assert!(root.is_relative());
    let config = project.config_at(&root, &[]);

    project.make("sim", &config).unwrap();
    assert_eq!(project.calls(), ["verilator", "sim"]);
    assert!(project.exists("sim/led_blink.vcd"));

    project.clean("sim_clean", &config);
    assert!(!project.exists("sim"));
}
