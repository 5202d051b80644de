//! The open-source iCE40 flow: yosys, nextpnr, icetime, icepack, and iceprog for hardware, and
//! Verilator for simulation.

use fpgaflow::driver::{StageFiles, TargetKind};
use fpgaflow::report::{CellCounts, MarkerLines};
use fpgaflow::{BuildMode, Driver, DriverBuilder, Env, Error, Invocation, Result};
use lazy_static_include::*;
use tracing::warn;

lazy_static_include_bytes! {
    SIM_MAIN => "data/sim_main.cpp",
}

/// Synthesize with yosys. One call writes both the netlist and the utilization statistics.
fn synthesize(e: &Env, files: &StageFiles) -> Result<Option<Invocation>> {
    let build = e.build();
    let mut script = format!(
        "synth_ice40 -top {} -json {}",
        build.project, files.outputs[0]
    );
    if build.mode == BuildMode::Debug {
        script.push(' ');
        script.push_str(&e.expand("$synth_debug_flags")?);
    }
    script.push_str(&format!("; tee -q -o {} stat", files.outputs[1]));

    Ok(Some(
        Invocation::new(e.expand("$yosys")?)
            .args(["-q", "-p", script.as_str()])
            .args(files.inputs.iter().map(|p| p.as_str())),
    ))
}

/// Compile the test bench and the C++ main into a simulation executable.
fn compile_sim(e: &Env, files: &StageFiles) -> Result<Option<Invocation>> {
    let build = e.build();
    let obj_dir = build.sim_dir.join("obj_dir");
    // Verilator resolves `-o` against its object directory.
    let exe = e.relative_path(&files.outputs[0], &obj_dir);

    Ok(Some(
        Invocation::new(e.expand("$verilator")?)
            .args(["--cc", "--exe", "--build", "--timing", "--trace", "-Wno-fatal"])
            .args(["--prefix", "Vtop"])
            .arg("--top-module")
            .arg(format!("{}_tb", build.project))
            .arg("--Mdir")
            .arg(obj_dir.as_str())
            .arg("-o")
            .arg(exe.as_str())
            .arg(e.expand("$sim_main")?)
            .args(files.inputs.iter().map(|p| p.as_str())),
    ))
}

/// Run the simulation, dumping a waveform trace.
fn run_sim(_e: &Env, files: &StageFiles) -> Result<Option<Invocation>> {
    Ok(Some(
        Invocation::new(files.inputs[0].as_str()).arg(format!("+trace={}", files.outputs[0])),
    ))
}

/// Open the trace in a waveform viewer, if one is installed.
fn view_trace(e: &Env, files: &StageFiles) -> Result<Option<Invocation>> {
    let viewer = e.expand("$viewer")?;
    let trace = &files.inputs[0];
    match e.probe(&viewer) {
        Some(path) => Ok(Some(Invocation::new(path.as_str()).arg(trace.as_str()))),
        None => {
            let err = Error::ToolNotFound { tool: viewer };
            warn!("{}; the trace is at {}", err, trace);
            Ok(None)
        }
    }
}

pub fn build_driver() -> Driver {
    let mut bld = DriverBuilder::default();

    // Sources.
    let rtl = bld.artifact("rtl", "$rtl_dir/$project/$project.v");
    let testbench = bld.artifact("testbench", "$rtl_dir/$project/${project}_tb.v");
    let pcf = bld.artifact("pcf", "$pcf");

    // Hardware.
    let netlist = bld.artifact("netlist", "$build_dir/$project.json");
    let util_report = bld.report(
        "util_report",
        "$build_dir/${project}_util.rpt",
        CellCounts::new("Utilization", "^SB_").expect("cell pattern is valid"),
    );
    let routed = bld.artifact("routed", "$build_dir/$project.asc");
    let timing_report = bld.report(
        "timing_report",
        "$build_dir/${project}_timing.rpt",
        MarkerLines::new("Timing", "Total path delay:"),
    );
    let bitstream = bld.artifact("bitstream", "$build_dir/$project.bin");

    // Simulation.
    let sim_exe = bld.artifact("sim_exe", "$sim_dir/${project}_sim");
    let trace = bld.artifact("trace", "$sim_dir/$project.vcd");

    // Yosys.
    let yosys_setup = bld.setup("yosys", |e| {
        e.config_var_or("yosys", "tools.yosys", "yosys")?;
        e.config_var_or("synth_debug_flags", "synth.debug_flags", "-noflatten -noabc")?;
        Ok(())
    });
    let synth = bld.op(
        "synth",
        "synthesizing",
        &[yosys_setup],
        &[rtl],
        &[netlist, util_report],
        synthesize,
    );

    // nextpnr.
    let nextpnr_setup = bld.setup("nextpnr", |e| {
        e.config_var_or("nextpnr", "tools.nextpnr", "nextpnr-ice40")?;
        e.rule(
            "pnr",
            "$nextpnr",
            &[
                "--$device",
                "--package",
                "$package",
                "--json",
                "$in0",
                "--pcf",
                "$in1",
                "--asc",
                "$out0",
            ],
        );
        Ok(())
    });
    let pnr = bld.rule(
        "placing and routing",
        &[nextpnr_setup],
        &[netlist, pcf],
        &[routed],
        "pnr",
    );

    // IceStorm.
    let icestorm_setup = bld.setup("icestorm", |e| {
        e.config_var_or("icetime", "tools.icetime", "icetime")?;
        e.config_var_or("icepack", "tools.icepack", "icepack")?;
        e.config_var_or("iceprog", "tools.iceprog", "iceprog")?;
        e.rule(
            "timing",
            "$icetime",
            &["-d", "$device", "-P", "$package", "-p", "$in1", "-mtr", "$out0", "$in0"],
        );
        e.rule("pack", "$icepack", &["$in0", "$out0"]);
        e.rule("prog-sram", "$iceprog", &["-S", "$in0"]);
        e.rule("prog-flash", "$iceprog", &["$in0"]);
        Ok(())
    });
    let timing = bld.rule(
        "analyzing timing",
        &[icestorm_setup],
        &[routed, pcf],
        &[timing_report],
        "timing",
    );
    let pack = bld.rule(
        "packing bitstream",
        &[icestorm_setup],
        &[routed],
        &[bitstream],
        "pack",
    );
    let prog_sram = bld.rule(
        "programming FPGA (SRAM)",
        &[icestorm_setup],
        &[bitstream],
        &[],
        "prog-sram",
    );
    let prog_flash = bld.rule(
        "programming flash",
        &[icestorm_setup],
        &[bitstream],
        &[],
        "prog-flash",
    );

    // Verilator.
    let verilator_setup = bld.setup("verilator", |e| {
        e.config_var_or("verilator", "tools.verilator", "verilator")?;
        let main = e.add_file("$sim_dir/sim_main.cpp", &SIM_MAIN)?;
        e.var("sim_main", main.as_str())?;
        Ok(())
    });
    let sim_compile = bld.op(
        "sim-compile",
        "compiling simulation",
        &[verilator_setup],
        &[rtl, testbench],
        &[sim_exe],
        compile_sim,
    );
    let sim_run = bld.op(
        "sim-run",
        "simulating",
        &[],
        &[sim_exe],
        &[trace],
        run_sim,
    );

    let viewer_setup = bld.setup("waveform viewer", |e| {
        e.config_var_or("viewer", "sim.viewer", "gtkwave")
    });
    let sim_wave = bld.op(
        "sim-wave",
        "opening waveform viewer",
        &[viewer_setup],
        &[trace],
        &[],
        view_trace,
    );

    // Targets.
    let help = bld.target("help", "list targets and variables", TargetKind::Help);
    bld.target("info", "show the resolved configuration", TargetKind::Info);
    bld.target(
        "build",
        "synthesize, place and route, and pack the bitstream, with reports",
        TargetKind::Stages(vec![pack, timing]),
    );
    bld.target(
        "sim",
        "simulate the test bench and write a waveform trace",
        TargetKind::Stages(vec![sim_run]),
    );
    bld.target(
        "sim_wave",
        "simulate, then open the trace in a waveform viewer",
        TargetKind::Stages(vec![sim_wave]),
    );
    bld.target(
        "reports",
        "produce the timing and utilization reports",
        TargetKind::Stages(vec![timing, synth]),
    );
    bld.target(
        "timing_report",
        "produce the timing report",
        TargetKind::Stages(vec![timing]),
    );
    bld.target(
        "util_report",
        "produce the utilization report",
        TargetKind::Stages(vec![synth]),
    );
    bld.target(
        "prog",
        "load the bitstream into FPGA SRAM",
        TargetKind::Stages(vec![prog_sram]),
    );
    bld.target(
        "prog_flash",
        "write the bitstream to the configuration flash",
        TargetKind::Stages(vec![prog_flash]),
    );
    bld.target(
        "clean",
        "remove the build directory",
        TargetKind::Clean(vec!["$build_dir".to_string()]),
    );
    bld.target(
        "sim_clean",
        "remove the simulation directory",
        TargetKind::Clean(vec!["$sim_dir".to_string()]),
    );
    bld.target(
        "all",
        "build and simulate",
        TargetKind::Stages(vec![pack, timing, sim_run]),
    );
    bld.default_target(help);

    bld.build()
}
