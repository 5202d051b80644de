use icemake::build_driver;
use std::process::ExitCode;

fn main() -> ExitCode {
    let driver = build_driver();
    fpgaflow::cli::main("icemake", &driver)
}
