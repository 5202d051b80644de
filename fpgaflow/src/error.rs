//! The error taxonomy for resolving and running build stages.

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A declared input has no producing stage and does not exist on disk.
    #[error("missing source file `{path}` (needed by `{stage}`)")]
    MissingSourceFile { stage: String, path: Utf8PathBuf },

    /// A tool exited unsuccessfully. `code` is `None` when it was killed by a signal.
    #[error("stage `{stage}` failed: {}", describe_exit(.code))]
    StageFailed { stage: String, code: Option<i32> },

    /// A tool exited successfully without producing one of the stage's outputs.
    #[error("stage `{stage}` did not produce `{path}`")]
    MissingExpectedOutput { stage: String, path: Utf8PathBuf },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("tool `{tool}` not found")]
    ToolNotFound { tool: String },

    #[error("unknown target `{0}` (try `help`)")]
    UnknownTarget(String),

    #[error("undefined variable `${0}`")]
    UndefinedVariable(String),

    #[error("undefined rule `{0}`")]
    UndefinedRule(String),

    #[error("failed to launch `{program}`")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] Box<figment::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("tool exited with status {code}"),
        None => "tool was terminated by a signal".to_string(),
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl Error {
    /// The process exit status to report for this error.
    ///
    /// A failing tool's own status passes through unchanged; everything else is 1.
    pub fn exit_status(&self) -> u8 {
        match self {
            Error::StageFailed {
                code: Some(code), ..
            } => u8::try_from(*code).ok().filter(|c| *c != 0).unwrap_or(1),
            _ => 1,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_passes_exit_status_through() {
        let err = Error::StageFailed {
            stage: "pnr".into(),
            code: Some(3),
        };
        assert_eq!(err.exit_status(), 3);
        assert_eq!(err.to_string(), "stage `pnr` failed: tool exited with status 3");
    }

    #[test]
    fn signal_and_out_of_range_statuses_become_one() {
        let killed = Error::StageFailed {
            stage: "synth".into(),
            code: None,
        };
        assert_eq!(killed.exit_status(), 1);
        let weird = Error::StageFailed {
            stage: "synth".into(),
            code: Some(-2),
        };
        assert_eq!(weird.exit_status(), 1);
        assert_eq!(Error::UnknownTarget("x".into()).exit_status(), 1);
    }

    #[test]
    fn cycle_names_the_path() {
        let err = Error::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
