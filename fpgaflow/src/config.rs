use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Which synthesis argument set to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Release,
    Debug,
}

impl FromStr for BuildMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "release" => Ok(BuildMode::Release),
            "debug" => Ok(BuildMode::Debug),
            _ => Err(format!("unknown build mode `{}` (expected release or debug)", s)),
        }
    }
}

impl Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMode::Release => write!(f, "release"),
            BuildMode::Debug => write!(f, "debug"),
        }
    }
}

/// The physical target: an FPGA part in a package, plus its pin constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub device: String,
    pub package: String,
    pub pcf: Utf8PathBuf,
}

impl Default for Board {
    fn default() -> Self {
        Self {
            device: "hx1k".to_string(),
            package: "tq144".to_string(),
            pcf: "boards/icestick.pcf".into(),
        }
    }
}

/// The typed part of the configuration. Every run gets one of these, and it never changes
/// during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// The design to build; picks the source subdirectory and all output basenames.
    pub project: String,
    pub mode: BuildMode,
    pub board: Board,

    /// The project directory. Tools run here, and relative paths are relative to it.
    pub root: Utf8PathBuf,
    pub rtl_dir: Utf8PathBuf,
    pub build_dir: Utf8PathBuf,
    pub sim_dir: Utf8PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            project: "led_blink".to_string(),
            mode: BuildMode::Release,
            board: Board::default(),
            root: ".".into(),
            rtl_dir: "rtl".into(),
            build_dir: "build".into(),
            sim_dir: "sim".into(),
        }
    }
}

impl BuildConfig {
    /// Resolve a project-relative path against the root.
    pub fn path(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Environment variables that act as configuration overrides, and the keys they set.
const ENV_KEYS: &[(&str, &str)] = &[("PROJ_NAME", "project"), ("MODE", "mode")];

/// Translate a command-line or environment variable name into a configuration key. Known
/// make-style names map to their keys; anything else is taken as a (dotted) key verbatim.
pub fn config_key(name: &str) -> String {
    ENV_KEYS
        .iter()
        .find(|(var, _)| var.eq_ignore_ascii_case(name))
        .map(|(_, key)| key.to_string())
        .unwrap_or_else(|| name.to_string())
}

pub struct Config {
    pub build: BuildConfig,

    /// The full layered configuration, including keys that are not part of `BuildConfig`
    /// (tool paths and the like).
    pub data: Figment,
}

impl Config {
    /// The file-based layers for an application called `app`: built-in defaults, then
    /// `~/.config/<app>.toml`, then `<app>.toml` in the current directory.
    pub fn figment(app: &str) -> Figment {
        let file_name = format!("{}.toml", app);
        let mut fig = Figment::from(Serialized::defaults(BuildConfig::default()));

        // The user configuration is usually at `~/.config/<app>.toml`.
        let config_base = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .or_else(|| std::env::var("HOME").ok().map(|home| home + "/.config"));
        if let Some(base) = config_base {
            fig = fig.merge(Toml::file(Utf8Path::new(&base).join(&file_name)));
        }

        fig.merge(Toml::file(file_name))
    }

    /// The `PROJ_NAME` and `MODE` environment variables.
    fn env() -> Env {
        let vars: Vec<&str> = ENV_KEYS.iter().map(|(var, _)| *var).collect();
        Env::raw()
            .only(&vars)
            .map(|var| config_key(var.as_str()).into())
    }

    /// Extract the typed configuration from a fully layered figment.
    pub fn from_figment(fig: Figment) -> std::result::Result<Self, figment::Error> {
        let build: BuildConfig = fig.extract()?;
        Ok(Self { build, data: fig })
    }

    /// Load the configuration for `app`. On top of the file layers come a project-local
    /// `<root>/<app>.toml` (when a root is given), then the environment, then `NAME=value`
    /// overrides from the command line. An explicit root always wins.
    pub fn load(
        app: &str,
        root: Option<&Utf8Path>,
        overrides: &[(String, String)],
    ) -> Result<Self> {
        let mut fig = Self::figment(app);
        if let Some(root) = root {
            fig = fig.merge(Toml::file(root.join(format!("{}.toml", app))));
        }
        fig = fig.merge(Self::env());
        for (name, value) in overrides {
            fig = fig.merge((config_key(name), value.as_str()));
        }
        if let Some(root) = root {
            fig = fig.merge(("root", root.as_str()));
        }
        Ok(Self::from_figment(fig)?)
    }

    /// Fetch a string configuration value, if present.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.extract_inner::<String>(key).ok()
    }
}
