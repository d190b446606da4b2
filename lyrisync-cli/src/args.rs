use lyrisync_core::LyrisyncConfig;
use std::ffi::OsString;
use std::path::PathBuf;

pub const USAGE: &str = "\
Print synchronized lyrics for a listen-together session

USAGE:
    lyrisync [OPTIONS]

OPTIONS:
    --config <PATH>    Config file (default: ~/.config/lyrisync/config.toml)
    --session <ID>     Session to follow, overriding session.id
    -h, --help         Print this help
";

/// Parsed command line
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub help: bool,
    pub config: Option<PathBuf>,
    pub session: Option<String>,
}

impl CliArgs {
    pub fn from_env() -> Result<Self, pico_args::Error> {
        Self::parse(pico_args::Arguments::from_env())
    }

    pub fn parse(mut args: pico_args::Arguments) -> Result<Self, pico_args::Error> {
        let parsed = Self {
            help: args.contains(["-h", "--help"]),
            config: args.opt_value_from_str("--config")?,
            session: args.opt_value_from_str("--session")?,
        };

        let rest: Vec<OsString> = args.finish();
        if !rest.is_empty() {
            return Err(pico_args::Error::ArgumentParsingFailed {
                cause: format!("unexpected arguments: {rest:?}"),
            });
        }
        Ok(parsed)
    }

    /// Config file to load
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(LyrisyncConfig::config_path)
    }

    /// Apply command line overrides on top of the file config.
    pub fn apply(&self, config: &mut LyrisyncConfig) {
        if let Some(session) = &self.session {
            config.session.id.clone_from(session);
        }
    }
}
