use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub renderer: RendererConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Command that hosts isolation contexts.
///
/// One renderer process is started per run. It receives the document on
/// stdin and writes every message the document posts to its parent as
/// one JSON line on stdout.
#[derive(Debug, Deserialize, Clone)]
pub struct RendererConfig {
    /// Supports ${ENV_VAR} substitution
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Prefix each console line with its local time
    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            timestamps: default_timestamps(),
        }
    }
}

fn default_timestamps() -> bool {
    true
}

impl RendererConfig {
    /// Human-readable command line, e.g. `node renderer/jsdom-host.js`
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${PLAYGROUND_RENDERER}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
