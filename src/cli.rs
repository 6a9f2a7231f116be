use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::RuntimeConfig;
use crate::runtime::Runtime;

#[derive(Parser)]
#[command(name = "sandscript")]
#[command(about = "Run restricted scripts in a sandboxed template engine", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides SANDSCRIPT_CONFIG_PATH)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory for compiled scripts (overrides config file and env vars)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a script
    Run {
        /// Script file
        file: PathBuf,

        /// Input bound as `input` (JSON string)
        #[arg(short = 'i', long = "input", default_value = "{}")]
        input: String,
    },

    /// Print the compiled form of a script
    Compile {
        /// Script file
        file: PathBuf,
    },
}

/// Run the CLI by parsing process arguments
pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli)
}

/// Run the CLI with already parsed arguments
pub fn run_cli_with_args(cli: Cli) -> Result<()> {
    let config = RuntimeConfig::builder()
        .config_path(cli.config)
        .cache_directory(cli.cache_dir)
        .build()
        .context("Failed to load configuration")?;

    let runtime = Runtime::from_config(&config).context("Failed to open the compiled script cache")?;

    match cli.command {
        Commands::Run { file, input } => {
            let script = read_script(&file)?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("Input must be valid JSON")?;

            let result = runtime.run(&script, input)?;

            print!("{}", result.output);
            if let Some(value) = result.return_value {
                if !result.output.is_empty() && !result.output.ends_with('\n') {
                    println!();
                }
                println!("{}", serde_json::to_string_pretty(&value.to_json())?);
            }
        }

        Commands::Compile { file } => {
            let script = read_script(&file)?;
            println!("{}", runtime.compile(&script)?);
        }
    }

    Ok(())
}

fn read_script(file: &PathBuf) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("Failed to read script {}", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::parse_from([
            "sandscript",
            "--cache-dir",
            "/tmp/cache",
            "run",
            "script.sbs",
            "--input",
            "{\"x\": 1}",
        ]);

        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/cache")));
        match cli.command {
            Commands::Run { file, input } => {
                assert_eq!(file, PathBuf::from("script.sbs"));
                assert_eq!(input, "{\"x\": 1}");
            }
            Commands::Compile { .. } => panic!("expected run command"),
        }
    }

    #[test]
    fn test_run_defaults_to_empty_input() {
        let cli = Cli::parse_from(["sandscript", "run", "a.sbs"]);

        assert!(matches!(cli.command, Commands::Run { input, .. } if input == "{}"));
    }

    #[test]
    fn test_run_script_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("add.sbs");
        fs::write(&script, "return input.x + 1;").unwrap();

        let cli = Cli::parse_from([
            "sandscript".to_string(),
            "--cache-dir".to_string(),
            dir.path().join("cache").display().to_string(),
            "run".to_string(),
            script.display().to_string(),
            "--input".to_string(),
            "{\"x\": 4}".to_string(),
        ]);

        run_cli_with_args(cli).unwrap();
        assert_eq!(
            fs::read_dir(dir.path().join("cache").join("sbs"))
                .unwrap()
                .count(),
            1
        );
    }
}
