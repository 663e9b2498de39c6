//! ghost-cov command line
//!
//! Runs a program under the debugger and reports which source lines and
//! conditional branches of the selected modules were executed.
//!
//! ```text
//! ghost-cov --modules "*app*" --sources "*\src\*" -- C:\build\app.exe --flag
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use ghost_cov_common::{
    init_logging, CoverageConfig, CoverageData, RunCoverageSettings, StartInfo,
};
use ghost_cov_core::{CoverageRunner, DebugLoop, WildcardFilter};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "ghost-cov")]
#[command(about = "Line and branch coverage for native programs, collected under the debugger")]
#[command(version)]
struct Args {
    /// Program to run
    program: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Working directory of the program
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module path patterns to cover (`*` wildcard, case-insensitive)
    #[arg(long = "modules", value_name = "PATTERN")]
    modules: Vec<String>,

    #[arg(long = "excluded-modules", value_name = "PATTERN")]
    excluded_modules: Vec<String>,

    /// Source file patterns to cover
    #[arg(long = "sources", value_name = "PATTERN")]
    sources: Vec<String>,

    #[arg(long = "excluded-sources", value_name = "PATTERN")]
    excluded_sources: Vec<String>,

    /// Also cover processes started by the program
    #[arg(long)]
    cover_children: bool,

    /// Keep going when the program dies of an unhandled C++ exception
    #[arg(long)]
    continue_after_cpp_exception: bool,

    /// Write the coverage tree as JSON
    #[arg(long, value_name = "FILE")]
    export_json: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Merge command line flags over the configuration file
fn apply_overrides(mut config: CoverageConfig, args: &Args) -> CoverageConfig {
    config.filter.modules.extend(args.modules.iter().cloned());
    config
        .filter
        .excluded_modules
        .extend(args.excluded_modules.iter().cloned());
    config.filter.sources.extend(args.sources.iter().cloned());
    config
        .filter
        .excluded_sources
        .extend(args.excluded_sources.iter().cloned());

    config.cover_children |= args.cover_children;
    config.continue_after_cpp_exception |= args.continue_after_cpp_exception;
    if args.export_json.is_some() {
        config.export_json = args.export_json.clone();
    }
    if args.verbose {
        config.logging = config.logging.with_level("debug");
    }
    config
}

fn settings(config: &CoverageConfig, args: &Args) -> RunCoverageSettings {
    let mut start_info = StartInfo::new(&args.program).with_args(args.args.clone());
    if let Some(dir) = &args.workdir {
        start_info = start_info.with_working_directory(dir);
    }

    RunCoverageSettings {
        start_info,
        cover_children: config.cover_children,
        continue_after_cpp_exception: config.continue_after_cpp_exception,
    }
}

#[cfg(windows)]
fn debug_loop(cover_children: bool) -> Result<Box<dyn DebugLoop>> {
    Ok(Box::new(ghost_cov_core::win32::Debugger::new(cover_children)))
}

#[cfg(not(windows))]
fn debug_loop(_cover_children: bool) -> Result<Box<dyn DebugLoop>> {
    Err(ghost_cov_common::Error::NotSupported(
        "ghost-cov needs the Windows debug API".to_string(),
    )
    .into())
}

fn print_summary(data: &CoverageData) {
    println!();
    println!("Coverage for {} (exit code {})", data.name, data.exit_code);

    for module in &data.modules {
        let mut lines = (0usize, 0usize);
        for file in &module.files {
            lines.0 += file.lines.iter().filter(|l| l.executed).count();
            lines.1 += file.lines.len();
        }
        println!(
            "  {:<60} {:>6}/{:<6} lines",
            module.path, lines.0, lines.1
        );
    }

    let stats = data.stats();
    println!();
    println!(
        "Lines:    {}/{} ({:.1}%)",
        stats.lines_executed,
        stats.lines_total,
        stats.line_rate() * 100.0
    );
    println!(
        "Branches: {}/{} ({:.1}%)",
        stats.branches_executed,
        stats.branches_total,
        stats.branch_rate() * 100.0
    );
}

fn export_json(data: &CoverageData, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize coverage")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "Coverage exported");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => CoverageConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CoverageConfig::default(),
    };
    let config = apply_overrides(config, &args);
    init_logging(&config.logging);

    let settings = settings(&config, &args);
    let mut debug_loop = debug_loop(settings.cover_children)?;
    let filter = WildcardFilter::new(&config.filter).context("Invalid filter pattern")?;
    let mut runner = CoverageRunner::new(Box::new(filter));

    let data = runner
        .run_coverage(debug_loop.as_mut(), &settings)
        .with_context(|| format!("Coverage run of {} failed", args.program.display()))?;

    print_summary(&data);
    if let Some(path) = &config.export_json {
        export_json(&data, path)?;
    }

    std::process::exit(data.exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_program_arguments_are_passed_through() {
        let args = parse(&["ghost-cov", "--cover-children", "app.exe", "input.txt", "--level", "3"]);
        assert_eq!(args.program, PathBuf::from("app.exe"));
        assert_eq!(args.args, vec!["input.txt", "--level", "3"]);
        assert!(args.cover_children);
    }

    #[test]
    fn test_flags_extend_config_file() {
        let config = CoverageConfig::from_toml(
            r#"
            cover_children = false

            [filter]
            modules = ["*app.exe"]
            "#,
        )
        .unwrap();
        let args = parse(&[
            "ghost-cov",
            "--modules",
            "*plugin.dll",
            "--excluded-sources",
            "*\\third_party\\*",
            "--cover-children",
            "--verbose",
            "app.exe",
        ]);

        let config = apply_overrides(config, &args);
        assert_eq!(config.filter.modules, vec!["*app.exe", "*plugin.dll"]);
        assert_eq!(config.filter.excluded_sources, vec!["*\\third_party\\*"]);
        assert!(config.cover_children);
        assert!(!config.continue_after_cpp_exception);
        assert_eq!(config.logging.level, "debug");

        let settings = settings(&config, &args);
        assert!(settings.cover_children);
        assert_eq!(settings.start_info.program, PathBuf::from("app.exe"));
    }

    #[test]
    fn test_export_json_flag_wins() {
        let config = CoverageConfig {
            export_json: Some(PathBuf::from("from-config.json")),
            ..Default::default()
        };
        let args = parse(&["ghost-cov", "--export-json", "cli.json", "app.exe"]);
        let config = apply_overrides(config, &args);
        assert_eq!(config.export_json, Some(PathBuf::from("cli.json")));
    }
}
