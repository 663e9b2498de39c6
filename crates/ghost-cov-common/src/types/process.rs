//! Process launch types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Program to start under the debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInfo {
    /// Path to the executable
    pub program: PathBuf,

    /// Command line arguments, not including the program
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Working directory (None = inherit)
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl StartInfo {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            working_directory: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.arguments = args;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Name the coverage run is reported under
    pub fn run_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Full command line with Windows quoting rules applied to each argument
    pub fn command_line(&self) -> String {
        std::iter::once(quote_argument(&self.program.to_string_lossy()))
            .chain(self.arguments.iter().map(|a| quote_argument(a)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

/// Everything a coverage run needs besides its collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCoverageSettings {
    pub start_info: StartInfo,

    /// Also debug processes spawned by the target
    #[serde(default)]
    pub cover_children: bool,

    /// Keep running after an unhandled C++ exception instead of failing
    #[serde(default)]
    pub continue_after_cpp_exception: bool,
}

impl RunCoverageSettings {
    pub fn new(start_info: StartInfo) -> Self {
        Self {
            start_info,
            cover_children: false,
            continue_after_cpp_exception: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_name_is_file_name() {
        let info = StartInfo::new("C:/build/Debug/app.exe");
        assert_eq!(info.run_name(), "app.exe");
    }

    #[test]
    fn test_command_line_quoting() {
        let info = StartInfo::new("app.exe").with_args(vec![
            "plain".to_string(),
            "with space".to_string(),
            "say \"hi\"".to_string(),
            String::new(),
        ]);
        assert_eq!(
            info.command_line(),
            r#"app.exe plain "with space" "say \"hi\"" """#
        );
    }

    #[test]
    fn test_trailing_backslash_is_doubled_inside_quotes() {
        let info = StartInfo::new("app.exe").with_args(vec!["C:\\my dir\\".to_string()]);
        assert_eq!(info.command_line(), r#"app.exe "C:\my dir\\""#);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = RunCoverageSettings::new(StartInfo::new("app.exe"));
        assert!(!settings.cover_children);
        assert!(!settings.continue_after_cpp_exception);
        assert!(settings.start_info.working_directory.is_none());
    }
}
