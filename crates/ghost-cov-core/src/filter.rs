//! Wildcard include/exclude coverage filter

use crate::traits::CoverageFilter;
use ghost_cov_common::{Error, FilterConfig, LineInfo, ModuleImage, Result};
use regex::{Regex, RegexBuilder};

/// Case-insensitive glob where `*` matches any run of characters and `?`
/// any single character
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    regex: Regex,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut regex_pattern = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '*' => regex_pattern.push_str(".*"),
                '?' => regex_pattern.push('.'),
                _ => regex_pattern.push_str(&regex::escape(&ch.to_string())),
            }
        }
        regex_pattern.push('$');

        let regex = RegexBuilder::new(&regex_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Config(format!("Invalid pattern '{}': {}", pattern, e)))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Selects modules and source files by wildcard pattern
///
/// An empty include list selects everything. Exclusions win over inclusions.
/// Every line of a selected file is selected.
#[derive(Debug, Clone, Default)]
pub struct WildcardFilter {
    modules: Vec<WildcardPattern>,
    excluded_modules: Vec<WildcardPattern>,
    sources: Vec<WildcardPattern>,
    excluded_sources: Vec<WildcardPattern>,
}

fn compile(patterns: &[String]) -> Result<Vec<WildcardPattern>> {
    patterns.iter().map(|p| WildcardPattern::new(p)).collect()
}

fn is_selected(path: &str, include: &[WildcardPattern], exclude: &[WildcardPattern]) -> bool {
    let included = include.is_empty() || include.iter().any(|p| p.matches(path));
    included && !exclude.iter().any(|p| p.matches(path))
}

impl WildcardFilter {
    /// Compile every pattern of `config` once
    pub fn new(config: &FilterConfig) -> Result<Self> {
        Ok(Self {
            modules: compile(&config.modules)?,
            excluded_modules: compile(&config.excluded_modules)?,
            sources: compile(&config.sources)?,
            excluded_sources: compile(&config.excluded_sources)?,
        })
    }
}

impl CoverageFilter for WildcardFilter {
    fn is_module_selected(&self, module_path: &str) -> bool {
        is_selected(module_path, &self.modules, &self.excluded_modules)
    }

    fn is_source_file_selected(&self, file_path: &str) -> bool {
        is_selected(file_path, &self.sources, &self.excluded_sources)
    }

    fn is_line_selected(
        &self,
        _module: &ModuleImage,
        file_path: &str,
        _function_name: &str,
        _line: &LineInfo,
    ) -> bool {
        self.is_source_file_selected(file_path)
    }
}
