//! Coverage result tree
//!
//! `CoverageData` → `ModuleCoverage` → `FileCoverage` → `LineCoverage` →
//! `BranchCoverage`. Built once at the end of a run, read-only afterwards.

use serde::{Deserialize, Serialize};

/// Outcome of one side of a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCoverage {
    pub number: u32,
    pub executed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCoverage {
    pub line_number: u32,
    pub executed: bool,
    #[serde(default)]
    pub branches: Vec<BranchCoverage>,
}

impl LineCoverage {
    pub fn new(line_number: u32, executed: bool) -> Self {
        Self {
            line_number,
            executed,
            branches: Vec::new(),
        }
    }

    pub fn add_branch(&mut self, number: u32, executed: bool) -> &mut BranchCoverage {
        self.branches.push(BranchCoverage { number, executed });
        let last = self.branches.len() - 1;
        &mut self.branches[last]
    }

    pub fn branch(&self, number: u32) -> Option<&BranchCoverage> {
        self.branches.iter().find(|b| b.number == number)
    }
}

/// Upsert keeping `lines` sorted by line number
fn upsert_line(lines: &mut Vec<LineCoverage>, line_number: u32, executed: bool) -> &mut LineCoverage {
    let index = match lines.binary_search_by_key(&line_number, |l| l.line_number) {
        Ok(index) => {
            lines[index].executed = executed;
            index
        }
        Err(index) => {
            lines.insert(index, LineCoverage::new(line_number, executed));
            index
        }
    };
    &mut lines[index]
}

fn find_line(lines: &[LineCoverage], line_number: u32) -> Option<&LineCoverage> {
    lines
        .binary_search_by_key(&line_number, |l| l.line_number)
        .ok()
        .map(|index| &lines[index])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCoverage {
    pub class_name: String,
    pub method_name: String,
    pub lines: Vec<LineCoverage>,
}

impl MethodCoverage {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
            lines: Vec::new(),
        }
    }

    pub fn add_line(&mut self, line_number: u32, executed: bool) -> &mut LineCoverage {
        upsert_line(&mut self.lines, line_number, executed)
    }

    pub fn line(&self, line_number: u32) -> Option<&LineCoverage> {
        find_line(&self.lines, line_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverage {
    pub path: String,
    pub lines: Vec<LineCoverage>,
    #[serde(default)]
    pub methods: Vec<MethodCoverage>,
}

impl FileCoverage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lines: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Insert a line, or overwrite the executed state of an existing one
    pub fn add_line(&mut self, line_number: u32, executed: bool) -> &mut LineCoverage {
        upsert_line(&mut self.lines, line_number, executed)
    }

    pub fn add_method(
        &mut self,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> &mut MethodCoverage {
        self.methods.push(MethodCoverage::new(class_name, method_name));
        let last = self.methods.len() - 1;
        &mut self.methods[last]
    }

    pub fn line(&self, line_number: u32) -> Option<&LineCoverage> {
        find_line(&self.lines, line_number)
    }

    pub fn method(&self, class_name: &str, method_name: &str) -> Option<&MethodCoverage> {
        self.methods
            .iter()
            .find(|m| m.class_name == class_name && m.method_name == method_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCoverage {
    pub path: String,
    pub files: Vec<FileCoverage>,
}

impl ModuleCoverage {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, path: impl Into<String>) -> &mut FileCoverage {
        self.files.push(FileCoverage::new(path));
        let last = self.files.len() - 1;
        &mut self.files[last]
    }

    pub fn file(&self, path: &str) -> Option<&FileCoverage> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Aggregated counters over a coverage tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub lines_executed: usize,
    pub lines_total: usize,
    pub branches_executed: usize,
    pub branches_total: usize,
}

impl CoverageStats {
    /// Executed lines over total lines, 0.0 when nothing was instrumented
    pub fn line_rate(&self) -> f64 {
        rate(self.lines_executed, self.lines_total)
    }

    pub fn branch_rate(&self) -> f64 {
        rate(self.branches_executed, self.branches_total)
    }
}

fn rate(executed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        executed as f64 / total as f64
    }
}

/// Result of one coverage run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageData {
    pub name: String,
    pub exit_code: i32,
    pub modules: Vec<ModuleCoverage>,
}

impl CoverageData {
    pub fn new(name: impl Into<String>, exit_code: i32) -> Self {
        Self {
            name: name.into(),
            exit_code,
            modules: Vec::new(),
        }
    }

    pub fn add_module(&mut self, path: impl Into<String>) -> &mut ModuleCoverage {
        self.modules.push(ModuleCoverage::new(path));
        let last = self.modules.len() - 1;
        &mut self.modules[last]
    }

    pub fn module(&self, path: &str) -> Option<&ModuleCoverage> {
        self.modules.iter().find(|m| m.path == path)
    }

    pub fn stats(&self) -> CoverageStats {
        let mut stats = CoverageStats::default();
        let lines = self
            .modules
            .iter()
            .flat_map(|m| m.files.iter())
            .flat_map(|f| f.lines.iter());

        for line in lines {
            stats.lines_total += 1;
            if line.executed {
                stats.lines_executed += 1;
            }
            stats.branches_total += line.branches.len();
            stats.branches_executed += line.branches.iter().filter(|b| b.executed).count();
        }
        stats
    }
}
