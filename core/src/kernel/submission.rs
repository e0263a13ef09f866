//! Splitting of code submissions by kernel-selector directives
//!
//! A line `#!name` where `name` is a known kernel starts a section for
//! that kernel. Any other `#!` line is left in the code.

/// A run of code addressed to one kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// None for code before the first selector
    pub kernel_name: Option<String>,
    pub code: String,
}

impl Section {
    fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }
}

/// Name selected by a `#!name` line, whether or not it is a kernel
pub fn kernel_directive(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("#!")?
        .split_whitespace()
        .next()
}

/// Split `code` into sections; blank sections are dropped
pub fn split_submission<F>(code: &str, is_kernel_name: F) -> Vec<Section>
where
    F: Fn(&str) -> bool,
{
    let mut sections = Vec::new();
    let mut kernel_name: Option<String> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in code.lines() {
        match kernel_directive(line).filter(|name| is_kernel_name(name)) {
            Some(name) => {
                push_section(&mut sections, kernel_name.take(), &lines);
                lines.clear();
                kernel_name = Some(name.to_string());
            }
            None => lines.push(line),
        }
    }
    push_section(&mut sections, kernel_name, &lines);
    sections
}

fn push_section(sections: &mut Vec<Section>, kernel_name: Option<String>, lines: &[&str]) {
    let section = Section {
        kernel_name,
        code: lines.join("\n"),
    };
    if !section.is_blank() {
        sections.push(section);
    }
}
