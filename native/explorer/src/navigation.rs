//! Current directory of the active device as a stack of path segments.

use crate::models::FileEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationState {
    segments: Vec<String>,
}

impl NavigationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// `/` at the root, `/a/b` otherwise
    pub fn current_path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    /// Pushes a directory entry's name. Returns false and leaves the stack alone for anything
    /// that is not a directory or has an unusable name.
    pub fn descend_into(&mut self, entry: &FileEntry) -> bool {
        if !entry.is_directory() || !is_plain_name(&entry.name) {
            return false;
        }
        self.segments.push(entry.name.clone());
        true
    }

    pub fn ascend(&mut self) -> bool {
        self.segments.pop().is_some()
    }

    /// Replaces the whole stack with the segments of `entry.path`
    pub fn jump_to(&mut self, entry: &FileEntry) -> bool {
        if !entry.is_directory() {
            return false;
        }
        self.segments = split(&normalize(&entry.path));
        true
    }

    pub fn reset(&mut self) {
        self.segments.clear();
    }
}

/// A single path component that can be pushed onto the stack
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Absolute path without repeated or trailing slashes and with `.`/`..` resolved
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

pub fn join(directory: &str, name: &str) -> String {
    normalize(&format!("{directory}/{name}"))
}

fn split(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect()
}
