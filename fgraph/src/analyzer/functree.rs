//! Call trees produced by the analyzer
//!
//! Every node owns its children. Offsets are file offsets into the target
//! binary, which is what uprobes attach by; `rel` values in the printed form
//! are relative to the function's first byte.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::domain::ResolutionError;
use crate::registers::Register;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncTree {
    /// Symbol table name
    pub name: String,
    pub display_name: String,
    /// Link-time address of the first instruction
    pub address: u64,
    /// File offset of the first instruction
    pub file_offset: u64,
    /// File offset right after the frame link is set up
    pub entry_offset: u64,
    pub return_offsets: Vec<u64>,
    /// Extra probe points: `name+N` patterns and indirect-call sites
    pub custom_offsets: Vec<u64>,
    /// Register-indirect call sites by file offset
    pub indirect_calls: BTreeMap<u64, Register>,
    pub children: Vec<FuncTree>,
    /// Matched one of the user's patterns
    pub root: bool,
    /// Already reached through another path; listed but not expanded
    pub pruned: bool,
    pub error: Option<ResolutionError>,
}

impl FuncTree {
    #[must_use]
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            address: 0,
            file_offset: 0,
            entry_offset: 0,
            return_offsets: Vec::new(),
            custom_offsets: Vec::new(),
            indirect_calls: BTreeMap::new(),
            children: Vec::new(),
            root: false,
            pruned: false,
            error: None,
        }
    }

    /// Whether this node should produce probes
    #[must_use]
    pub fn is_instrumentable(&self) -> bool {
        self.error.is_none() && !self.pruned
    }

    /// Offset of `file_offset` from the start of the function
    #[must_use]
    pub fn relative(&self, file_offset: u64) -> u64 {
        file_offset.saturating_sub(self.file_offset)
    }

    /// Pre-order traversal
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a FuncTree)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut FuncTree)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }

    /// First node named `name`, in pre-order
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&FuncTree> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// One-line description used when logging the tree
    #[must_use]
    pub fn describe(&self) -> String {
        if let Some(err) = &self.error {
            return format!("{}: {err}", self.display_name);
        }
        if self.pruned {
            return format!("{} (seen)", self.display_name);
        }

        let mut line = format!(
            "{}(0x{:x}): fp=+{} rets=[",
            self.display_name,
            self.address,
            self.relative(self.entry_offset)
        );
        push_offsets(&mut line, self, &self.return_offsets);
        line.push_str("] customs=[");
        push_offsets(&mut line, self, &self.custom_offsets);
        line.push(']');
        if !self.indirect_calls.is_empty() {
            line.push_str(" regcalls=[");
            for (i, (offset, reg)) in self.indirect_calls.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                line.push_str(&format!("+{}:{reg}", self.relative(*offset)));
            }
            line.push(']');
        }
        line
    }

    /// Log the tree, two spaces of indentation per level
    pub fn print(&self) {
        self.print_at(0);
    }

    fn print_at(&self, depth: usize) {
        let indent = "  ".repeat(depth);
        if self.error.is_some() {
            warn!("{indent}{}", self.describe());
        } else {
            info!("{indent}{}", self.describe());
        }
        for child in &self.children {
            child.print_at(depth + 1);
        }
    }
}

fn push_offsets(line: &mut String, tree: &FuncTree, offsets: &[u64]) {
    for (i, offset) in offsets.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&format!("+{}", tree.relative(*offset)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FuncTree {
        let mut root = FuncTree::new("foo", "foo");
        root.address = 0x401000;
        root.file_offset = 0x1000;
        root.entry_offset = 0x1004;
        root.return_offsets = vec![0x100a, 0x1020];
        root.indirect_calls.insert(0x1010, Register::Rax);

        let mut bar = FuncTree::new("bar", "bar");
        bar.error = Some(ResolutionError::Excluded);
        let mut baz = FuncTree::new("baz", "baz");
        baz.pruned = true;
        root.children = vec![bar, baz];
        root
    }

    #[test]
    fn test_describe_node() {
        let tree = sample();
        assert_eq!(
            tree.describe(),
            "foo(0x401000): fp=+4 rets=[+10 +32] customs=[] regcalls=[+16:rax]"
        );
        assert_eq!(tree.children[0].describe(), "bar: excluded by pattern");
        assert_eq!(tree.children[1].describe(), "baz (seen)");
    }

    #[test]
    fn test_walk_preorder() {
        let tree = sample();
        let mut names = Vec::new();
        tree.walk(&mut |node| names.push(node.name.as_str()));
        assert_eq!(names, ["foo", "bar", "baz"]);
    }

    #[test]
    fn test_find_and_instrumentable() {
        let tree = sample();
        assert!(tree.is_instrumentable());
        assert!(!tree.find("bar").unwrap().is_instrumentable());
        assert!(!tree.find("baz").unwrap().is_instrumentable());
        assert!(tree.find("qux").is_none());
    }
}
