use serde::Serialize;
use std::path::PathBuf;

/// One module in the dependency tree of an executable
///
/// A DLL imported by several modules appears once with its dependencies expanded; every later
/// occurrence is a leaf. The depth of such a leaf is the depth at which it was found again, not
/// the depth of the expanded occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyNode {
    /// Name as it appears in the import table (file name for the root)
    pub name: String,
    /// Full path of the file, if it was found
    pub resolved_path: Option<PathBuf>,
    pub depth: usize,
    pub children: Vec<DependencyNode>,
}

impl DependencyNode {
    pub(crate) fn leaf(name: &str, resolved_path: Option<PathBuf>, depth: usize) -> Self {
        Self {
            name: name.to_owned(),
            resolved_path,
            depth,
            children: Vec::new(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.resolved_path.is_some()
    }

    /// Call f on every node, parent first, along with the parent node
    pub fn visit_depth_first<'a>(&'a self, f: &mut impl FnMut(&'a Self, Option<&'a Self>)) {
        self.visit_with_parent(None, f)
    }

    fn visit_with_parent<'a>(
        &'a self,
        parent: Option<&'a Self>,
        f: &mut impl FnMut(&'a Self, Option<&'a Self>),
    ) {
        f(self, parent);
        for c in &self.children {
            c.visit_with_parent(Some(self), f);
        }
    }

    /// Number of nodes in the tree rooted here
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }
}

/// Dependency tree of one of the analyzed files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAnalysisResult {
    pub file_path: PathBuf,
    pub tree: DependencyNode,
}

/// Dependency trees of all the analyzed files, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombinedReport {
    pub files: Vec<FileAnalysisResult>,
}

#[cfg(test)]
mod tests {
    use super::DependencyNode;

    #[test]
    fn depth_first_visit_reports_parents() {
        let mut root = DependencyNode::leaf("a.exe", Some("/a.exe".into()), 0);
        let mut b = DependencyNode::leaf("b.dll", Some("/b.dll".into()), 1);
        b.children.push(DependencyNode::leaf("c.dll", None, 2));
        root.children.push(b);
        root.children.push(DependencyNode::leaf("d.dll", None, 1));

        let mut visited = Vec::new();
        root.visit_depth_first(&mut |n, p| {
            visited.push((n.name.as_str(), p.map(|p| p.name.as_str())))
        });
        assert_eq!(
            visited,
            [
                ("a.exe", None),
                ("b.dll", Some("a.exe")),
                ("c.dll", Some("b.dll")),
                ("d.dll", Some("a.exe")),
            ]
        );
        assert_eq!(root.node_count(), 4);
        assert!(!root.children[1].is_found());
    }
}
