use crate::common::absolute_path;
use crate::lookup_path::LookupPath;
use crate::models::DependencyNode;
use crate::pe::{self, BinaryInfo, ModuleNames};
use crate::query::LookupParameters;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Identity of a module within one tree: the file it resolved to, or its name if not found
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VisitKey {
    Path(String),
    Name(String),
}

impl VisitKey {
    fn new(name: &str, resolved_path: Option<&Path>) -> Self {
        match resolved_path {
            Some(p) => Self::Path(p.to_string_lossy().to_lowercase()),
            None => Self::Name(name.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    /// dependencies are being expanded: meeting the module again means an import cycle
    InProgress,
    Expanded,
}

#[derive(Debug)]
struct Visit {
    name: String,
    resolved_path: Option<PathBuf>,
    state: VisitState,
}

/// Modules already met while building one tree
#[derive(Debug, Default)]
struct VisitedMap {
    index: HashMap<VisitKey, Visit>,
}

impl VisitedMap {
    fn get(&self, key: &VisitKey) -> Option<&Visit> {
        self.index.get(key)
    }

    // must happen before recursing, so that cycles through this module end at a leaf
    fn reserve(&mut self, key: VisitKey, name: &str, resolved_path: Option<PathBuf>) {
        self.index.insert(
            key,
            Visit {
                name: name.to_owned(),
                resolved_path,
                state: VisitState::InProgress,
            },
        );
    }

    fn complete(&mut self, key: &VisitKey) {
        if let Some(v) = self.index.get_mut(key) {
            v.state = VisitState::Expanded;
        }
    }
}

/// Builds the dependency tree of an executable, parsing each dependency as it is found
///
/// Resolution is a depth-first descent. Each distinct module is parsed and expanded at most once
/// per tree; the recursion stops at `max_depth`, at import cycles and (optionally) at DLLs found
/// in the system directories.
pub struct DependencyResolver<'a> {
    lookup_path: &'a LookupPath,
    parameters: LookupParameters,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(lookup_path: &'a LookupPath, parameters: &LookupParameters) -> Self {
        Self {
            lookup_path,
            parameters: parameters.clone(),
        }
    }

    /// Build the tree of the already parsed root executable
    pub fn build_dependency_tree(&self, root: &BinaryInfo) -> DependencyNode {
        let mut visited = VisitedMap::default();

        let name = root
            .file_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.file_path.to_string_lossy().into_owned());
        let resolved_path =
            absolute_path(&root.file_path).unwrap_or_else(|_| root.file_path.clone());
        let key = VisitKey::new(&name, Some(&resolved_path));
        visited.reserve(key.clone(), &name, Some(resolved_path.clone()));

        let children = self.expand_imports(&root.imported_modules, 0, &mut visited);
        visited.complete(&key);

        DependencyNode {
            name,
            resolved_path: Some(resolved_path),
            depth: 0,
            children,
        }
    }

    fn expand_imports(
        &self,
        imports: &ModuleNames,
        depth: usize,
        visited: &mut VisitedMap,
    ) -> Vec<DependencyNode> {
        imports
            .iter()
            .map(|dllname| {
                if self.parameters.skip_system_modules {
                    if let Some(p) = self.lookup_path.resolve(dllname) {
                        if self.lookup_path.is_system(&p) {
                            // system DLLs have just too many dependencies
                            return DependencyNode::leaf(dllname, Some(p), depth + 1);
                        }
                    }
                }
                self.resolve_module(dllname, depth + 1, visited)
            })
            .collect()
    }

    fn resolve_module(
        &self,
        dllname: &str,
        depth: usize,
        visited: &mut VisitedMap,
    ) -> DependencyNode {
        if depth > self.parameters.max_depth {
            return DependencyNode::leaf(dllname, None, depth);
        }

        let resolved_path = self.lookup_path.resolve(dllname);
        let key = VisitKey::new(dllname, resolved_path.as_deref());

        if let Some(v) = visited.get(&key) {
            if v.state == VisitState::InProgress {
                trace!("import cycle closed at {} (depth {})", dllname, depth);
            }
            return DependencyNode::leaf(&v.name, v.resolved_path.clone(), depth);
        }
        visited.reserve(key.clone(), dllname, resolved_path.clone());

        let mut node = DependencyNode::leaf(dllname, resolved_path.clone(), depth);
        let path = match resolved_path {
            Some(p) if p.is_file() => p,
            _ => {
                visited.complete(&key);
                return node;
            }
        };

        match pe::parse(&path) {
            Ok(info) => {
                node.children = self.expand_imports(&info.imported_modules, depth, visited);
            }
            Err(e) => debug!("not expanding {}: {}", dllname, e),
        }
        visited.complete(&key);
        node
    }
}
