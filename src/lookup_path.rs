use crate::common::absolute_path;
use crate::query::LookupQuery;
use crate::system::{WinFileSystemCache, WindowsSystem};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Directory to be searched, and where it comes from
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Windows System directory (typically C:\Windows\System32)
    SystemDir(PathBuf),
    /// PATH as specified by the environment of this process
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn get_path(&self) -> &Path {
        match self {
            Self::ExecutableDir(p)
            | Self::SystemDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => p,
        }
    }
}

/// Sorted list of directories to be looked up when searching for a DLL
///
/// Mirrors the standard search order for desktop applications, minus the entries that need the
/// loader itself (KnownDLLs, API sets, the 16-bit and Windows directories, the working directory):
/// 1) application directory
/// 2) system directory
/// 3) PATH environment variable
/// 4) directories added by the user
///
/// The list is computed once, when the LookupPath is built.
pub struct LookupPath {
    pub entries: Vec<LookupPathEntry>,
    system: Option<WindowsSystem>,
    fs_cache: std::cell::RefCell<WinFileSystemCache>,
}

impl LookupPath {
    /// Build the search path for the query, with an explicit PATH
    pub fn with_env_path(query: &LookupQuery, env_path: Vec<PathBuf>) -> Self {
        let candidates = std::iter::once(LookupPathEntry::ExecutableDir(
            query.target.app_dir.clone(),
        ))
        .chain(
            query
                .system
                .as_ref()
                .map(|s| LookupPathEntry::SystemDir(s.sys_dir.clone())),
        )
        .chain(env_path.into_iter().map(LookupPathEntry::SystemPath))
        .chain(
            query
                .target
                .user_path
                .iter()
                .cloned()
                .map(LookupPathEntry::UserPath),
        );

        let mut seen = HashSet::new();
        let entries = candidates
            .filter(|e| !e.get_path().as_os_str().is_empty())
            .filter(|e| seen.insert(e.get_path().to_string_lossy().to_lowercase()))
            .collect();

        // resolved paths are canonical, so compare them against canonical system directories
        let system = query.system.clone().map(|s| WindowsSystem {
            sys_dir: canonical_or_same(s.sys_dir),
            wow64_dir: s.wow64_dir.map(canonical_or_same),
            win_dir: s.win_dir,
        });

        Self {
            entries,
            system,
            fs_cache: std::cell::RefCell::new(WinFileSystemCache::new()),
        }
    }

    /// Find the file a module name (or a path) refers to
    ///
    /// An existing file path is returned as is, in absolute form; otherwise the entries are
    /// tested in order, first with the exact name and then ignoring case.
    pub fn resolve(&self, name_or_path: &str) -> Option<PathBuf> {
        let as_path = Path::new(name_or_path);
        if as_path.is_file() {
            return Some(absolute_path(as_path).unwrap_or_else(|_| as_path.to_owned()));
        }

        for e in &self.entries {
            if let Some(found) = self.search_file_in_folder(OsStr::new(name_or_path), e.get_path())
            {
                trace!("{} => {}", name_or_path, found.display());
                return Some(absolute_path(&found).unwrap_or(found));
            }
        }
        trace!("{} not found", name_or_path);
        None
    }

    /// Whether the path lies within the system (or WOW64) directory
    pub fn is_system<P: AsRef<Path>>(&self, p: P) -> bool {
        self.system
            .as_ref()
            .map(|s| s.contains(p))
            .unwrap_or(false)
    }

    fn search_file_in_folder(&self, filename: &OsStr, folder: &Path) -> Option<PathBuf> {
        let exact = folder.join(filename);
        if exact.is_file() {
            return Some(exact);
        }
        self.fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(filename, folder)
            .ok()
            .flatten()
            .filter(|p| p.is_file())
    }
}

fn canonical_or_same(p: PathBuf) -> PathBuf {
    absolute_path(&p).unwrap_or(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LookupError;
    use fs_err as fs;

    fn query_in(app_dir: &Path, system: Option<WindowsSystem>) -> Result<LookupQuery, LookupError> {
        LookupQuery::with_system(app_dir.join("app.exe"), system)
    }

    #[test]
    fn search_order_is_deduplicated() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let app = dir.path().join("app");
        let sys = dir.path().join("sys");
        let system = WindowsSystem {
            win_dir: dir.path().to_owned(),
            sys_dir: sys.clone(),
            wow64_dir: None,
        };
        let mut query = query_in(&app, Some(system))?;
        query.target.user_path.push(dir.path().join("user"));
        let env_path = vec![
            dir.path().join("p1"),
            PathBuf::new(),
            app.clone(),
            dir.path().join("p1"),
            dir.path().join("p2"),
        ];

        let lookup_path = LookupPath::with_env_path(&query, env_path);
        assert_eq!(
            lookup_path.entries,
            vec![
                LookupPathEntry::ExecutableDir(app),
                LookupPathEntry::SystemDir(sys),
                LookupPathEntry::SystemPath(dir.path().join("p1")),
                LookupPathEntry::SystemPath(dir.path().join("p2")),
                LookupPathEntry::UserPath(dir.path().join("user")),
            ]
        );
        Ok(())
    }

    #[test]
    fn first_directory_wins() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let app = dir.path().join("app");
        let p1 = dir.path().join("p1");
        let p2 = dir.path().join("p2");
        for d in [&app, &p1, &p2] {
            fs::create_dir_all(d)?;
        }
        fs::write(p1.join("common.dll"), b"")?;
        fs::write(p2.join("common.dll"), b"")?;
        fs::write(p2.join("Mixed.DLL"), b"")?;
        fs::create_dir_all(p1.join("folder.dll"))?;

        let lookup_path =
            LookupPath::with_env_path(&query_in(&app, None)?, vec![p1.clone(), p2.clone()]);
        assert_eq!(
            lookup_path.resolve("common.dll"),
            Some(absolute_path(p1.join("common.dll"))?)
        );
        assert_eq!(
            lookup_path.resolve("MIXED.dll"),
            Some(absolute_path(p2.join("Mixed.DLL"))?)
        );
        // directories are never a match
        assert_eq!(lookup_path.resolve("folder.dll"), None);
        assert_eq!(lookup_path.resolve("nowhere.dll"), None);
        Ok(())
    }

    #[test]
    fn existing_paths_resolve_to_themselves() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("direct.exe");
        fs::write(&file, b"")?;
        let lookup_path = LookupPath::with_env_path(&query_in(dir.path(), None)?, vec![]);
        let resolved = lookup_path.resolve(file.to_str().unwrap()).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved, absolute_path(&file)?);
        Ok(())
    }

    #[test]
    fn system_detection_needs_a_system() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let sys = dir.path().join("Windows").join("System32");
        let query = query_in(
            dir.path(),
            Some(WindowsSystem {
                win_dir: dir.path().join("Windows"),
                sys_dir: sys.clone(),
                wow64_dir: None,
            }),
        )?;
        assert!(LookupPath::with_env_path(&query, vec![]).is_system(sys.join("kernel32.dll")));

        let query = query_in(dir.path(), None)?;
        assert!(!LookupPath::with_env_path(&query, vec![]).is_system(sys.join("kernel32.dll")));
        Ok(())
    }
}
