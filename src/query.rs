//! Data structures that must be filled with the input and the parameters for the DLL scan

use crate::common::LookupError;
use crate::system::WindowsSystem;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Clone, Debug)]
pub struct LookupTarget {
    /// Path to the target executable
    pub target_exe: PathBuf,
    /// Parent directory of target_exe, cached for performance purposes
    pub app_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupParameters {
    /// Deepest level whose dependencies are still expanded; the root sits at depth 0
    pub max_depth: usize,
    /// Record DLLs found in system directories without expanding their dependencies
    pub skip_system_modules: bool,
}

impl Default for LookupParameters {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            skip_system_modules: false,
        }
    }
}

/// Complete specification of a search task
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub system: Option<WindowsSystem>,
    pub target: LookupTarget,
    pub parameters: LookupParameters,
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, LookupError> {
        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(&target_exe);

        Self::with_system(target_exe, system)
    }

    /// Build a query for the given executable, using the given Windows system for the lookup
    pub fn with_system<P: AsRef<Path>>(
        target_exe: P,
        system: Option<WindowsSystem>,
    ) -> Result<Self, LookupError> {
        let target_exe = target_exe.as_ref();
        let app_dir = target_exe.parent().ok_or_else(|| {
            LookupError::ContextDeductionError(format!(
                "Could not find application directory for given executable {}",
                target_exe.display()
            ))
        })?;
        // a bare filename has an empty parent: the executable sits in the working directory
        let app_dir = if app_dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            app_dir
        };
        Ok(Self {
            system,
            target: LookupTarget {
                target_exe: target_exe.to_owned(),
                app_dir: app_dir.to_owned(),
                user_path: Vec::new(),
            },
            parameters: LookupParameters::default(),
        })
    }
}
