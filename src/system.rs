#[cfg(windows)]
extern crate winapi;
use crate::common::LookupError;
use fs_err as fs;
use std::collections::HashMap;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Description of a Windows system
///
/// If running from within Windows we query the directories through the Windows API.
/// If running in another OS we can only guess them from a mounted Windows partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsSystem {
    /// Windows directory (typically C:\Windows)
    pub win_dir: PathBuf,
    /// System directory (typically C:\Windows\System32)
    pub sys_dir: PathBuf,
    /// 32-bit system directory on 64-bit systems (typically C:\Windows\SysWOW64)
    pub wow64_dir: Option<PathBuf>,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        Ok(Self {
            win_dir: get_windows_directory()?,
            sys_dir: get_system_directory()?,
            // fails on 32-bit Windows, where there is no such directory
            wow64_dir: get_system_wow64_directory().ok(),
        })
    }

    /// Collect information about the Windows operating system installed on the partition the target
    /// executable lies into
    #[cfg(not(windows))]
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Option<Self> {
        p.as_ref()
            .parent()?
            .ancestors()
            .find_map(|a| Self::from_root(a))
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let fs_cache = &mut WinFileSystemCache::new();
        let win_dir = fs_cache
            .test_file_in_folder_case_insensitive("Windows", root_path.as_ref())
            .ok()
            .flatten()?;
        let sys_dir = fs_cache
            .test_file_in_folder_case_insensitive("System32", &win_dir)
            .ok()
            .flatten()?;
        let wow64_dir = fs_cache
            .test_file_in_folder_case_insensitive("SysWOW64", &win_dir)
            .ok()
            .flatten();
        Some(Self {
            win_dir,
            sys_dir,
            wow64_dir,
        })
    }

    /// Directories whose content is provided by the operating system
    pub fn system_dirs(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.sys_dir.as_path()).chain(self.wow64_dir.as_deref())
    }

    /// Whether the given file lies within the system or WOW64 directory (ignoring case)
    pub fn contains<P: AsRef<Path>>(&self, p: P) -> bool {
        let file = normalized(p.as_ref());
        self.system_dirs().any(|d| {
            let dir = normalized(d);
            let dir = dir.trim_end_matches(['/', '\\']);
            !dir.is_empty()
                && file.len() > dir.len()
                && file.starts_with(dir)
                && file[dir.len()..].starts_with(['/', '\\'])
        })
    }
}

fn normalized(p: &Path) -> String {
    crate::common::decanonicalize(&p.to_string_lossy()).to_lowercase()
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 || ret as usize > BFR_SIZE {
        Err(Error::last_os_error())
    } else {
        Ok(PathBuf::from(OsString::from_wide(&bfr[..ret as usize])))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the WOW64 System directory (typically C:\Windows\SysWOW64)
#[cfg(windows)]
fn get_system_wow64_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::wow64apiset::GetSystemWow64DirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self {
            files_in_dirs: HashMap::new(),
        }
    }

    /// Look for an entry of the folder whose name matches ignoring case
    ///
    /// A folder that can't be read behaves as an empty one
    pub(crate) fn test_file_in_folder_case_insensitive<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        filename: P,
        folder: Q,
    ) -> Result<Option<PathBuf>, LookupError> {
        let folder = folder.as_ref();
        let key = filename.as_ref().to_string_lossy().to_lowercase();
        let entries = self.scan_folder(folder);
        Ok(entries.get(&key).map(|name| folder.join(name)))
    }

    fn scan_folder(&mut self, folder: &Path) -> &HashMap<String, PathBuf> {
        self.files_in_dirs
            .entry(folder.to_owned())
            .or_insert_with(|| match fs::read_dir(folder) {
                Ok(rd) => rd
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_str()
                            .map(|s| (s.to_lowercase(), PathBuf::from(entry.file_name())))
                    })
                    .collect(),
                Err(e) => {
                    tracing::trace!("{}", e);
                    HashMap::new()
                }
            })
    }
}
