//! Analysis of several executables at once, on a bounded pool of worker threads

use crate::common::LookupError;
use crate::lookup_path::LookupPath;
use crate::models::{CombinedReport, FileAnalysisResult};
use crate::pe;
use crate::query::{LookupParameters, LookupQuery};
use crate::runner::DependencyResolver;
use crate::system::WindowsSystem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Upper bound on the number of files analyzed concurrently
pub const MAX_WORKERS: usize = 10;

/// Settings shared by all the files of a batch
#[derive(Clone, Debug, Default)]
pub struct BatchSettings {
    pub parameters: LookupParameters,
    /// Windows system used for every file; if None, it is deduced from the location of each file
    pub system: Option<WindowsSystem>,
    /// Directories searched after the PATH
    pub user_path: Vec<PathBuf>,
    /// Search PATH; if None, taken from the environment of this process
    pub env_path: Option<Vec<PathBuf>>,
}

impl BatchSettings {
    /// The configured search PATH, or the one of this process
    fn search_env_path(&self) -> Vec<PathBuf> {
        match &self.env_path {
            Some(p) => p.clone(),
            None => std::env::var_os("PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default(),
        }
    }
}

/// Trees of the files that could be analyzed, and one message for each file that could not
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub report: CombinedReport,
    pub errors: Vec<String>,
}

/// Build the dependency tree of a single executable
pub fn analyze_file<P: AsRef<Path>>(
    path: P,
    settings: &BatchSettings,
) -> Result<FileAnalysisResult, LookupError> {
    analyze_file_with_path(path.as_ref(), settings, settings.search_env_path())
}

fn analyze_file_with_path(
    path: &Path,
    settings: &BatchSettings,
    env_path: Vec<PathBuf>,
) -> Result<FileAnalysisResult, LookupError> {
    let mut query = match &settings.system {
        Some(system) => LookupQuery::with_system(path, Some(system.clone()))?,
        None => LookupQuery::deduce_from_executable_location(path)?,
    };
    query.target.user_path = settings.user_path.clone();
    query.parameters = settings.parameters.clone();

    let info = pe::parse(path)?;
    let lookup_path = LookupPath::with_env_path(&query, env_path);
    let resolver = DependencyResolver::new(&lookup_path, &query.parameters);
    let tree = resolver.build_dependency_tree(&info);
    debug!("{}: {} nodes", path.display(), tree.node_count());

    Ok(FileAnalysisResult {
        file_path: path.to_owned(),
        tree,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Analyze every input independently; a failing input never stops the others
///
/// The trees in the report, as well as the error messages, follow the order of the inputs.
pub fn analyze_files(inputs: &[PathBuf], settings: &BatchSettings) -> BatchOutcome {
    if inputs.is_empty() {
        return BatchOutcome::default();
    }

    let env_path = settings.search_env_path();
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKERS)
        .min(inputs.len())
        .max(1);

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, &PathBuf)>();
    let (result_tx, result_rx) =
        crossbeam_channel::unbounded::<(usize, Result<FileAnalysisResult, String>)>();
    for job in inputs.iter().enumerate() {
        // the receiver is alive until the end of this function
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let scope_result = crossbeam::scope(|s| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let env_path = &env_path;
            s.spawn(move |_| {
                for (index, path) in job_rx.iter() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        analyze_file_with_path(path, settings, env_path.clone())
                    }));
                    let outcome = match outcome {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(format!("{}: {}", path.display(), e)),
                        Err(payload) => Err(format!(
                            "{}: unexpected failure: {}",
                            path.display(),
                            panic_message(payload.as_ref())
                        )),
                    };
                    if let Err(e) = &outcome {
                        warn!("{}", e);
                    }
                    let _ = result_tx.send((index, outcome));
                }
            });
        }
    });
    drop(result_tx);
    if scope_result.is_err() {
        warn!("a worker thread terminated abnormally");
    }

    let mut collected: Vec<_> = result_rx.iter().collect();
    collected.sort_by_key(|(index, _)| *index);

    let mut outcome = BatchOutcome::default();
    for (_, r) in collected {
        match r {
            Ok(result) => outcome.report.files.push(result),
            Err(e) => outcome.errors.push(e),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::{analyze_file, analyze_files, BatchSettings};
    use crate::common::LookupError;
    use crate::system::WindowsSystem;
    use crate::testing::PeBuilder;
    use fs_err as fs;
    use std::path::PathBuf;

    fn settings(dir: &std::path::Path) -> BatchSettings {
        BatchSettings {
            system: Some(WindowsSystem {
                win_dir: dir.join("Windows"),
                sys_dir: dir.join("Windows").join("System32"),
                wow64_dir: None,
            }),
            env_path: Some(Vec::new()),
            ..Default::default()
        }
    }

    #[test]
    fn failures_are_isolated() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let good = PeBuilder::new(true).import("HELPER.DLL").write(dir.path(), "good.exe")?;
        PeBuilder::new(false).write(dir.path(), "HELPER.DLL")?;
        let corrupt = dir.path().join("corrupt.exe");
        fs::write(&corrupt, vec![0u8; 512])?;
        let missing = dir.path().join("missing.exe");
        let other = PeBuilder::new(false).write(dir.path(), "other.exe")?;

        let inputs = vec![corrupt.clone(), good.clone(), missing.clone(), other.clone()];
        let outcome = analyze_files(&inputs, &settings(dir.path()));

        let analyzed: Vec<&PathBuf> = outcome.report.files.iter().map(|f| &f.file_path).collect();
        assert_eq!(analyzed, [&good, &other]);
        assert_eq!(outcome.report.files[0].tree.children.len(), 1);
        assert!(outcome.report.files[0].tree.children[0].is_found());

        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].contains("corrupt.exe"));
        assert!(outcome.errors[0].contains("missing MZ signature"));
        assert!(outcome.errors[1].contains("missing.exe"));
        Ok(())
    }

    #[test]
    fn results_follow_input_order() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let inputs = (0..25)
            .map(|i| PeBuilder::new(i % 2 == 0).write(dir.path(), &format!("app{i}.exe")))
            .collect::<Result<Vec<_>, _>>()?;

        let outcome = analyze_files(&inputs, &settings(dir.path()));
        assert!(outcome.errors.is_empty());
        let analyzed: Vec<PathBuf> = outcome
            .report
            .files
            .iter()
            .map(|f| f.file_path.clone())
            .collect();
        assert_eq!(analyzed, inputs);
        Ok(())
    }

    #[test]
    fn batch_matches_single_file_analysis() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let root = PeBuilder::new(true)
            .imports(&["A.dll", "nope.dll"])
            .write(dir.path(), "root.exe")?;
        PeBuilder::new(true).import("root.exe").write(dir.path(), "A.dll")?;

        let settings = settings(dir.path());
        let single = analyze_file(&root, &settings)?;
        let outcome = analyze_files(&[root], &settings);
        assert_eq!(outcome.report.files, vec![single]);
        Ok(())
    }

    #[test]
    fn configured_path_is_searched() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let app = dir.path().join("app");
        let libs = dir.path().join("libs");
        fs::create_dir_all(&app)?;
        fs::create_dir_all(&libs)?;
        let root = PeBuilder::new(true).import("shared.dll").write(&app, "root.exe")?;
        PeBuilder::new(true).write(&libs, "shared.dll")?;

        let mut settings = settings(dir.path());
        let unresolved = analyze_file(&root, &settings)?;
        assert!(!unresolved.tree.children[0].is_found());

        settings.env_path = Some(vec![libs.clone()]);
        let single = analyze_file(&root, &settings)?;
        assert!(single.tree.children[0].is_found());
        let outcome = analyze_files(&[root], &settings);
        assert_eq!(outcome.report.files, vec![single]);
        Ok(())
    }

    #[test]
    fn empty_batch() {
        let outcome = analyze_files(&[], &BatchSettings::default());
        assert!(outcome.report.files.is_empty());
        assert!(outcome.errors.is_empty());
    }
}
