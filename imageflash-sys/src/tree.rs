// SPDX-License-Identifier: GPL-3.0-only

//! Recursive copy of a mounted image onto a freshly formatted volume

use std::fs;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::copy::{CopyObserver, copy_bytes};
use crate::error::{Result, SysError};

/// Files above this share of the total size are copied chunk by chunk with
/// progress; smaller files are copied in one call.
pub const WHOLE_FILE_THRESHOLD: f64 = 0.01;

/// Maps the 0..100 progress of one large file into its slice of the tree copy.
struct WeightedProgress<'a> {
    inner: &'a mut dyn CopyObserver,
    base: f64,
    weight: f64,
}

impl CopyObserver for WeightedProgress<'_> {
    fn status(&mut self, _text: &str) {}

    fn progress(&mut self, percentage: f64) {
        self.inner
            .progress((self.base + percentage * self.weight).min(100.0));
    }
}

struct TreeCopy<'a> {
    total_size: u64,
    copied: u64,
    cancel: &'a CancellationToken,
    observer: &'a mut dyn CopyObserver,
}

/// Copy the contents of `source` into `target`
///
/// `total_size` is the size the progress percentage is computed against,
/// usually the size of the image file the tree was mounted from.
pub fn copy_tree(
    source: &Path,
    target: &Path,
    total_size: u64,
    cancel: &CancellationToken,
    observer: &mut dyn CopyObserver,
) -> Result<()> {
    let mut copy = TreeCopy {
        total_size,
        copied: 0,
        cancel,
        observer,
    };
    copy.copy_dir(source, target)?;
    debug!(
        "Copied {} bytes from {} to {}",
        copy.copied,
        source.display(),
        target.display()
    );
    Ok(())
}

impl TreeCopy<'_> {
    fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.copied as f64 / self.total_size as f64 * 100.0).min(100.0)
    }

    fn copy_dir(&mut self, source: &Path, target: &Path) -> Result<()> {
        let mut entries = fs::read_dir(source)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            if self.cancel.is_cancelled() {
                return Err(SysError::Cancelled);
            }

            let source_path = entry.path();
            let target_path = target.join(entry.file_name());
            let mut metadata = fs::symlink_metadata(&source_path)?;

            // ExFAT has no symlinks: links to files are copied as files,
            // everything else (directory loops included) is left out.
            if metadata.file_type().is_symlink() {
                match fs::metadata(&source_path) {
                    Ok(resolved) if resolved.is_file() => metadata = resolved,
                    _ => {
                        debug!("Skipping link {}", source_path.display());
                        continue;
                    }
                }
            }

            if metadata.is_dir() {
                fs::create_dir_all(&target_path)?;
                self.copy_dir(&source_path, &target_path)?;
                continue;
            }

            self.copy_file(&source_path, &target_path, metadata.len())?;
        }

        Ok(())
    }

    fn copy_file(&mut self, source: &Path, target: &Path, size: u64) -> Result<()> {
        let base = self.percent();
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.observer.status(&format!("Copying {name}..."));
        self.observer.progress(base);

        let share = if self.total_size == 0 {
            0.0
        } else {
            size as f64 / self.total_size as f64
        };

        if share > WHOLE_FILE_THRESHOLD {
            fs::File::create(target)?;
            let mut weighted = WeightedProgress {
                inner: &mut *self.observer,
                base,
                weight: share,
            };
            copy_bytes(source, target, self.cancel, &mut weighted)?;
        } else {
            fs::copy(source, target)?;
        }

        self.copied += size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        statuses: Vec<String>,
        progress: Vec<f64>,
    }

    impl CopyObserver for Recorder {
        fn status(&mut self, text: &str) {
            self.statuses.push(text.to_string());
        }

        fn progress(&mut self, percentage: f64) {
            self.progress.push(percentage);
        }
    }

    fn build_tree(root: &Path) -> u64 {
        fs::create_dir_all(root.join("sources")).expect("mkdir sources");
        fs::create_dir_all(root.join("efi/boot")).expect("mkdir efi");
        fs::write(root.join("setup.exe"), vec![1u8; 100]).expect("small file");
        fs::write(root.join("efi/boot/bootx64.efi"), vec![2u8; 200]).expect("nested file");
        fs::write(root.join("sources/install.wim"), vec![3u8; 50_000]).expect("large file");
        50_300
    }

    #[test]
    fn copies_nested_tree() {
        let source = tempfile::tempdir().expect("source dir");
        let target = tempfile::tempdir().expect("target dir");
        let total = build_tree(source.path());

        let mut recorder = Recorder::default();
        copy_tree(
            source.path(),
            target.path(),
            total,
            &CancellationToken::new(),
            &mut recorder,
        )
        .expect("tree copy succeeds");

        assert_eq!(
            fs::read(target.path().join("sources/install.wim")).expect("large copied"),
            vec![3u8; 50_000]
        );
        assert_eq!(
            fs::read(target.path().join("efi/boot/bootx64.efi")).expect("nested copied"),
            vec![2u8; 200]
        );
        assert!(target.path().join("setup.exe").is_file());
        assert!(recorder.statuses.contains(&"Copying install.wim...".to_string()));
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let source = tempfile::tempdir().expect("source dir");
        let target = tempfile::tempdir().expect("target dir");
        let total = build_tree(source.path());

        let mut recorder = Recorder::default();
        copy_tree(
            source.path(),
            target.path(),
            total,
            &CancellationToken::new(),
            &mut recorder,
        )
        .expect("tree copy succeeds");

        assert!(recorder.progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(recorder.progress.iter().all(|p| *p <= 100.0));
    }

    #[test]
    fn large_file_status_does_not_leak_disk_messages() {
        let source = tempfile::tempdir().expect("source dir");
        let target = tempfile::tempdir().expect("target dir");
        let total = build_tree(source.path());

        let mut recorder = Recorder::default();
        copy_tree(
            source.path(),
            target.path(),
            total,
            &CancellationToken::new(),
            &mut recorder,
        )
        .expect("tree copy succeeds");

        assert!(recorder.statuses.iter().all(|s| s.starts_with("Copying ")));
    }

    #[test]
    fn cancelled_copy_stops_before_next_entry() {
        let source = tempfile::tempdir().expect("source dir");
        let target = tempfile::tempdir().expect("target dir");
        let total = build_tree(source.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = copy_tree(source.path(), target.path(), total, &cancel, &mut ());

        assert!(matches!(result, Err(SysError::Cancelled)));
        assert_eq!(fs::read_dir(target.path()).expect("list target").count(), 0);
    }

    #[test]
    fn links_are_not_followed_into_directories() {
        let source = tempfile::tempdir().expect("source dir");
        let target = tempfile::tempdir().expect("target dir");
        fs::write(source.path().join("README.txt"), vec![4u8; 40]).expect("readme");
        std::os::unix::fs::symlink(".", source.path().join("debian")).expect("dir link");
        std::os::unix::fs::symlink("README.txt", source.path().join("README")).expect("file link");
        std::os::unix::fs::symlink("gone.txt", source.path().join("dangling")).expect("dead link");

        copy_tree(
            source.path(),
            target.path(),
            80,
            &CancellationToken::new(),
            &mut (),
        )
        .expect("tree copy succeeds");

        assert!(!target.path().join("debian").exists());
        assert!(!target.path().join("dangling").exists());
        let copied = fs::symlink_metadata(target.path().join("README")).expect("file link copied");
        assert!(copied.is_file());
        assert_eq!(
            fs::read(target.path().join("README")).expect("read copy"),
            vec![4u8; 40]
        );
    }

    #[test]
    fn missing_source_is_an_io_error() {
        let target = tempfile::tempdir().expect("target dir");
        let result = copy_tree(
            &target.path().join("not-mounted"),
            target.path(),
            1,
            &CancellationToken::new(),
            &mut (),
        );
        assert!(matches!(result, Err(SysError::Io(_))));
    }
}
