//! Receiver-side streaming to disk.
//!
//! Inbound bytes are appended to `{scratch_dir}/{name}.part` and only moved to
//! the user-chosen destination once every byte has arrived. The destination
//! path never holds a partial file: relocation is a rename, or a copy into a
//! hidden staging file next to the destination followed by a rename.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::protocol::AcceptAction;
use crate::utils::sanitize_filename;
use crate::{DccError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    pub temporary_path: PathBuf,
    pub final_path: PathBuf,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocateOutcome {
    Ready(SaveTarget),
    /// The user declined to pick a destination.
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    None,
    Open,
}

impl From<AcceptAction> for PostAction {
    fn from(action: AcceptAction) -> Self {
        match action {
            AcceptAction::Open => PostAction::Open,
            AcceptAction::Save | AcceptAction::Play => PostAction::None,
        }
    }
}

/// Picks where an accepted file should finally live.
#[async_trait]
pub trait SaveLocationChooser: Send + Sync {
    async fn choose(&self, suggested_name: &str) -> Option<PathBuf>;
}

/// Opens a finished file with the platform's default handler.
#[async_trait]
pub trait PlatformOpener: Send + Sync {
    async fn open(&self, path: &Path) -> Result<()>;
}

/// File capability used by the manager. Backends that cannot append report
/// it through [`supports_append`](Self::supports_append) and the manager
/// falls back to read-modify-write.
#[async_trait]
pub trait FileBackend: Send + Sync {
    fn supports_append(&self) -> bool {
        true
    }

    async fn append(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    async fn read_whole(&self, path: &Path) -> io::Result<Vec<u8>>;
    async fn write_whole(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;
    async fn remove(&self, path: &Path) -> io::Result<()>;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileBackend;

#[async_trait]
impl FileBackend for TokioFileBackend {
    async fn append(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }

    async fn read_whole(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write_whole(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::write(path, bytes).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        tokio::fs::copy(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}

/// Non-interactive chooser: configured directory, else the user's Downloads,
/// else Documents, else the working directory. Existing files are never
/// overwritten; `name (1).ext`, `name (2).ext`, ... are tried instead.
#[derive(Debug, Clone, Default)]
pub struct DownloadDirChooser {
    dir: Option<PathBuf>,
}

impl DownloadDirChooser {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn save_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.dir {
            return dir.clone();
        }
        directories::UserDirs::new()
            .and_then(|dirs| {
                dirs.download_dir()
                    .or_else(|| dirs.document_dir())
                    .map(Path::to_path_buf)
            })
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[async_trait]
impl SaveLocationChooser for DownloadDirChooser {
    async fn choose(&self, suggested_name: &str) -> Option<PathBuf> {
        let filename = sanitize_filename(suggested_name);
        let save_dir = self.save_dir();
        let mut save_path = save_dir.join(&filename);

        let stem = Path::new(&filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file")
            .to_string();
        let extension = Path::new(&filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| format!(".{}", s))
            .unwrap_or_default();

        let mut counter = 1;
        while tokio::fs::try_exists(&save_path).await.unwrap_or(false) {
            save_path = save_dir.join(format!("{} ({}){}", stem, counter, extension));
            counter += 1;
        }

        debug!("Chose save path {:?} for '{}'", save_path, suggested_name);
        Some(save_path)
    }
}

/// Launches `xdg-open` / `open` / `start` without waiting for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

#[async_trait]
impl PlatformOpener for SystemOpener {
    async fn open(&self, path: &Path) -> Result<()> {
        #[cfg(target_os = "windows")]
        let mut command = {
            let mut command = tokio::process::Command::new("cmd");
            command.args(["/C", "start", ""]).arg(path);
            command
        };

        #[cfg(target_os = "macos")]
        let mut command = {
            let mut command = tokio::process::Command::new("open");
            command.arg(path);
            command
        };

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let mut command = {
            let mut command = tokio::process::Command::new("xdg-open");
            command.arg(path);
            command
        };

        command
            .spawn()
            .map_err(|e| DccError::FileOperation(format!("Failed to launch opener: {}", e)))?;
        Ok(())
    }
}

/// Opener that does nothing; used when auto-open is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOpener;

#[async_trait]
impl PlatformOpener for NoopOpener {
    async fn open(&self, path: &Path) -> Result<()> {
        debug!("Auto-open disabled, leaving {:?} closed", path);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SaveTargetManager {
    scratch_dir: PathBuf,
    backend: Arc<dyn FileBackend>,
    chooser: Arc<dyn SaveLocationChooser>,
    opener: Arc<dyn PlatformOpener>,
}

impl SaveTargetManager {
    pub fn new(
        scratch_dir: PathBuf,
        backend: Arc<dyn FileBackend>,
        chooser: Arc<dyn SaveLocationChooser>,
        opener: Arc<dyn PlatformOpener>,
    ) -> Self {
        Self {
            scratch_dir,
            backend,
            chooser,
            opener,
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn temporary_path_for(&self, suggested_name: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("{}.part", sanitize_filename(suggested_name)))
    }

    pub async fn allocate(&self, suggested_name: &str) -> Result<AllocateOutcome> {
        let Some(final_path) = self.chooser.choose(suggested_name).await else {
            info!("Save location for '{}' declined", suggested_name);
            return Ok(AllocateOutcome::Canceled);
        };

        self.backend
            .create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| {
                DccError::SaveTargetUnavailable(format!(
                    "cannot create scratch dir {:?}: {}",
                    self.scratch_dir, e
                ))
            })?;

        let temporary_path = self.temporary_path_for(suggested_name);
        match self.backend.remove(&temporary_path).await {
            Ok(()) => debug!("Removed stale partial file {:?}", temporary_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove stale {:?}: {}", temporary_path, e),
        }

        info!(
            "Save target for '{}': {:?} -> {:?}",
            suggested_name, temporary_path, final_path
        );
        Ok(AllocateOutcome::Ready(SaveTarget {
            temporary_path,
            final_path,
            bytes_written: 0,
        }))
    }

    pub async fn append(&self, target: &mut SaveTarget, bytes: &[u8]) -> Result<()> {
        let path = &target.temporary_path;
        let written = if self.backend.supports_append() {
            self.backend.append(path, bytes).await
        } else {
            self.read_modify_write(path, bytes).await
        };

        written.map_err(|e| {
            DccError::SaveTargetUnavailable(format!("write to {:?} failed: {}", path, e))
        })?;
        target.bytes_written += bytes.len() as u64;
        Ok(())
    }

    async fn read_modify_write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut contents = match self.backend.read_whole(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        contents.extend_from_slice(bytes);
        self.backend.write_whole(path, &contents).await
    }

    /// Moves the temporary file to its final path. On failure the temporary
    /// file is left in place so the caller can retry or recover it.
    pub async fn finalize(&self, target: &SaveTarget, post_action: PostAction) -> Result<PathBuf> {
        let temp = &target.temporary_path;
        let final_path = &target.final_path;

        if target.bytes_written == 0 {
            return Err(DccError::ZeroByteResult(final_path.display().to_string()));
        }

        if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.backend
                .create_dir_all(parent)
                .await
                .map_err(|e| self.finalize_failure(temp, format!("cannot create {:?}: {}", parent, e)))?;
        }

        match self.backend.rename(temp, final_path).await {
            Ok(()) => {}
            Err(e) => {
                debug!("Rename {:?} -> {:?} failed ({}), copying instead", temp, final_path, e);
                self.copy_into_place(temp, final_path).await?;
            }
        }

        info!(
            "Finalized {} bytes into {:?}",
            target.bytes_written, final_path
        );

        if post_action == PostAction::Open {
            if let Err(e) = self.opener.open(final_path).await {
                warn!("Failed to open {:?}: {}", final_path, e);
            }
        }

        Ok(final_path.clone())
    }

    async fn copy_into_place(&self, temp: &Path, final_path: &Path) -> Result<()> {
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        let staging = final_path.with_file_name(format!(".{}.{}.staging", file_name, Uuid::new_v4()));

        if let Err(e) = self.backend.copy(temp, &staging).await {
            let _ = self.backend.remove(&staging).await;
            return Err(self.finalize_failure(temp, format!("copy failed: {}", e)));
        }

        if let Err(e) = self.backend.rename(&staging, final_path).await {
            let _ = self.backend.remove(&staging).await;
            return Err(self.finalize_failure(temp, format!("rename of staging file failed: {}", e)));
        }

        if let Err(e) = self.backend.remove(temp).await {
            warn!("Finalized, but could not remove {:?}: {}", temp, e);
        }
        Ok(())
    }

    fn finalize_failure(&self, temp: &Path, reason: String) -> DccError {
        DccError::FinalizeFailure {
            temp_path: temp.to_path_buf(),
            reason,
        }
    }

    /// Best-effort removal of an abandoned temporary file.
    pub async fn discard(&self, target: &SaveTarget) {
        match self.backend.remove(&target.temporary_path).await {
            Ok(()) => info!("Removed partial file {:?}", target.temporary_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {:?}: {}", target.temporary_path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FixedChooser(Option<PathBuf>);

    #[async_trait]
    impl SaveLocationChooser for FixedChooser {
        async fn choose(&self, _suggested_name: &str) -> Option<PathBuf> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct CountingOpener {
        opened: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PlatformOpener for CountingOpener {
        async fn open(&self, _path: &Path) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DccError::FileOperation("no handler".to_string()));
            }
            Ok(())
        }
    }

    /// Backend that can only write whole files.
    struct WholeFileOnly;

    #[async_trait]
    impl FileBackend for WholeFileOnly {
        fn supports_append(&self) -> bool {
            false
        }
        async fn append(&self, _path: &Path, _bytes: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "append"))
        }
        async fn read_whole(&self, path: &Path) -> io::Result<Vec<u8>> {
            TokioFileBackend.read_whole(path).await
        }
        async fn write_whole(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            TokioFileBackend.write_whole(path, bytes).await
        }
        async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            TokioFileBackend.rename(from, to).await
        }
        async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
            TokioFileBackend.copy(from, to).await
        }
        async fn remove(&self, path: &Path) -> io::Result<()> {
            TokioFileBackend.remove(path).await
        }
        async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            TokioFileBackend.create_dir_all(path).await
        }
    }

    /// Rejects renames of `.part` files, like a move across mounts.
    struct CrossDevice {
        copy_fails: bool,
    }

    #[async_trait]
    impl FileBackend for CrossDevice {
        async fn append(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            TokioFileBackend.append(path, bytes).await
        }
        async fn read_whole(&self, path: &Path) -> io::Result<Vec<u8>> {
            TokioFileBackend.read_whole(path).await
        }
        async fn write_whole(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            TokioFileBackend.write_whole(path, bytes).await
        }
        async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if from.extension().is_some_and(|ext| ext == "part") {
                return Err(io::Error::new(io::ErrorKind::Other, "cross-device link"));
            }
            TokioFileBackend.rename(from, to).await
        }
        async fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
            if self.copy_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            TokioFileBackend.copy(from, to).await
        }
        async fn remove(&self, path: &Path) -> io::Result<()> {
            TokioFileBackend.remove(path).await
        }
        async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            TokioFileBackend.create_dir_all(path).await
        }
    }

    fn manager(
        scratch: &Path,
        final_path: Option<PathBuf>,
        backend: Arc<dyn FileBackend>,
        opener: Arc<dyn PlatformOpener>,
    ) -> SaveTargetManager {
        SaveTargetManager::new(
            scratch.to_path_buf(),
            backend,
            Arc::new(FixedChooser(final_path)),
            opener,
        )
    }

    async fn ready(manager: &SaveTargetManager, name: &str) -> SaveTarget {
        match manager.allocate(name).await.unwrap() {
            AllocateOutcome::Ready(target) => target,
            AllocateOutcome::Canceled => panic!("allocation was declined"),
        }
    }

    #[tokio::test]
    async fn test_allocate_removes_stale_part_file() {
        let dir = tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("video.mp4.part"), b"stale").unwrap();

        let m = manager(
            &scratch,
            Some(dir.path().join("out").join("video.mp4")),
            Arc::new(TokioFileBackend),
            Arc::new(NoopOpener),
        );
        let target = ready(&m, "video.mp4").await;

        assert_eq!(target.temporary_path, scratch.join("video.mp4.part"));
        assert_eq!(target.bytes_written, 0);
        assert!(!target.temporary_path.exists());
    }

    #[tokio::test]
    async fn test_allocate_declined() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), None, Arc::new(TokioFileBackend), Arc::new(NoopOpener));
        assert_eq!(m.allocate("x.bin").await.unwrap(), AllocateOutcome::Canceled);
    }

    #[tokio::test]
    async fn test_append_then_finalize_and_open() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("out").join("music.mp3");
        let opener = Arc::new(CountingOpener::default());
        let m = manager(dir.path(), Some(final_path.clone()), Arc::new(TokioFileBackend), opener.clone());

        let mut target = ready(&m, "music.mp3").await;
        m.append(&mut target, b"hello ").await.unwrap();
        m.append(&mut target, b"world").await.unwrap();
        assert_eq!(target.bytes_written, 11);
        assert!(!final_path.exists());

        let path = m.finalize(&target, PostAction::Open).await.unwrap();
        assert_eq!(path, final_path);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"hello world");
        assert!(!target.temporary_path.exists());
        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_does_not_fail_finalize() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("a.txt");
        let opener = Arc::new(CountingOpener {
            opened: AtomicUsize::new(0),
            fail: true,
        });
        let m = manager(dir.path(), Some(final_path.clone()), Arc::new(TokioFileBackend), opener);

        let mut target = ready(&m, "a.txt").await;
        m.append(&mut target, b"x").await.unwrap();
        assert!(m.finalize(&target, PostAction::Open).await.is_ok());
        assert!(final_path.exists());
    }

    #[tokio::test]
    async fn test_whole_file_backend_falls_back_to_read_modify_write() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("clip.bin");
        let m = manager(dir.path(), Some(final_path.clone()), Arc::new(WholeFileOnly), Arc::new(NoopOpener));

        let mut target = ready(&m, "clip.bin").await;
        for part in [&b"ab"[..], b"cd", b"ef"] {
            m.append(&mut target, part).await.unwrap();
        }
        assert_eq!(target.bytes_written, 6);
        assert_eq!(std::fs::read(&target.temporary_path).unwrap(), b"abcdef");

        m.finalize(&target, PostAction::None).await.unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_finalize_copies_when_rename_fails() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("dest").join("report.pdf");
        let m = manager(
            dir.path(),
            Some(final_path.clone()),
            Arc::new(CrossDevice { copy_fails: false }),
            Arc::new(NoopOpener),
        );

        let mut target = ready(&m, "report.pdf").await;
        m.append(&mut target, b"%PDF-1.7").await.unwrap();
        m.finalize(&target, PostAction::None).await.unwrap();

        assert_eq!(std::fs::read(&final_path).unwrap(), b"%PDF-1.7");
        assert!(!target.temporary_path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(final_path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_finalize_keeps_temp_and_reports_it() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("dest").join("big.iso");
        let m = manager(
            dir.path(),
            Some(final_path.clone()),
            Arc::new(CrossDevice { copy_fails: true }),
            Arc::new(NoopOpener),
        );

        let mut target = ready(&m, "big.iso").await;
        m.append(&mut target, b"data").await.unwrap();

        match m.finalize(&target, PostAction::None).await {
            Err(DccError::FinalizeFailure { temp_path, .. }) => {
                assert_eq!(temp_path, target.temporary_path)
            }
            other => panic!("expected finalize failure, got {:?}", other),
        }
        assert!(target.temporary_path.exists());
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn test_zero_byte_finalize_is_an_error() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("empty.bin");
        let m = manager(dir.path(), Some(final_path.clone()), Arc::new(TokioFileBackend), Arc::new(NoopOpener));

        let target = ready(&m, "empty.bin").await;
        assert!(matches!(
            m.finalize(&target, PostAction::None).await,
            Err(DccError::ZeroByteResult(_))
        ));
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn test_download_dir_chooser_avoids_overwrite() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("clip.bin"), b"old").unwrap();
        std::fs::write(dir.path().join("clip (1).bin"), b"old").unwrap();

        let chooser = DownloadDirChooser::new(Some(dir.path().to_path_buf()));
        let chosen = chooser.choose("clip.bin").await.unwrap();
        assert_eq!(chosen, dir.path().join("clip (2).bin"));

        let chosen = chooser.choose("../escape.txt").await.unwrap();
        assert_eq!(chosen.parent().unwrap(), dir.path());
    }

    #[tokio::test]
    async fn test_discard_removes_partial() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), Some(dir.path().join("f")), Arc::new(TokioFileBackend), Arc::new(NoopOpener));
        let mut target = ready(&m, "f").await;
        m.append(&mut target, b"partial").await.unwrap();

        m.discard(&target).await;
        assert!(!target.temporary_path.exists());
        m.discard(&target).await;
    }
}
