use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use walkdir::WalkDir;

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const MEDIA_PLAYLIST: &str = "playlist.m3u8";
/// Holds the pid of the process encoding into the bundle
pub const OWNER_MARKER: &str = ".owner";

/// Paths inside one job's HLS bundle.
///
/// ```text
/// {root}/video/playlist.m3u8, {root}/video/segment{N}.ts
/// {root}/audio_{i}/playlist.m3u8, {root}/audio_{i}/segment{N}.ts
/// {root}/subtitles/sub_{i}.vtt, {root}/subtitles/sub_{i}.m3u8
/// {root}/master.m3u8
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BundleLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn video_dir(&self) -> PathBuf {
        self.root.join("video")
    }

    pub fn video_playlist(&self) -> PathBuf {
        self.video_dir().join(MEDIA_PLAYLIST)
    }

    pub fn audio_dir(&self, output_index: usize) -> PathBuf {
        self.root.join(format!("audio_{}", output_index))
    }

    pub fn audio_playlist(&self, output_index: usize) -> PathBuf {
        self.audio_dir(output_index).join(MEDIA_PLAYLIST)
    }

    pub fn subtitles_dir(&self) -> PathBuf {
        self.root.join("subtitles")
    }

    pub fn subtitle_file(&self, output_index: usize) -> PathBuf {
        self.subtitles_dir().join(format!("sub_{}.vtt", output_index))
    }

    /// Single-segment media playlist wrapping `subtitle_file`
    pub fn subtitle_playlist(&self, output_index: usize) -> PathBuf {
        self.subtitles_dir().join(format!("sub_{}.m3u8", output_index))
    }

    pub fn owner_marker(&self) -> PathBuf {
        self.root.join(OWNER_MARKER)
    }

    pub fn master_playlist(&self) -> PathBuf {
        self.root.join(MASTER_PLAYLIST)
    }

    /// ffmpeg segment filename template for a media directory
    pub fn segment_pattern(dir: &Path) -> PathBuf {
        dir.join("segment%d.ts")
    }

    /// Relative URI of `path` as referenced from the master playlist
    pub fn uri(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// A bundle with a master playlist is complete and immutable
    pub fn is_complete(&self) -> bool {
        self.master_playlist().is_file()
    }

    /// Record this process as the bundle's owner so sweeps leave it alone
    pub fn claim(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.owner_marker(), std::process::id().to_string())
    }

    /// Drop the owner marker. Missing marker is not an error.
    pub fn release(&self) -> io::Result<()> {
        match fs::remove_file(self.owner_marker()) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Pid of the owner if that process is still running
    pub fn live_owner(&self) -> Option<u32> {
        let pid = fs::read_to_string(self.owner_marker()).ok()?.trim().parse::<u32>().ok()?;
        process_alive(pid).then_some(pid)
    }

    /// Create the directories every unit writes into
    pub fn prepare(&self, audio_outputs: &[usize], with_subtitles: bool) -> io::Result<()> {
        fs::create_dir_all(self.video_dir())?;
        for i in audio_outputs {
            fs::create_dir_all(self.audio_dir(*i))?;
        }
        if with_subtitles {
            fs::create_dir_all(self.subtitles_dir())?;
        }
        Ok(())
    }

    /// Delete the whole bundle. Missing root is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Total size of all files in the bundle
    pub fn size_bytes(&self) -> u64 {
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists under another user
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness check; treat every claimed bundle as in use
    true
}

/// Remove bundle directories under `output_root` that never got a master playlist.
///
/// Bundles whose owner process is still alive are in progress and kept.
/// Returns the number of bundles removed.
pub fn sweep_incomplete_bundles(output_root: &Path) -> io::Result<usize> {
    if !output_root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(output_root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to read entry in {}: {}", output_root.display(), e);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        let layout = BundleLayout::new(entry.path());
        if layout.is_complete() {
            debug!("Bundle complete, keeping: {}", layout.root().display());
            continue;
        }
        if let Some(pid) = layout.live_owner() {
            debug!("Bundle in use by pid {}, keeping: {}", pid, layout.root().display());
            continue;
        }

        match layout.remove() {
            Ok(()) => {
                info!("🗑️  Removed incomplete bundle: {}", layout.root().display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove incomplete bundle {}: {}", layout.root().display(), e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = BundleLayout::new("/srv/hls/abc");
        assert_eq!(layout.video_playlist(), PathBuf::from("/srv/hls/abc/video/playlist.m3u8"));
        assert_eq!(layout.audio_playlist(2), PathBuf::from("/srv/hls/abc/audio_2/playlist.m3u8"));
        assert_eq!(layout.subtitle_file(0), PathBuf::from("/srv/hls/abc/subtitles/sub_0.vtt"));
        assert_eq!(layout.master_playlist(), PathBuf::from("/srv/hls/abc/master.m3u8"));
        assert_eq!(
            BundleLayout::segment_pattern(&layout.video_dir()),
            PathBuf::from("/srv/hls/abc/video/segment%d.ts")
        );
        assert_eq!(layout.uri(&layout.audio_playlist(1)), "audio_1/playlist.m3u8");
        assert_eq!(layout.uri(&layout.subtitle_file(3)), "subtitles/sub_3.vtt");
        assert_eq!(layout.uri(&layout.subtitle_playlist(3)), "subtitles/sub_3.m3u8");
    }

    #[test]
    fn test_prepare_size_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BundleLayout::new(tmp.path().join("job"));
        layout.prepare(&[0, 1], true).unwrap();
        assert!(layout.audio_dir(1).is_dir());
        assert!(layout.subtitles_dir().is_dir());

        fs::write(layout.video_playlist(), "#EXTM3U\n").unwrap();
        fs::write(layout.video_dir().join("segment0.ts"), vec![0u8; 100]).unwrap();
        assert_eq!(layout.size_bytes(), 108);
        assert!(!layout.is_complete());

        layout.remove().unwrap();
        assert!(!layout.root().exists());
        // Removing twice is fine
        layout.remove().unwrap();
    }

    #[test]
    fn test_sweep_keeps_complete_bundles() {
        let tmp = tempfile::tempdir().unwrap();
        let done = BundleLayout::new(tmp.path().join("done"));
        let partial = BundleLayout::new(tmp.path().join("partial"));
        done.prepare(&[], false).unwrap();
        partial.prepare(&[0], false).unwrap();
        fs::write(done.master_playlist(), "#EXTM3U\n").unwrap();
        fs::write(tmp.path().join("stray.txt"), "x").unwrap();

        assert_eq!(sweep_incomplete_bundles(tmp.path()).unwrap(), 1);
        assert!(done.is_complete());
        assert!(!partial.root().exists());
        assert!(tmp.path().join("stray.txt").exists());
        assert_eq!(sweep_incomplete_bundles(&tmp.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_sweep_keeps_claimed_bundles() {
        let tmp = tempfile::tempdir().unwrap();
        let live = BundleLayout::new(tmp.path().join("live"));
        live.claim().unwrap();
        live.prepare(&[0], false).unwrap();
        assert_eq!(live.live_owner(), Some(std::process::id()));

        assert_eq!(sweep_incomplete_bundles(tmp.path()).unwrap(), 0);
        assert!(live.audio_dir(0).is_dir());

        live.release().unwrap();
        live.release().unwrap();
        assert_eq!(live.live_owner(), None);
        assert_eq!(sweep_incomplete_bundles(tmp.path()).unwrap(), 1);
        assert!(!live.root().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_sweep_removes_bundles_of_dead_owners() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = BundleLayout::new(tmp.path().join("stale"));
        let garbled = BundleLayout::new(tmp.path().join("garbled"));
        stale.prepare(&[], false).unwrap();
        garbled.prepare(&[], false).unwrap();
        // Above any pid_max the kernel allows
        fs::write(stale.owner_marker(), i32::MAX.to_string()).unwrap();
        fs::write(garbled.owner_marker(), "not a pid").unwrap();

        assert_eq!(sweep_incomplete_bundles(tmp.path()).unwrap(), 2);
        assert!(!stale.root().exists());
        assert!(!garbled.root().exists());
    }
}
