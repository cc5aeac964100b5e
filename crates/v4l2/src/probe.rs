use std::path::{Path, PathBuf};

use hdcap_core::prelude::{DisplayMode, FourCc, Resolution};

use crate::{
    device::{V4l2Device, VideoDevice, require_capture},
    error::DeviceError,
};

const SYSFS_CLASS: &str = "/sys/class/video4linux";

/// A capture-capable node found on this host.
#[derive(Debug, Clone)]
pub struct V4l2DeviceInfo {
    pub path: PathBuf,
    pub name: Option<String>,
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    pub formats: Vec<FourCc>,
    /// Mode of the signal currently present, when the node reports digital video timings.
    pub signal: Option<DisplayMode>,
}

/// `videoN` with a non-empty decimal suffix.
fn is_video_node(file_name: &str) -> bool {
    file_name
        .strip_prefix("video")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn video_nodes() -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir("/dev")
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_video_node))
        .map(|entry| entry.path())
        .collect();
    nodes.sort();
    nodes
}

/// Probe `/dev/video*` and return (devices, errors) for observability.
pub fn probe_devices() -> (Vec<V4l2DeviceInfo>, Vec<String>) {
    let mut devices = Vec::new();
    let mut errors = Vec::new();
    for path in video_nodes() {
        match build_info(&path) {
            Ok(info) => devices.push(info),
            Err(e) => errors.push(format!("{}: {e}", path.display())),
        }
    }
    (devices, errors)
}

fn build_info(path: &Path) -> Result<V4l2DeviceInfo, DeviceError> {
    let dev = V4l2Device::open(path)?;
    let caps = dev.capabilities()?;
    require_capture(&caps)?;

    // Quirky drivers may refuse to enumerate; keep the node anyway.
    let formats = dev
        .formats()
        .map(|list| list.into_iter().map(|d| d.fourcc).collect())
        .unwrap_or_default();
    let signal = dev.query_dv_timings().ok().and_then(|t| {
        Resolution::new(t.width, t.height).map(|res| DisplayMode::new(res, t.frame_rate()))
    });

    // The sysfs name tells sibling nodes of one bridge apart; `card` is shared.
    let name = path
        .file_name()
        .map(|node| Path::new(SYSFS_CLASS).join(node).join("name"))
        .and_then(|file| std::fs::read_to_string(file).ok())
        .map(|raw| raw.trim().to_owned())
        .filter(|name| !name.is_empty());

    Ok(V4l2DeviceInfo {
        path: path.to_path_buf(),
        name,
        card: caps.card,
        driver: caps.driver,
        bus_info: caps.bus_info,
        formats,
        signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_numbered_video_nodes_are_enumerated() {
        assert!(is_video_node("video0"));
        assert!(is_video_node("video12"));
        assert!(!is_video_node("video"));
        assert!(!is_video_node("video-loopback"));
        assert!(!is_video_node("media0"));
    }
}
