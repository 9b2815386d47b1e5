//! Capture pipeline description and resolution negotiation.
//!
//! The capture script is generated from a [`PipelineConfig`]; nothing here
//! spawns processes, so negotiation and script layout are tested directly.

use crate::markers::{ERROR_MARKER, FRAME_PATTERN, PID_FILE, RESOLUTION_MARKER};
use crate::runner::shell_quote;
use std::fmt;
use std::path::{Path, PathBuf};

/// Camera sizes tried in order. The first one the device offers pins the caps.
pub const PREFERRED_SIZES: [(u32, u32); 9] = [
    (1280, 720),
    (1920, 1080),
    (960, 540),
    (848, 480),
    (854, 480),
    (640, 360),
    (640, 480),
    (320, 240),
    (160, 120),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse `WxH`, e.g. `1280x720`
    pub fn parse(text: &str) -> Option<Self> {
        let (w, h) = text.trim().split_once('x')?;
        let width = w.trim().parse().ok()?;
        let height = h.trim().parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    /// Aspect of at least 1.5 (16:9 and friends)
    pub fn is_wide(&self) -> bool {
        u64::from(self.width) * 100 / u64::from(self.height) >= 150
    }

    /// Preview size for a camera of this resolution at the given width
    ///
    /// Wide sources get a 16:9 box, everything else 4:3.
    pub fn fit_width(&self, width: u32) -> Resolution {
        preview_size(width, self.is_wide())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn preview_size(width: u32, wide: bool) -> Resolution {
    let height = if wide { width * 9 / 16 } else { width * 3 / 4 };
    Resolution::new(width, height)
}

/// One size offered by the device for one pixel format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSize {
    pub fourcc: String,
    pub size: Resolution,
}

/// GStreamer media type for a V4L2 fourcc
pub fn media_type(fourcc: &str) -> &'static str {
    match fourcc {
        "MJPG" | "JPEG" => "image/jpeg",
        _ => "video/x-raw",
    }
}

/// Discrete sizes from `v4l2-ctl --list-formats-ext`, in listing order
pub fn parse_format_sizes(listing: &str) -> Vec<FormatSize> {
    let mut fourcc = String::new();
    let mut sizes = Vec::new();

    for line in listing.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            // [0]: 'MJPG' (Motion-JPEG, compressed)
            if let Some(code) = line.split('\'').nth(1) {
                fourcc = code.to_string();
            }
        } else if let Some(rest) = line.strip_prefix("Size: Discrete") {
            if let Some(size) = Resolution::parse(rest) {
                sizes.push(FormatSize {
                    fourcc: fourcc.clone(),
                    size,
                });
            }
        }
    }
    sizes
}

/// Caps and sizes chosen for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Caps filter after the source; `None` lets GStreamer negotiate
    pub caps: Option<String>,
    /// Camera resolution, when known
    pub source: Option<Resolution>,
    /// Size of the preview frames
    pub output: Resolution,
}

impl Negotiated {
    /// No caps pinned; assume a wide camera
    pub fn automatic(preview_width: u32) -> Self {
        Self {
            caps: None,
            source: None,
            output: preview_size(preview_width, true),
        }
    }

    /// Camera size known but caps left open
    fn measured(source: Resolution, preview_width: u32) -> Self {
        Self {
            caps: None,
            source: Some(source),
            output: source.fit_width(preview_width),
        }
    }

    fn pinned(media: &str, source: Resolution, preview_width: u32) -> Self {
        Self {
            caps: Some(format!(
                "{},width={},height={}",
                media, source.width, source.height
            )),
            source: Some(source),
            output: source.fit_width(preview_width),
        }
    }
}

/// Match the device's sizes against [`PREFERRED_SIZES`]
pub fn negotiate_from_formats(formats: &[FormatSize], preview_width: u32) -> Option<Negotiated> {
    PREFERRED_SIZES.iter().find_map(|&(w, h)| {
        let wanted = Resolution::new(w, h);
        formats
            .iter()
            .find(|f| f.size == wanted)
            .map(|f| Negotiated::pinned(media_type(&f.fourcc), wanted, preview_width))
    })
}

/// First caps entry of `device` in `gst-device-monitor-1.0 Video/Source` output
pub fn negotiate_from_monitor(
    monitor: &str,
    device: &Path,
    preview_width: u32,
) -> Option<Negotiated> {
    let device = device.to_string_lossy();
    let block = monitor
        .split("Device found:")
        .find(|block| mentions_device(block, &device))?;

    block.lines().find_map(|line| {
        let entry = line.trim().trim_start_matches("caps").trim_start().trim_start_matches(':');
        let mut fields = entry.split(',').map(str::trim);
        let media = fields.next()?;
        if media != "video/x-raw" && media != "image/jpeg" {
            return None;
        }
        let mut width = None;
        let mut height = None;
        for field in fields {
            if let Some(v) = field.strip_prefix("width=") {
                width = caps_int(v);
            } else if let Some(v) = field.strip_prefix("height=") {
                height = caps_int(v);
            }
        }
        let source = Resolution::new(width?, height?);
        if source.width == 0 || source.height == 0 {
            return None;
        }
        Some(Negotiated::pinned(media, source, preview_width))
    })
}

/// Camera size from the first `caps = ` line of a verbose one-buffer `gst-launch-1.0` run
///
/// Only the aspect is taken from it; caps stay open.
pub fn negotiate_from_verbose_caps(output: &str, preview_width: u32) -> Option<Negotiated> {
    let line = output.lines().find(|line| line.contains("caps = "))?;
    let width = typed_int(line, "width=(int)")?;
    let height = typed_int(line, "height=(int)")?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(Negotiated::measured(
        Resolution::new(width, height),
        preview_width,
    ))
}

fn typed_int(line: &str, key: &str) -> Option<u32> {
    let start = line.find(key)? + key.len();
    let digits: String = line[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn mentions_device(block: &str, device: &str) -> bool {
    block.lines().any(|line| {
        let line = line.trim();
        line.ends_with(&format!("= {}", device)) || line.contains(&format!("device={} ", device))
    })
}

/// `1280`, `(int)1280`
fn caps_int(value: &str) -> Option<u32> {
    value.trim().trim_start_matches("(int)").parse().ok()
}

/// Everything needed to generate the capture script of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub device: PathBuf,
    pub work_dir: PathBuf,
    pub frames_dir: PathBuf,
    pub negotiated: Negotiated,
    pub ring_size: u32,
    pub jpeg_quality: u32,
    /// Flip horizontally so the preview behaves like a mirror
    pub mirror: bool,
}

impl PipelineConfig {
    /// Value written to the resolution marker
    pub fn resolution_marker(&self) -> Resolution {
        self.negotiated.source.unwrap_or(self.negotiated.output)
    }

    /// `gst-launch-1.0` element chain, one entry per element
    pub fn elements(&self) -> Vec<String> {
        let output = self.negotiated.output;
        let mut elements = vec![r#"v4l2src device="$DEVICE""#.to_string()];
        if let Some(caps) = &self.negotiated.caps {
            elements.push(caps.clone());
        }
        elements.push("decodebin".to_string());
        elements.push("videoconvert".to_string());
        elements.push("videoscale add-borders=false".to_string());
        elements.push(format!(
            "video/x-raw,width={},height={}",
            output.width, output.height
        ));
        elements.push("queue max-size-buffers=2 leaky=downstream".to_string());
        if self.mirror {
            elements.push("videoflip method=horizontal-flip".to_string());
        }
        elements.push(format!("jpegenc quality={}", self.jpeg_quality.min(100)));
        elements.push(format!(
            r#"multifilesink location="$FRAMES_DIR/{}" max-files={} post-messages=true"#,
            FRAME_PATTERN,
            self.ring_size.max(1)
        ));
        elements
    }

    /// Bash script that checks prerequisites, writes markers and runs the pipeline
    pub fn script(&self) -> String {
        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&format!(
            "WORK_DIR={}\n",
            shell_quote(&self.work_dir.to_string_lossy())
        ));
        s.push_str(&format!(
            "FRAMES_DIR={}\n",
            shell_quote(&self.frames_dir.to_string_lossy())
        ));
        s.push_str(&format!(
            "DEVICE={}\n",
            shell_quote(&self.device.to_string_lossy())
        ));
        s.push_str(&format!("echo $$ > \"$WORK_DIR/{}\"\n", PID_FILE));
        s.push_str("rm -f \"$FRAMES_DIR\"/frame_*.jpg\n");

        let fail = |marker: &str| {
            format!(
                "    echo {} > \"$WORK_DIR/{}\"\n    exit 1\n",
                marker, ERROR_MARKER
            )
        };
        s.push_str("if ! command -v gst-launch-1.0 >/dev/null 2>&1; then\n");
        s.push_str(&fail("GSTREAMER_MISSING"));
        s.push_str("fi\n");
        s.push_str("if [ ! -e \"$DEVICE\" ]; then\n");
        s.push_str(&fail("DEVICE_NOT_FOUND"));
        s.push_str("fi\n");
        s.push_str("if [ ! -r \"$DEVICE\" ]; then\n");
        s.push_str(&fail("PERMISSION_DENIED"));
        s.push_str("fi\n");

        s.push_str(&format!(
            "echo {} > \"$WORK_DIR/{}\"\n",
            self.resolution_marker(),
            RESOLUTION_MARKER
        ));
        s.push_str(&format!(
            "gst-launch-1.0 -q {} >/dev/null 2>&1 || {{ echo CAMERA_ERROR > \"$WORK_DIR/{}\"; exit 1; }}\n",
            self.elements().join(" ! "),
            ERROR_MARKER
        ));
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FORMATS_EXT: &str = "ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1280x720
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\tSize: Discrete 320x240
";

    const MONITOR: &str = "Probing devices...

Device found:

\tname  : Virtual Cam
\tclass : Video/Source
\tcaps  : video/x-raw, format=YUY2, width=640, height=480, framerate=30/1
\tproperties:
\t\tdevice.path = /dev/video4
\tgst-launch-1.0 v4l2src device=/dev/video4 ! ...

Device found:

\tname  : Integrated Camera
\tclass : Video/Source
\tcaps  : image/jpeg, width=(int)1280, height=(int)720, framerate=30/1
\t        video/x-raw, format=YUY2, width=640, height=480, framerate=30/1
\tproperties:
\t\tdevice.path = /dev/video0
\tgst-launch-1.0 v4l2src device=/dev/video0 ! ...
";

    fn config(negotiated: Negotiated) -> PipelineConfig {
        PipelineConfig {
            device: PathBuf::from("/dev/video0"),
            work_dir: PathBuf::from("/tmp/peekcam-frames-test"),
            frames_dir: PathBuf::from("/tmp/peekcam-frames-test/frames"),
            negotiated,
            ring_size: 5,
            jpeg_quality: 85,
            mirror: true,
        }
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::parse("1280x720\n"), Some(Resolution::new(1280, 720)));
        assert_eq!(Resolution::parse(" 640x480"), Some(Resolution::new(640, 480)));
        assert_eq!(Resolution::parse("0x480"), None);
        assert_eq!(Resolution::parse("1280"), None);
        assert_eq!(Resolution::parse("wide"), None);
    }

    #[test]
    fn test_fit_width() {
        assert_eq!(Resolution::new(1280, 720).fit_width(480), Resolution::new(480, 270));
        assert_eq!(Resolution::new(1920, 1080).fit_width(480), Resolution::new(480, 270));
        assert_eq!(Resolution::new(640, 480).fit_width(480), Resolution::new(480, 360));
        assert_eq!(Resolution::new(480, 270).fit_width(480), Resolution::new(480, 270));
    }

    #[test]
    fn test_parse_format_sizes() {
        let sizes = parse_format_sizes(FORMATS_EXT);
        assert_eq!(sizes.len(), 4);
        assert_eq!(sizes[0].fourcc, "MJPG");
        assert_eq!(sizes[0].size, Resolution::new(1280, 720));
        assert_eq!(sizes[3].fourcc, "YUYV");
        assert_eq!(sizes[3].size, Resolution::new(320, 240));
    }

    #[test]
    fn test_negotiate_prefers_720p() {
        let negotiated = negotiate_from_formats(&parse_format_sizes(FORMATS_EXT), 480).unwrap();
        assert_eq!(
            negotiated.caps.as_deref(),
            Some("image/jpeg,width=1280,height=720")
        );
        assert_eq!(negotiated.output, Resolution::new(480, 270));
    }

    #[test]
    fn test_negotiate_four_by_three_camera() {
        let formats = vec![FormatSize {
            fourcc: "YUYV".into(),
            size: Resolution::new(640, 480),
        }];
        let negotiated = negotiate_from_formats(&formats, 480).unwrap();
        assert_eq!(negotiated.caps.as_deref(), Some("video/x-raw,width=640,height=480"));
        assert_eq!(negotiated.output, Resolution::new(480, 360));
    }

    #[test]
    fn test_negotiate_unknown_sizes() {
        let formats = vec![FormatSize {
            fourcc: "YUYV".into(),
            size: Resolution::new(1024, 768),
        }];
        assert_eq!(negotiate_from_formats(&formats, 480), None);
        assert_eq!(negotiate_from_formats(&[], 480), None);
    }

    #[test]
    fn test_negotiate_from_monitor_picks_device_block() {
        let negotiated = negotiate_from_monitor(MONITOR, Path::new("/dev/video0"), 480).unwrap();
        assert_eq!(
            negotiated.caps.as_deref(),
            Some("image/jpeg,width=1280,height=720")
        );
        assert_eq!(negotiated.output, Resolution::new(480, 270));

        let other = negotiate_from_monitor(MONITOR, Path::new("/dev/video4"), 480).unwrap();
        assert_eq!(other.output, Resolution::new(480, 360));

        assert_eq!(negotiate_from_monitor(MONITOR, Path::new("/dev/video9"), 480), None);
    }

    #[test]
    fn test_negotiate_from_verbose_caps() {
        let output = "Setting pipeline to PAUSED ...
/GstPipeline:pipeline0/GstV4l2Src:v4l2src0.GstPad:src: caps = video/x-raw, format=(string)YUY2, width=(int)640, height=(int)480, framerate=(fraction)30/1
/GstPipeline:pipeline0/GstFakeSink:fakesink0.GstPad:sink: caps = video/x-raw, format=(string)YUY2, width=(int)1280, height=(int)720
";
        let negotiated = negotiate_from_verbose_caps(output, 480).unwrap();
        assert_eq!(negotiated.caps, None);
        assert_eq!(negotiated.source, Some(Resolution::new(640, 480)));
        assert_eq!(negotiated.output, Resolution::new(480, 360));
        assert_eq!(config(negotiated).resolution_marker(), Resolution::new(640, 480));

        assert_eq!(negotiate_from_verbose_caps("Setting pipeline to PAUSED ...\n", 480), None);
        assert_eq!(
            negotiate_from_verbose_caps("src: caps = video/x-raw, width=(int)0, height=(int)480\n", 480),
            None
        );
        assert_eq!(
            negotiate_from_verbose_caps("src: caps = video/x-raw, format=(string)YUY2\n", 480),
            None
        );
    }

    #[test]
    fn test_script_layout() {
        let negotiated = negotiate_from_formats(&parse_format_sizes(FORMATS_EXT), 480).unwrap();
        let script = config(negotiated).script();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("DEVICE='/dev/video0'\n"));
        assert!(script.contains("echo $$ > \"$WORK_DIR/pid\""));
        assert!(script.contains("echo GSTREAMER_MISSING > \"$WORK_DIR/camera_error\""));
        assert!(script.contains("echo DEVICE_NOT_FOUND > \"$WORK_DIR/camera_error\""));
        assert!(script.contains("echo PERMISSION_DENIED > \"$WORK_DIR/camera_error\""));
        assert!(script.contains("echo 1280x720 > \"$WORK_DIR/resolution\""));
        assert!(script.contains(
            "v4l2src device=\"$DEVICE\" ! image/jpeg,width=1280,height=720 ! decodebin"
        ));
        assert!(script.contains("video/x-raw,width=480,height=270"));
        assert!(script.contains("videoflip method=horizontal-flip ! jpegenc quality=85"));
        assert!(script.contains("frame_%05d.jpg\" max-files=5"));
        assert!(script.contains("echo CAMERA_ERROR > \"$WORK_DIR/camera_error\"; exit 1;"));

        // Prerequisite checks run before the resolution marker and the pipeline
        let missing = script.find("GSTREAMER_MISSING").unwrap();
        let resolution = script.find("/resolution").unwrap();
        let pipeline = script.find("gst-launch-1.0 -q").unwrap();
        assert!(missing < resolution && resolution < pipeline);
    }

    #[test]
    fn test_automatic_caps_have_no_filter() {
        let pipeline = config(Negotiated::automatic(480));
        assert_eq!(pipeline.resolution_marker(), Resolution::new(480, 270));
        let elements = pipeline.elements();
        assert_eq!(elements[0], "v4l2src device=\"$DEVICE\"");
        assert_eq!(elements[1], "decodebin");
    }

    #[test]
    fn test_device_path_is_quoted() {
        let mut pipeline = config(Negotiated::automatic(480));
        pipeline.device = PathBuf::from("/dev/it's here");
        assert!(pipeline.script().contains(r"DEVICE='/dev/it'\''s here'"));
    }

    // **Property: the preview box keeps the configured width and a 16:9 or 4:3 height**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_fit_width(w in 1u32..8000, h in 1u32..8000, preview in 16u32..2000) {
            let fitted = Resolution::new(w, h).fit_width(preview);
            prop_assert_eq!(fitted.width, preview);
            if u64::from(w) * 100 / u64::from(h) >= 150 {
                prop_assert_eq!(fitted.height, preview * 9 / 16);
            } else {
                prop_assert_eq!(fitted.height, preview * 3 / 4);
            }
        }
    }
}
