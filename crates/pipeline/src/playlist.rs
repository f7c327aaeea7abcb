use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info};

use crate::bundle::BundleLayout;
use crate::error::ComposeError;
use crate::planner::{AudioPlan, EncodePlan, SubtitlePlan};

const AUDIO_GROUP: &str = "audio";
const SUBTITLE_GROUP: &str = "subs";

/// A written master playlist
#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaylist {
    pub path: PathBuf,
    pub contents: String,
    pub audio_renditions: usize,
    pub subtitle_renditions: usize,
}

/// Variant-level attributes for the single STREAM-INF entry
#[derive(Debug, Clone, PartialEq)]
pub struct VariantInfo {
    pub bandwidth: u64,
    pub resolution: Option<(u32, u32)>,
    pub uri: String,
}

/// One EXT-X-MEDIA rendition
#[derive(Debug, Clone, PartialEq)]
pub struct Rendition {
    pub name: String,
    pub language: Option<String>,
    pub uri: String,
}

/// Render master playlist text. Deterministic: same input, same bytes.
///
/// The first audio rendition is the default. Group tags are omitted when empty.
pub fn render_master(variant: &VariantInfo, audio: &[Rendition], subtitles: &[Rendition]) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");

    for (i, r) in audio.iter().enumerate() {
        let default = if i == 0 { "YES" } else { "NO" };
        let _ = write!(out, "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{}\",NAME=\"{}\"", AUDIO_GROUP, attr(&r.name));
        if let Some(lang) = &r.language {
            let _ = write!(out, ",LANGUAGE=\"{}\"", attr(lang));
        }
        let _ = writeln!(out, ",DEFAULT={},AUTOSELECT=YES,URI=\"{}\"", default, attr(&r.uri));
    }

    for r in subtitles {
        let _ = write!(out, "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"{}\",NAME=\"{}\"", SUBTITLE_GROUP, attr(&r.name));
        if let Some(lang) = &r.language {
            let _ = write!(out, ",LANGUAGE=\"{}\"", attr(lang));
        }
        let _ = writeln!(out, ",DEFAULT=NO,AUTOSELECT=YES,URI=\"{}\"", attr(&r.uri));
    }

    let _ = write!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", variant.bandwidth);
    if let Some((w, h)) = variant.resolution {
        let _ = write!(out, ",RESOLUTION={}x{}", w, h);
    }
    if !audio.is_empty() {
        let _ = write!(out, ",AUDIO=\"{}\"", AUDIO_GROUP);
    }
    if !subtitles.is_empty() {
        let _ = write!(out, ",SUBTITLES=\"{}\"", SUBTITLE_GROUP);
    }
    out.push('\n');
    out.push_str(&variant.uri);
    out.push('\n');
    out
}

/// Quoted-string attribute values may not contain quotes or line breaks
fn attr(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '"' => '\'',
            '\r' | '\n' => ' ',
            c => c,
        })
        .collect()
}

fn audio_rendition(layout: &BundleLayout, plan: &AudioPlan) -> Rendition {
    let name = match &plan.title {
        Some(title) => format!("{} ({})", title, plan.language),
        None => format!("Audio {} ({})", plan.output_index + 1, plan.language),
    };
    Rendition {
        name,
        language: Some(plan.language.clone()),
        uri: layout.uri(&layout.audio_playlist(plan.output_index)),
    }
}

/// Media playlist with the whole WebVTT file as its only segment.
///
/// Players only accept media playlists as rendition URIs, not bare `.vtt` files.
pub fn render_subtitle_playlist(vtt_name: &str, duration_secs: Option<f64>) -> String {
    let duration = duration_secs.filter(|d| d.is_finite() && *d > 0.0).unwrap_or(0.0);
    let target = (duration.ceil() as u64).max(1);
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target);
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    let _ = writeln!(out, "#EXTINF:{:.3},", duration);
    out.push_str(vtt_name);
    out.push('\n');
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), ComposeError> {
    let tmp = path.with_extension("m3u8.tmp");
    fs::write(&tmp, contents).map_err(|source| ComposeError::Io { path: tmp.clone(), source })?;
    fs::rename(&tmp, path).map_err(|source| ComposeError::Io { path: path.to_path_buf(), source })
}

fn subtitle_rendition(layout: &BundleLayout, plan: &SubtitlePlan) -> Rendition {
    let name = match &plan.language {
        Some(lang) => format!("Subtitle {} ({})", plan.output_index + 1, lang),
        None => format!("Subtitle {}", plan.output_index + 1),
    };
    Rendition {
        name,
        language: plan.language.clone(),
        uri: layout.uri(&layout.subtitle_playlist(plan.output_index)),
    }
}

/// Write `master.m3u8` for the surviving units of `plan`.
///
/// Planned tracks whose output is missing on disk are left out. Each surviving
/// subtitle gets a wrapper playlist first. Every file is renamed into place so
/// readers never see a partial playlist.
pub fn compose(plan: &EncodePlan, bundle_root: &Path) -> Result<MasterPlaylist, ComposeError> {
    let layout = BundleLayout::new(bundle_root);
    let video_playlist = layout.video_playlist();
    let video = match &plan.video {
        Some(video) if video_playlist.is_file() => video,
        _ => return Err(ComposeError::MissingVideoPlaylist(video_playlist)),
    };

    let audio: Vec<Rendition> = plan
        .audio
        .iter()
        .filter(|a| layout.audio_playlist(a.output_index).is_file())
        .map(|a| audio_rendition(&layout, a))
        .collect();
    let mut subtitles = Vec::new();
    for s in plan.subtitles.iter().filter(|s| layout.subtitle_file(s.output_index).is_file()) {
        let vtt = layout.subtitle_file(s.output_index);
        let vtt_name = vtt.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        write_atomic(
            &layout.subtitle_playlist(s.output_index),
            &render_subtitle_playlist(&vtt_name, video.duration_secs),
        )?;
        subtitles.push(subtitle_rendition(&layout, s));
    }

    let variant = VariantInfo {
        bandwidth: video.bandwidth,
        resolution: video.resolution,
        uri: layout.uri(&video_playlist),
    };
    let contents = render_master(&variant, &audio, &subtitles);

    let path = layout.master_playlist();
    write_atomic(&path, &contents)?;

    debug!("Master playlist:\n{}", contents);
    info!(
        "📝 Wrote {} ({} audio, {} subtitle renditions)",
        path.display(),
        audio.len(),
        subtitles.len()
    );

    Ok(MasterPlaylist {
        path,
        contents,
        audio_renditions: audio.len(),
        subtitle_renditions: subtitles.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{TrackAction, VideoPlan};
    use proptest::prelude::*;

    fn plan(audio_count: usize, subtitle_count: usize) -> EncodePlan {
        EncodePlan {
            video: Some(VideoPlan {
                source_index: 0,
                action: TrackAction::Transcode,
                codec: "hevc".to_string(),
                resolution: Some((1280, 720)),
                bandwidth: 2_500_000,
                duration_secs: Some(95.25),
            }),
            audio: (0..audio_count)
                .map(|i| AudioPlan {
                    source_index: i as u32 + 1,
                    output_index: i,
                    action: TrackAction::Copy,
                    language: ["eng", "hin", "tam"][i % 3].to_string(),
                    codec: "aac".to_string(),
                    title: None,
                })
                .collect(),
            subtitles: (0..subtitle_count)
                .map(|i| SubtitlePlan { source_index: 10 + i as u32, output_index: i, language: None })
                .collect(),
        }
    }

    fn write_outputs(layout: &BundleLayout, audio: &[usize], subtitles: &[usize]) {
        layout.prepare(audio, !subtitles.is_empty()).unwrap();
        fs::write(layout.video_playlist(), "#EXTM3U\n").unwrap();
        for i in audio {
            fs::write(layout.audio_playlist(*i), "#EXTM3U\n").unwrap();
        }
        for i in subtitles {
            fs::write(layout.subtitle_file(*i), "WEBVTT\n").unwrap();
        }
    }

    #[test]
    fn test_render_full_master() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BundleLayout::new(tmp.path());
        write_outputs(&layout, &[0, 1], &[0]);

        let master = compose(&plan(2, 1), tmp.path()).unwrap();
        let expected = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"Audio 1 (eng)\",LANGUAGE=\"eng\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio_0/playlist.m3u8\"\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"Audio 2 (hin)\",LANGUAGE=\"hin\",DEFAULT=NO,AUTOSELECT=YES,URI=\"audio_1/playlist.m3u8\"\n\
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"Subtitle 1\",DEFAULT=NO,AUTOSELECT=YES,URI=\"subtitles/sub_0.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,AUDIO=\"audio\",SUBTITLES=\"subs\"\n\
video/playlist.m3u8\n";
        assert_eq!(master.contents, expected);
        assert_eq!(fs::read_to_string(layout.master_playlist()).unwrap(), expected);
        assert!(!tmp.path().join("master.m3u8.tmp").exists());

        let wrapper = fs::read_to_string(layout.subtitle_playlist(0)).unwrap();
        assert_eq!(
            wrapper,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:96\n#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:95.250,\nsub_0.vtt\n#EXT-X-ENDLIST\n"
        );
    }

    #[test]
    fn test_missing_tracks_are_omitted() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = BundleLayout::new(tmp.path());
        // Audio 1 and the subtitle never produced output
        write_outputs(&layout, &[0, 2], &[]);

        let master = compose(&plan(3, 1), tmp.path()).unwrap();
        assert_eq!(master.audio_renditions, 2);
        assert_eq!(master.subtitle_renditions, 0);
        assert!(!master.contents.contains("audio_1/"));
        assert!(!master.contents.contains("SUBTITLES"));
        assert!(!layout.subtitle_playlist(0).exists());
        assert_eq!(master.contents.matches("DEFAULT=YES").count(), 1);
        assert!(master.contents.contains("DEFAULT=YES,AUTOSELECT=YES,URI=\"audio_0/playlist.m3u8\""));
    }

    #[test]
    fn test_no_audio_omits_group() {
        let tmp = tempfile::tempdir().unwrap();
        write_outputs(&BundleLayout::new(tmp.path()), &[], &[]);

        let master = compose(&plan(0, 0), tmp.path()).unwrap();
        assert!(!master.contents.contains("TYPE=AUDIO"));
        assert!(!master.contents.contains("AUDIO=\"audio\""));
        assert!(master.contents.ends_with("#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\nvideo/playlist.m3u8\n"));
    }

    #[test]
    fn test_missing_video_playlist() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            compose(&plan(1, 0), tmp.path()),
            Err(ComposeError::MissingVideoPlaylist(_))
        ));
        assert!(!tmp.path().join("master.m3u8").exists());
    }

    #[test]
    fn test_compose_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        write_outputs(&BundleLayout::new(tmp.path()), &[0, 1, 2], &[0, 1]);
        let first = compose(&plan(3, 2), tmp.path()).unwrap();
        let second = compose(&plan(3, 2), tmp.path()).unwrap();
        assert_eq!(first.contents, second.contents);
    }

    #[test]
    fn test_attribute_values_sanitized() {
        let variant = VariantInfo { bandwidth: 1, resolution: None, uri: "video/playlist.m3u8".to_string() };
        let audio = vec![Rendition {
            name: "Director's \"cut\"\nmix".to_string(),
            language: None,
            uri: "audio_0/playlist.m3u8".to_string(),
        }];
        let text = render_master(&variant, &audio, &[]);
        assert!(text.contains("NAME=\"Director's 'cut' mix\""));
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn test_subtitle_playlist_without_duration() {
        let text = render_subtitle_playlist("sub_2.vtt", None);
        assert!(text.contains("#EXT-X-TARGETDURATION:1\n"));
        assert!(text.contains("#EXTINF:0.000,\nsub_2.vtt\n"));
        assert!(text.ends_with("#EXT-X-ENDLIST\n"));
    }

    fn rendition_strategy(prefix: &'static str) -> impl Strategy<Value = Rendition> {
        (0usize..8, proptest::option::of("[a-z]{2,3}"), "[A-Za-z \"\n]{0,12}").prop_map(move |(i, language, name)| {
            Rendition {
                name,
                language,
                uri: format!("{}_{}/playlist.m3u8", prefix, i),
            }
        })
    }

    proptest! {
        #[test]
        fn prop_render_master_is_deterministic(
            bandwidth in 1u64..50_000_000,
            resolution in proptest::option::of((1u32..8000, 1u32..8000)),
            audio in proptest::collection::vec(rendition_strategy("audio"), 0..5),
            subtitles in proptest::collection::vec(rendition_strategy("subtitles/sub"), 0..4),
        ) {
            let variant = VariantInfo { bandwidth, resolution, uri: "video/playlist.m3u8".to_string() };
            let first = render_master(&variant, &audio, &subtitles);
            let second = render_master(&variant.clone(), &audio.clone(), &subtitles.clone());
            prop_assert_eq!(&first, &second);

            let defaults = first.matches("DEFAULT=YES").count();
            prop_assert_eq!(defaults, usize::from(!audio.is_empty()));
            prop_assert_eq!(first.matches("TYPE=AUDIO").count(), audio.len());
            prop_assert_eq!(first.matches("TYPE=SUBTITLES").count(), subtitles.len());
            prop_assert_eq!(first.matches("#EXT-X-STREAM-INF").count(), 1);
            // Sanitized names never add lines
            prop_assert_eq!(first.lines().count(), 4 + audio.len() + subtitles.len());
        }
    }
}
