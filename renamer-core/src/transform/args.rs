//! ffmpeg argument builders for each transform kind.

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::BurnSection;
use crate::engine::{ProbeReport, StreamKind};
use crate::session::BurnStyle;

fn push_all(args: &mut Vec<String>, values: &[&str]) {
    args.extend(values.iter().map(|value| value.to_string()));
}

/// Copies every stream except the subtitle positions in `remove`, keeping the
/// probed order of what is retained.
pub fn remove_subtitles(probe: &ProbeReport, remove: &BTreeSet<u32>) -> Vec<String> {
    let mut args = Vec::new();
    let mut position = 0u32;
    for stream in &probe.streams {
        if stream.kind == StreamKind::Subtitle {
            let dropped = remove.contains(&position);
            position += 1;
            if dropped {
                continue;
            }
        }
        args.push("-map".to_string());
        args.push(format!("0:{}", stream.index));
    }
    push_all(&mut args, &["-map_metadata", "0", "-c", "copy"]);
    args
}

/// Subtitle codec the output container can carry as a timed-text stream.
pub fn soft_subtitle_codec(output: &Path) -> &'static str {
    let extension = output
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "m4v" | "mov" => "mov_text",
        "webm" => "webvtt",
        _ => "copy",
    }
}

/// Muxes input 1 as one more subtitle stream after the `existing` ones.
pub fn add_soft_subtitle(existing: usize, language: &str, output: &Path) -> Vec<String> {
    let mut args = Vec::new();
    push_all(
        &mut args,
        &["-map", "0", "-map", "1:0", "-map_metadata", "0", "-c", "copy"],
    );
    let codec = soft_subtitle_codec(output);
    if codec != "copy" {
        args.push(format!("-c:s:{existing}"));
        args.push(codec.to_string());
    }
    args.push(format!("-metadata:s:s:{existing}"));
    args.push(format!("language={language}"));
    args
}

/// Renders the subtitle file into the first video stream. Audio and existing
/// subtitle streams are copied.
pub fn burn_subtitle(subtitle: &Path, style: &BurnStyle, burn: &BurnSection) -> Vec<String> {
    let filter = format!(
        "subtitles='{}':force_style='{}'",
        escape_filter_path(subtitle),
        force_style(style, burn.margin_v)
    );
    let mut args = Vec::new();
    push_all(
        &mut args,
        &["-map", "0:v:0", "-map", "0:a?", "-map", "0:s?", "-vf"],
    );
    args.push(filter);
    push_all(&mut args, &["-c:a", "copy", "-c:s", "copy", "-c:v"]);
    args.push(burn.video_codec.clone());
    args.push("-crf".to_string());
    args.push(burn.crf.to_string());
    args.push("-preset".to_string());
    args.push(burn.preset.clone());
    args
}

pub fn force_style(style: &BurnStyle, margin_v: u32) -> String {
    let back = ass_colour(&style.background_color, (0, 0, 0));
    [
        format!("Fontsize={}", style.font_size),
        format!("PrimaryColour={}", ass_colour(&style.font_color, (255, 255, 255))),
        format!("OutlineColour={back}"),
        format!("BackColour={back}"),
        "BorderStyle=3".to_string(),
        "Outline=1".to_string(),
        "Shadow=0".to_string(),
        format!("Alignment={}", style.position.alignment()),
        format!("MarginV={}", style.position.margin(margin_v)),
    ]
    .join(",")
}

/// Rewrites title/author/artist/comment on the container and title on every
/// subtitle, audio and video stream, without re-encoding.
pub fn inject_metadata(value: &str) -> Vec<String> {
    let mut args = Vec::new();
    push_all(&mut args, &["-map", "0", "-c", "copy"]);
    for key in ["title", "author", "artist", "comment"] {
        args.push("-metadata".to_string());
        args.push(format!("{key}={value}"));
    }
    for selector in ["s", "a", "v"] {
        args.push(format!("-metadata:s:{selector}"));
        args.push(format!("title={value}"));
    }
    args
}

/// Parses `name`, `#RRGGBB` or `0xRRGGBB`, each with an optional `@opacity`
/// suffix in `0.0..=1.0`.
pub fn parse_colour(value: &str) -> Option<((u8, u8, u8), f32)> {
    let value = value.trim();
    let (colour, opacity) = match value.split_once('@') {
        Some((colour, opacity)) => (colour, opacity.trim().parse::<f32>().ok()?),
        None => (value, 1.0),
    };
    if !(0.0..=1.0).contains(&opacity) {
        return None;
    }
    let rgb = named_colour(colour).or_else(|| parse_hex_rgb(colour))?;
    Some((rgb, opacity))
}

fn named_colour(name: &str) -> Option<(u8, u8, u8)> {
    let rgb = match name.trim().to_ascii_lowercase().as_str() {
        "white" => (255, 255, 255),
        "black" => (0, 0, 0),
        "red" => (255, 0, 0),
        "green" => (0, 128, 0),
        "blue" => (0, 0, 255),
        "yellow" => (255, 255, 0),
        "cyan" => (0, 255, 255),
        "magenta" => (255, 0, 255),
        "gray" | "grey" => (128, 128, 128),
        "orange" => (255, 165, 0),
        _ => return None,
    };
    Some(rgb)
}

fn parse_hex_rgb(value: &str) -> Option<(u8, u8, u8)> {
    let normalized = value
        .trim()
        .trim_start_matches('#')
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if normalized.len() != 6 || !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    let r = u8::from_str_radix(&normalized[0..2], 16).ok()?;
    let g = u8::from_str_radix(&normalized[2..4], 16).ok()?;
    let b = u8::from_str_radix(&normalized[4..6], 16).ok()?;
    Some((r, g, b))
}

/// `&HAABBGGRR`, where alpha 00 is opaque.
pub fn ass_colour(value: &str, fallback: (u8, u8, u8)) -> String {
    let ((r, g, b), opacity) = parse_colour(value).unwrap_or((fallback, 1.0));
    let alpha = ((1.0 - opacity) * 255.0).round() as u8;
    format!("&H{alpha:02X}{b:02X}{g:02X}{r:02X}")
}

/// Escapes a path for use inside a single-quoted filter option. The graph
/// parser strips the quotes and the option parser then consumes one level of
/// backslashes. A quote cannot appear inside quotes, so it closes the quoted
/// run and is escaped for both levels.
pub fn escape_filter_path(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    let mut escaped = String::with_capacity(normalized.len() + 12);
    for ch in normalized.chars() {
        match ch {
            ':' => escaped.push_str("\\:"),
            '\'' => escaped.push_str(r"'\\\''"),
            ',' => escaped.push_str("\\,"),
            ';' => escaped.push_str("\\;"),
            '[' => escaped.push_str("\\["),
            ']' => escaped.push_str("\\]"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
