//! Parsers for the capability-query utility's textual output.
//!
//! All three parsers are total: malformed or unknown input degrades to
//! defaults, never to an error. The reconciler treats "parsed nothing" as
//! a diagnostic (counted as a parse error) rather than a failure, because
//! utility output varies across driver versions and a half-parsed device
//! is still more useful than no device.
//!
//! Capability lines are tokenized by whitespace after the first colon, so
//! `Capabilities : Video Capture Streaming 0x85200001` yields the four
//! tokens `Video`, `Capture`, `Streaming`, `0x85200001`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::{DeviceCapabilities, DeviceFormat};

static FORMAT_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[\d+\]:\s*'([^']+)'").unwrap());
static SIZE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Size\s*:\s*Discrete\s+(\S+)").unwrap());
static INTERVAL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Interval\s*:\s*Discrete\s+[0-9.]+s\s*\(([0-9.]+)\s*fps\)").unwrap());

static INDEX_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*Index\s*:\s*\d+").unwrap());
static NAME_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*Name\s*:\s*(\S+)").unwrap());
static FPS_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*fps\s*:\s*([0-9.]+)").unwrap());

/// Patterns that carry a frame rate, with the rate in capture group 1.
///
/// The reciprocal forms (`[1/30]`, `1/30 s`) capture the denominator,
/// which for a one-second numerator *is* the rate.
static RATE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\(([0-9]+(?:\.[0-9]+)?)\s*fps\)").unwrap(),
        Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*fps\b").unwrap(),
        Regex::new(r"[Ff]rame\s*rate\s*:\s*([0-9]+(?:\.[0-9]+)?)").unwrap(),
        Regex::new(r"@([0-9]+(?:\.[0-9]+)?)").unwrap(),
        Regex::new(r"\[1/([0-9]+(?:\.[0-9]+)?)\]").unwrap(),
        Regex::new(r"\b1/([0-9]+(?:\.[0-9]+)?)\s*s\b").unwrap(),
        Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*frames\s+per\s+second").unwrap(),
    ]
});

/// Accepted frame-rate range in Hz.
const RATE_MIN: f64 = 1.0;
const RATE_MAX: f64 = 300.0;

/// Parse the `--all` capability dump into a [`DeviceCapabilities`] block.
pub fn parse_device_info(text: &str) -> DeviceCapabilities {
    let mut caps = DeviceCapabilities {
        driver_name: String::new(),
        card_name: String::new(),
        ..DeviceCapabilities::default()
    };

    for raw in text.lines() {
        let line = raw.trim();
        if let Some(value) = value_for_prefix(line, "Driver name") {
            caps.driver_name = value.to_string();
        } else if let Some(value) =
            value_for_prefix(line, "Card type").or_else(|| value_for_prefix(line, "Device name"))
        {
            caps.card_name = value.to_string();
        } else if let Some(value) = value_for_prefix(line, "Bus info") {
            caps.bus_info = value.to_string();
        } else if let Some(value) = value_for_prefix(line, "Driver version") {
            caps.version = value.to_string();
        } else if line.contains("Device Caps") {
            if let Some(tail) = colon_tail(line) {
                caps.device_caps
                    .extend(tail.split_whitespace().map(str::to_string));
            }
        } else if line.contains("Capabilities") {
            if let Some(tail) = colon_tail(line) {
                caps.capabilities
                    .extend(tail.split_whitespace().map(str::to_string));
            }
        }
    }

    if caps.driver_name.is_empty() {
        caps.driver_name = "unknown".to_string();
    }
    if caps.card_name.is_empty() {
        caps.card_name = "Unknown Video Device".to_string();
    }
    caps
}

/// Parse the `--list-formats-ext` dump into format records.
///
/// The primary grammar is the V4L2 shape (`[N]: 'PIX' (…)` headers with
/// nested `Size:`/`Interval:` lines). The `Index:`/`Name:` block grammar
/// is consulted only when the primary grammar matched nothing.
pub fn parse_device_formats(text: &str) -> Vec<DeviceFormat> {
    let primary = parse_formats_primary(text);
    if !primary.is_empty() {
        return primary;
    }
    parse_formats_secondary(text)
}

fn parse_formats_primary(text: &str) -> Vec<DeviceFormat> {
    let mut formats = Vec::new();
    let mut pixel_format: Option<String> = None;
    let mut current: Option<DeviceFormat> = None;

    for line in text.lines() {
        if let Some(header) = FORMAT_HEADER.captures(line) {
            if let Some(done) = current.take() {
                formats.push(done);
            }
            pixel_format = Some(header[1].to_string());
        } else if let Some(size) = SIZE_LINE.captures(line) {
            if let Some(done) = current.take() {
                formats.push(done);
            }
            if let Some(pix) = &pixel_format {
                // Unparseable dimensions keep the record with 0x0.
                let (width, height) = parse_dimensions(&size[1]).unwrap_or((0, 0));
                current = Some(DeviceFormat {
                    pixel_format: pix.clone(),
                    width,
                    height,
                    frame_rates: Vec::new(),
                });
            }
        } else if let Some(interval) = INTERVAL_LINE.captures(line) {
            if let Some(record) = current.as_mut() {
                record.frame_rates.push(normalize_rate_string(&interval[1]));
            }
        }
    }

    if let Some(done) = current.take() {
        formats.push(done);
    }
    formats
}

fn parse_formats_secondary(text: &str) -> Vec<DeviceFormat> {
    let mut formats = Vec::new();
    let mut current: Option<DeviceFormat> = None;

    for line in text.lines() {
        if INDEX_LINE.is_match(line) {
            if let Some(done) = current.take() {
                formats.push(done);
            }
        } else if let Some(name) = NAME_LINE.captures(line) {
            if let Some(done) = current.take() {
                formats.push(done);
            }
            current = Some(DeviceFormat {
                pixel_format: name[1].to_string(),
                width: 0,
                height: 0,
                frame_rates: Vec::new(),
            });
        } else if let Some(size) = SIZE_LINE.captures(line) {
            if let Some(record) = current.as_mut() {
                let (width, height) = parse_dimensions(&size[1]).unwrap_or((0, 0));
                record.width = width;
                record.height = height;
            }
        } else if let Some(fps) = FPS_LINE.captures(line) {
            if let Some(record) = current.as_mut() {
                record.frame_rates.push(normalize_rate_string(&fps[1]));
            }
        }
    }

    if let Some(done) = current.take() {
        formats.push(done);
    }
    formats
}

/// Extract frame rates from free-form text.
///
/// Candidates from every recognized form are collected in text order,
/// accepted iff they represent a real number in `[1, 300]`, emitted with
/// three decimals, and de-duplicated in order of first appearance.
pub fn parse_device_frame_rates(text: &str) -> Vec<String> {
    let mut candidates: Vec<(usize, f64)> = Vec::new();
    for pattern in RATE_PATTERNS.iter() {
        for captures in pattern.captures_iter(text) {
            if let Some(group) = captures.get(1) {
                if let Ok(value) = group.as_str().parse::<f64>() {
                    candidates.push((group.start(), value));
                }
            }
        }
    }
    candidates.sort_by_key(|(pos, _)| *pos);

    let mut rates = Vec::new();
    for (_, value) in candidates {
        if !(RATE_MIN..=RATE_MAX).contains(&value) {
            continue;
        }
        let formatted = format!("{value:.3}");
        if !rates.contains(&formatted) {
            rates.push(formatted);
        }
    }
    rates
}

fn value_for_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if !line.starts_with(prefix) {
        return None;
    }
    colon_tail(line)
}

fn colon_tail(line: &str) -> Option<&str> {
    line.split_once(':').map(|(_, tail)| tail.trim())
}

fn parse_dimensions(token: &str) -> Option<(u32, u32)> {
    let (w, h) = token.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn normalize_rate_string(raw: &str) -> String {
    match raw.parse::<f64>() {
        Ok(value) => format!("{value:.3}"),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primary_capability_block() {
        let text = "Driver name     : uvcvideo\n\
                    Card type       : USB 2.0 Camera\n\
                    Bus info        : usb-0000:00:14.0-1\n\
                    Driver version  : 5.15.0\n\
                    Capabilities    : Video Capture Streaming 0x85200001\n\
                    Device Caps     : Video Capture Streaming 0x04200001\n";
        let caps = parse_device_info(text);
        assert_eq!(caps.driver_name, "uvcvideo");
        assert_eq!(caps.card_name, "USB 2.0 Camera");
        assert_eq!(caps.bus_info, "usb-0000:00:14.0-1");
        assert_eq!(caps.version, "5.15.0");
        assert_eq!(
            caps.capabilities,
            vec!["Video", "Capture", "Streaming", "0x85200001"]
        );
        assert_eq!(
            caps.device_caps,
            vec!["Video", "Capture", "Streaming", "0x04200001"]
        );
    }

    #[test]
    fn device_name_is_an_alias_for_card_type() {
        let caps = parse_device_info("Device name : Integrated IR Camera\n");
        assert_eq!(caps.card_name, "Integrated IR Camera");
    }

    #[test]
    fn empty_info_gets_defaults() {
        let caps = parse_device_info("");
        assert_eq!(caps.driver_name, "unknown");
        assert_eq!(caps.card_name, "Unknown Video Device");
        assert!(caps.capabilities.is_empty());
        assert!(caps.device_caps.is_empty());
    }

    #[test]
    fn parses_two_format_v4l2_dump() {
        let text = "[0]: 'YUYV' (YUYV 4:2:2)\n\
                    \tSize: Discrete 640x480\n\
                    \t\tInterval: Discrete 0.033s (30.000 fps)\n\
                    \t\tInterval: Discrete 0.050s (20.000 fps)\n\
                    \tSize: Discrete 1280x720\n\
                    \t\tInterval: Discrete 0.033s (30.000 fps)\n\
                    [1]: 'MJPG' (Motion-JPEG)\n\
                    \tSize: Discrete 1920x1080\n\
                    \t\tInterval: Discrete 0.033s (30.000 fps)\n";
        let formats = parse_device_formats(text);
        assert_eq!(formats.len(), 3);

        assert_eq!(formats[0].pixel_format, "YUYV");
        assert_eq!((formats[0].width, formats[0].height), (640, 480));
        assert_eq!(formats[0].frame_rates, vec!["30.000", "20.000"]);

        assert_eq!(formats[1].pixel_format, "YUYV");
        assert_eq!((formats[1].width, formats[1].height), (1280, 720));
        assert_eq!(formats[1].frame_rates, vec!["30.000"]);

        assert_eq!(formats[2].pixel_format, "MJPG");
        assert_eq!((formats[2].width, formats[2].height), (1920, 1080));
        assert_eq!(formats[2].frame_rates, vec!["30.000"]);
    }

    #[test]
    fn invalid_size_token_keeps_record_at_zero() {
        let text = "[0]: 'YUYV' (YUYV 4:2:2)\n\
                    \tSize: Discrete garbage\n\
                    \t\tInterval: Discrete 0.033s (30.000 fps)\n";
        let formats = parse_device_formats(text);
        assert_eq!(formats.len(), 1);
        assert_eq!((formats[0].width, formats[0].height), (0, 0));
        assert_eq!(formats[0].frame_rates, vec!["30.000"]);
    }

    #[test]
    fn secondary_grammar_used_when_primary_matches_nothing() {
        let text = "Index : 0\n\
                    Name : YUYV\n\
                    Size : Discrete 640x480\n\
                    fps : 30\n\
                    fps : 15\n\
                    Index : 1\n\
                    Name : MJPG\n\
                    Size : Discrete 1280x720\n\
                    fps : 25\n";
        let formats = parse_device_formats(text);
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].pixel_format, "YUYV");
        assert_eq!((formats[0].width, formats[0].height), (640, 480));
        assert_eq!(formats[0].frame_rates, vec!["30.000", "15.000"]);
        assert_eq!(formats[1].pixel_format, "MJPG");
        assert_eq!(formats[1].frame_rates, vec!["25.000"]);
    }

    #[test]
    fn empty_format_dump_yields_no_records() {
        assert!(parse_device_formats("").is_empty());
        assert!(parse_device_formats("no formats here").is_empty());
    }

    #[test]
    fn out_of_range_rates_are_rejected() {
        let text = "Interval: Discrete 0.001s (1000.000 fps)\n\
                    Interval: Discrete 0.033s (30.000 fps)";
        assert_eq!(parse_device_frame_rates(text), vec!["30.000"]);
    }

    #[test]
    fn recognizes_all_rate_forms() {
        assert_eq!(parse_device_frame_rates("(30.000 fps)"), vec!["30.000"]);
        assert_eq!(parse_device_frame_rates("30 fps"), vec!["30.000"]);
        assert_eq!(parse_device_frame_rates("Frame rate: 25"), vec!["25.000"]);
        assert_eq!(parse_device_frame_rates("@60"), vec!["60.000"]);
        assert_eq!(parse_device_frame_rates("[1/30]"), vec!["30.000"]);
        assert_eq!(parse_device_frame_rates("1/30 s"), vec!["30.000"]);
        assert_eq!(
            parse_device_frame_rates("30 frames per second"),
            vec!["30.000"]
        );
    }

    #[test]
    fn rates_deduplicate_in_first_appearance_order() {
        let text = "(30.000 fps) then 25 fps then 30 fps again";
        assert_eq!(parse_device_frame_rates(text), vec!["30.000", "25.000"]);
    }

    #[test]
    fn rate_range_bounds_are_inclusive() {
        assert_eq!(parse_device_frame_rates("1 fps"), vec!["1.000"]);
        assert_eq!(parse_device_frame_rates("300 fps"), vec!["300.000"]);
        assert!(parse_device_frame_rates("0.5 fps").is_empty());
        assert!(parse_device_frame_rates("301 fps").is_empty());
    }

    #[test]
    fn empty_rate_input_is_total() {
        assert!(parse_device_frame_rates("").is_empty());
    }
}
